//! Parsing of one `/sync` response into a per-room increment.

use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    binding::{Bound, bind, field, nested},
    event::{EphemeralEvent, JoinState, RoomEvent},
};

/// Server-reported unread counters for one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub highlight_count: Option<u64>,
    pub notification_count: Option<u64>,
}

/// New data for one room within one sync round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRoom {
    pub room_id: String,
    pub join_state: JoinState,
    pub state: Vec<RoomEvent>,
    pub timeline: Vec<RoomEvent>,
    pub ephemeral: Vec<EphemeralEvent>,
    /// Present only when the server sent `unread_notifications`.
    pub unread: Option<UnreadCounts>,
    /// Cursor for loading events older than this timeline chunk.
    pub prev_batch: Option<String>,
    /// Malformed events dropped while parsing.
    pub skipped: usize,
}

/// One sync round, stamped with its issuance order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncIncrement {
    /// Issuance sequence number; higher means newer.
    pub seq: u64,
    pub next_batch: String,
    pub rooms: Vec<SyncRoom>,
}

impl SyncIncrement {
    /// Build an increment from the `rooms` object of a sync response.
    pub fn parse(seq: u64, next_batch: impl Into<String>, rooms: &Value) -> Self {
        let mut parsed = Vec::new();
        for (section, join_state) in [
            ("invite", JoinState::Invited),
            ("join", JoinState::Joined),
            ("leave", JoinState::Left),
        ] {
            let Some(entries) = rooms.get(section).and_then(Value::as_object) else {
                continue;
            };
            for (room_id, payload) in entries {
                parsed.push(SyncRoom::parse(room_id, join_state, payload));
            }
        }

        Self {
            seq,
            next_batch: next_batch.into(),
            rooms: parsed,
        }
    }

    pub fn skipped(&self) -> usize {
        self.rooms.iter().map(|room| room.skipped).sum()
    }
}

impl SyncRoom {
    pub fn parse(room_id: &str, join_state: JoinState, payload: &Value) -> Self {
        let mut state: Vec<Value> = Vec::new();
        let mut timeline: Vec<Value> = Vec::new();
        let mut ephemeral: Vec<Value> = Vec::new();
        let mut prev_batch: Option<String> = None;
        let mut unread: Option<Map<String, Value>> = None;

        let state_section = match join_state {
            JoinState::Invited => "invite_state",
            JoinState::Joined | JoinState::Left => "state",
        };
        bind(
            payload,
            vec![
                nested(state_section, vec![field("events", &mut state)]),
                nested(
                    "timeline",
                    vec![
                        field("events", &mut timeline),
                        field("prev_batch", &mut prev_batch),
                    ],
                ),
                nested("ephemeral", vec![field("events", &mut ephemeral)]),
                field("unread_notifications", &mut unread),
            ],
        );

        let mut room = Self {
            room_id: room_id.to_owned(),
            join_state,
            prev_batch,
            unread: unread.map(|counts| parse_unread(&Value::Object(counts))),
            ..Self::default()
        };
        room.state = collect(room_id, "state", &state, RoomEvent::from_state, &mut room.skipped);
        room.timeline = collect(
            room_id,
            "timeline",
            &timeline,
            RoomEvent::from_timeline,
            &mut room.skipped,
        );
        room.ephemeral = collect(
            room_id,
            "ephemeral",
            &ephemeral,
            EphemeralEvent::from_json,
            &mut room.skipped,
        );
        room
    }
}

fn parse_unread(raw: &Value) -> UnreadCounts {
    let mut counts = UnreadCounts::default();
    bind(
        raw,
        vec![
            field("highlight_count", &mut counts.highlight_count),
            field("notification_count", &mut counts.notification_count),
        ],
    );
    counts
}

fn collect<T>(
    room_id: &str,
    section: &str,
    raw: &[Value],
    parse: impl Fn(&Value) -> Bound<T>,
    skipped: &mut usize,
) -> Vec<T> {
    raw.iter()
        .filter_map(|value| match parse(value).into_result() {
            Ok(event) => Some(event),
            Err(failed) => {
                *skipped += 1;
                warn!(room_id, section, failed = ?failed, "skipping malformed event");
                None
            }
        })
        .collect()
}
