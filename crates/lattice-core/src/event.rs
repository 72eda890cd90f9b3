use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::binding::{Bound, bind, field};

/// Membership of the local user in a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum JoinState {
    Invited,
    #[default]
    Joined,
    Left,
}

/// A room event as delivered in a timeline or state section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoomEvent {
    /// Absent only for stripped state in invites.
    pub event_id: Option<String>,
    pub event_type: String,
    pub sender: String,
    pub origin_server_ts: u64,
    /// Present on state-bearing events.
    pub state_key: Option<String>,
    pub content: Map<String, Value>,
}

impl RoomEvent {
    /// Bind a timeline event. Requires `event_id`, `type` and `sender`.
    pub fn from_timeline(raw: &Value) -> Bound<Self> {
        let mut event = Self::default();
        let mut event_id = String::new();
        let report = bind(
            raw,
            vec![
                field("event_id", &mut event_id),
                field("type", &mut event.event_type),
                field("sender", &mut event.sender),
                field("origin_server_ts", &mut event.origin_server_ts),
                field("state_key", &mut event.state_key),
                field("content", &mut event.content),
            ],
        );
        if !report.has_failed("event_id") {
            event.event_id = Some(event_id);
        }
        report.into_bound(event, &["event_id", "type", "sender"])
    }

    /// Bind a state event. Requires `type`, `state_key` and `content`.
    pub fn from_state(raw: &Value) -> Bound<Self> {
        let mut event = Self::default();
        let report = bind(
            raw,
            vec![
                field("event_id", &mut event.event_id),
                field("type", &mut event.event_type),
                field("sender", &mut event.sender),
                field("origin_server_ts", &mut event.origin_server_ts),
                field("state_key", &mut event.state_key),
                field("content", &mut event.content),
            ],
        );
        let valid_key = event.state_key.is_some();
        let mut bound = report.into_bound(event, &["type", "state_key", "content"]);
        // `"state_key": null` binds cleanly but is not a state event.
        if !valid_key && bound.valid {
            bound.valid = false;
            bound.failed.push("state_key".to_owned());
        }
        bound
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// Message body for `m.room.message` events.
    pub fn body(&self) -> Option<&str> {
        self.content_str("body")
    }
}

/// A non-persistent room event such as typing notifications or receipts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EphemeralEvent {
    pub event_type: String,
    pub content: Map<String, Value>,
}

impl EphemeralEvent {
    pub fn from_json(raw: &Value) -> Bound<Self> {
        let mut event = Self::default();
        bind(
            raw,
            vec![
                field("type", &mut event.event_type),
                field("content", &mut event.content),
            ],
        )
        .into_bound(event, &["type", "content"])
    }
}
