//! In-memory model of one room and the rules for applying sync data to it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    event::{EphemeralEvent, JoinState, RoomEvent},
    sync::SyncRoom,
    timeline::Timeline,
    types::{MemberInfo, RoomSnapshot, RoomSummary},
};

const NAME: &str = "m.room.name";
const TOPIC: &str = "m.room.topic";
const CANONICAL_ALIAS: &str = "m.room.canonical_alias";
const ALIASES: &str = "m.room.aliases";
const MEMBER: &str = "m.room.member";
const MESSAGE: &str = "m.room.message";
const TYPING: &str = "m.typing";
const RECEIPT: &str = "m.receipt";

/// Observable change to a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomChange {
    NewMessage(RoomEvent),
    /// Name, canonical alias or aliases changed.
    NamesChanged,
    TopicChanged,
    /// The computed display name changed; carries the new name.
    DisplayNameChanged(String),
    UserAdded { user_id: String },
    UserRemoved { user_id: String },
    MemberRenamed {
        user_id: String,
        old_name: Option<String>,
        new_name: Option<String>,
    },
    JoinStateChanged { old: JoinState, new: JoinState },
    /// Sorted user IDs currently typing.
    TypingChanged(Vec<String>),
    HighlightCountChanged(u64),
    NotificationCountChanged(u64),
    ReadMarkerMoved { user_id: String, event_id: String },
}

#[derive(Debug, Clone)]
struct StateEntry {
    event: RoomEvent,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NameSet {
    name: Option<String>,
    canonical_alias: Option<String>,
    aliases: Vec<String>,
}

/// One room: state, timeline, members, receipts and counters.
#[derive(Debug, Clone)]
pub struct Room {
    room_id: String,
    join_state: JoinState,
    state: HashMap<(String, String), StateEntry>,
    timeline: Timeline,
    members: BTreeMap<String, MemberInfo>,
    read_markers: HashMap<String, String>,
    typing: Vec<String>,
    notification_count: u64,
    highlight_count: u64,
    prev_batch: Option<String>,
}

impl Room {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            join_state: JoinState::default(),
            state: HashMap::new(),
            timeline: Timeline::new(),
            members: BTreeMap::new(),
            read_markers: HashMap::new(),
            typing: Vec::new(),
            notification_count: 0,
            highlight_count: 0,
            prev_batch: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn join_state(&self) -> JoinState {
        self.join_state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn notification_count(&self) -> u64 {
        self.notification_count
    }

    pub fn highlight_count(&self) -> u64 {
        self.highlight_count
    }

    pub fn prev_batch(&self) -> Option<&str> {
        self.prev_batch.as_deref()
    }

    /// Sorted user IDs currently typing.
    pub fn typing(&self) -> &[String] {
        &self.typing
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values()
    }

    pub fn member(&self, user_id: &str) -> Option<&MemberInfo> {
        self.members.get(user_id)
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&RoomEvent> {
        self.state
            .get(&(event_type.to_owned(), state_key.to_owned()))
            .map(|entry| &entry.event)
    }

    pub fn read_marker(&self, user_id: &str) -> Option<&str> {
        self.read_markers.get(user_id).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.state_str(NAME, "", "name")
    }

    pub fn topic(&self) -> Option<&str> {
        self.state_str(TOPIC, "", "topic")
    }

    pub fn canonical_alias(&self) -> Option<&str> {
        self.state_str(CANONICAL_ALIAS, "", "alias")
    }

    /// Aliases from every server's `m.room.aliases` event, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .state
            .iter()
            .filter(|((event_type, _), _)| event_type == ALIASES)
            .filter_map(|(_, entry)| entry.event.content.get("aliases"))
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect();
        aliases.sort();
        aliases.dedup();
        aliases
    }

    /// Name for display: explicit name, then canonical alias, then first
    /// alias, then up to two other members, then the room ID.
    pub fn display_name(&self, own_user_id: Option<&str>) -> String {
        if let Some(name) = self.name().filter(|name| !name.is_empty()) {
            return name.to_owned();
        }
        if let Some(alias) = self.canonical_alias().filter(|alias| !alias.is_empty()) {
            return alias.to_owned();
        }
        if let Some(alias) = self.aliases().into_iter().next() {
            return alias;
        }

        let others: Vec<&str> = self
            .members
            .values()
            .filter(|member| Some(member.user_id.as_str()) != own_user_id)
            .map(MemberInfo::label)
            .collect();
        match others.as_slice() {
            [] => self.room_id.clone(),
            [one] => (*one).to_owned(),
            [first, second] => format!("{first} and {second}"),
            [first, rest @ ..] => format!("{first} and {} others", rest.len()),
        }
    }

    /// Apply one room's share of a sync increment.
    ///
    /// Order is join state, state events, timeline, then ephemeral events.
    pub fn apply_sync(
        &mut self,
        update: &SyncRoom,
        seq: u64,
        own_user_id: Option<&str>,
    ) -> Vec<RoomChange> {
        let mut changes = Vec::new();
        let display_before = self.display_name(own_user_id);
        let names_before = self.name_set();
        let topic_before = self.topic().map(ToOwned::to_owned);
        let counts_before = (self.notification_count, self.highlight_count);

        if let Some(change) = self.set_join_state(update.join_state) {
            changes.push(change);
        }

        for event in &update.state {
            self.apply_state_event(event, seq, &mut changes);
        }

        if self.prev_batch.is_none() {
            self.prev_batch = update.prev_batch.clone();
        }

        for event in &update.timeline {
            if !self.timeline.append(event.clone()) {
                debug!(room_id = %self.room_id, event_id = ?event.event_id, "skipping duplicate timeline event");
                continue;
            }
            if event.is_state() {
                self.apply_state_event(event, seq, &mut changes);
            }
            if update.unread.is_none() {
                self.count_unread(event, own_user_id);
            }
            changes.push(RoomChange::NewMessage(event.clone()));
        }

        if self.name_set() != names_before {
            changes.push(RoomChange::NamesChanged);
        }
        if self.topic() != topic_before.as_deref() {
            changes.push(RoomChange::TopicChanged);
        }
        self.push_display_name_change(&display_before, own_user_id, &mut changes);

        if let Some(unread) = update.unread {
            if let Some(count) = unread.notification_count {
                self.notification_count = count;
            }
            if let Some(count) = unread.highlight_count {
                self.highlight_count = count;
            }
        }
        self.push_count_changes(counts_before, &mut changes);

        for event in &update.ephemeral {
            self.apply_ephemeral(event, &mut changes);
        }

        changes
    }

    /// Replace the join state; reports the transition when it changes.
    pub fn set_join_state(&mut self, new: JoinState) -> Option<RoomChange> {
        let old = self.join_state;
        if old == new {
            return None;
        }
        self.join_state = new;
        Some(RoomChange::JoinStateChanged { old, new })
    }

    /// Apply state events outside of sync, such as a fetched member list.
    pub fn apply_state_events(
        &mut self,
        events: &[RoomEvent],
        seq: u64,
        own_user_id: Option<&str>,
    ) -> Vec<RoomChange> {
        let mut changes = Vec::new();
        let display_before = self.display_name(own_user_id);
        for event in events {
            self.apply_state_event(event, seq, &mut changes);
        }
        self.push_display_name_change(&display_before, own_user_id, &mut changes);
        changes
    }

    /// Prepend back-paginated events and move the pagination cursor.
    ///
    /// `chunk` is newest first. Returns how many events were new.
    pub fn prepend_history(&mut self, chunk: Vec<RoomEvent>, end: Option<String>) -> usize {
        let added = self.timeline.prepend_newest_first(chunk);
        if end.is_some() {
            self.prev_batch = end;
        }
        added
    }

    /// Move the own read marker and clear both counters.
    pub fn mark_as_read(&mut self, own_user_id: &str, event_id: &str) -> Vec<RoomChange> {
        let counts_before = (self.notification_count, self.highlight_count);
        let mut changes = Vec::new();
        if let Some(change) = self.move_read_marker(own_user_id, event_id) {
            changes.push(change);
        }
        self.notification_count = 0;
        self.highlight_count = 0;
        self.push_count_changes(counts_before, &mut changes);
        changes
    }

    pub fn reset_notification_count(&mut self) -> Option<RoomChange> {
        if self.notification_count == 0 {
            return None;
        }
        self.notification_count = 0;
        Some(RoomChange::NotificationCountChanged(0))
    }

    pub fn reset_highlight_count(&mut self) -> Option<RoomChange> {
        if self.highlight_count == 0 {
            return None;
        }
        self.highlight_count = 0;
        Some(RoomChange::HighlightCountChanged(0))
    }

    pub fn summary(&self, own_user_id: Option<&str>) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            display_name: self.display_name(own_user_id),
            topic: self.topic().map(ToOwned::to_owned),
            join_state: self.join_state,
            member_count: self.members.len() as u64,
            notification_count: self.notification_count,
            highlight_count: self.highlight_count,
            last_event_id: self.timeline.last_event_id().map(ToOwned::to_owned),
        }
    }

    pub fn snapshot(&self, own_user_id: Option<&str>) -> RoomSnapshot {
        RoomSnapshot {
            summary: self.summary(own_user_id),
            canonical_alias: self.canonical_alias().map(ToOwned::to_owned),
            aliases: self.aliases(),
            timeline: self.timeline.iter().cloned().collect(),
            members: self.members.values().cloned().collect(),
            typing: self.typing.clone(),
            last_read_event_id: own_user_id
                .and_then(|user_id| self.read_marker(user_id))
                .map(ToOwned::to_owned),
            prev_batch: self.prev_batch.clone(),
        }
    }

    fn state_str(&self, event_type: &str, state_key: &str, key: &str) -> Option<&str> {
        self.state_event(event_type, state_key)
            .and_then(|event| event.content_str(key))
    }

    fn name_set(&self) -> NameSet {
        NameSet {
            name: self.name().map(ToOwned::to_owned),
            canonical_alias: self.canonical_alias().map(ToOwned::to_owned),
            aliases: self.aliases(),
        }
    }

    fn push_display_name_change(
        &self,
        before: &str,
        own_user_id: Option<&str>,
        changes: &mut Vec<RoomChange>,
    ) {
        let after = self.display_name(own_user_id);
        if after != before {
            debug!(room_id = %self.room_id, old = before, new = %after, "display name changed");
            changes.push(RoomChange::DisplayNameChanged(after));
        }
    }

    fn apply_state_event(&mut self, event: &RoomEvent, seq: u64, changes: &mut Vec<RoomChange>) {
        let Some(state_key) = event.state_key.clone() else {
            return;
        };
        let key = (event.event_type.clone(), state_key);
        if let Some(stored) = self.state.get(&key)
            && stored.seq > seq
        {
            debug!(
                room_id = %self.room_id,
                event_type = %key.0,
                stored_seq = stored.seq,
                seq,
                "ignoring state older than stored value"
            );
            return;
        }

        if event.event_type == MEMBER {
            self.apply_membership(&key.1, event, changes);
        }
        self.state.insert(
            key,
            StateEntry {
                event: event.clone(),
                seq,
            },
        );
    }

    fn apply_membership(&mut self, user_id: &str, event: &RoomEvent, changes: &mut Vec<RoomChange>) {
        let display_name = event
            .content_str("displayname")
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned);

        match event.content_str("membership") {
            Some("join") => match self.members.get_mut(user_id) {
                Some(member) if member.display_name != display_name => {
                    let old_name = std::mem::replace(&mut member.display_name, display_name.clone());
                    changes.push(RoomChange::MemberRenamed {
                        user_id: user_id.to_owned(),
                        old_name,
                        new_name: display_name,
                    });
                }
                Some(_) => {}
                None => {
                    self.members.insert(
                        user_id.to_owned(),
                        MemberInfo {
                            user_id: user_id.to_owned(),
                            display_name,
                        },
                    );
                    changes.push(RoomChange::UserAdded {
                        user_id: user_id.to_owned(),
                    });
                }
            },
            Some("leave" | "ban") => {
                if self.members.remove(user_id).is_some() {
                    changes.push(RoomChange::UserRemoved {
                        user_id: user_id.to_owned(),
                    });
                }
            }
            _ => {}
        }
    }

    fn count_unread(&mut self, event: &RoomEvent, own_user_id: Option<&str>) {
        if event.event_type != MESSAGE || Some(event.sender.as_str()) == own_user_id {
            return;
        }
        self.notification_count += 1;
        if let (Some(body), Some(own)) = (event.body(), own_user_id)
            && body.contains(own)
        {
            self.highlight_count += 1;
        }
    }

    fn push_count_changes(&self, (notifications, highlights): (u64, u64), changes: &mut Vec<RoomChange>) {
        if self.highlight_count != highlights {
            changes.push(RoomChange::HighlightCountChanged(self.highlight_count));
        }
        if self.notification_count != notifications {
            changes.push(RoomChange::NotificationCountChanged(self.notification_count));
        }
    }

    fn apply_ephemeral(&mut self, event: &EphemeralEvent, changes: &mut Vec<RoomChange>) {
        match event.event_type.as_str() {
            TYPING => {
                let mut typing: Vec<String> = event
                    .content
                    .get("user_ids")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect();
                typing.sort();
                typing.dedup();
                if typing != self.typing {
                    self.typing = typing.clone();
                    changes.push(RoomChange::TypingChanged(typing));
                }
            }
            RECEIPT => {
                // content: { "$event": { "m.read": { "@user": { "ts": .. } } } }
                for (event_id, receipts) in &event.content {
                    let Some(readers) = receipts.get("m.read").and_then(Value::as_object) else {
                        continue;
                    };
                    for user_id in readers.keys() {
                        if let Some(change) = self.move_read_marker(user_id, event_id) {
                            changes.push(change);
                        }
                    }
                }
            }
            other => debug!(room_id = %self.room_id, event_type = other, "ignoring ephemeral event"),
        }
    }

    fn move_read_marker(&mut self, user_id: &str, event_id: &str) -> Option<RoomChange> {
        if self.read_markers.get(user_id).map(String::as_str) == Some(event_id) {
            return None;
        }
        self.read_markers
            .insert(user_id.to_owned(), event_id.to_owned());
        Some(RoomChange::ReadMarkerMoved {
            user_id: user_id.to_owned(),
            event_id: event_id.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::sync::UnreadCounts;

    const ROOM: &str = "!r:example.org";
    const ME: &str = "@alice:example.org";

    fn content(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn message(event_id: &str, sender: &str, body: &str) -> RoomEvent {
        RoomEvent {
            event_id: Some(event_id.to_owned()),
            event_type: MESSAGE.to_owned(),
            sender: sender.to_owned(),
            content: content(json!({ "msgtype": "m.text", "body": body })),
            ..RoomEvent::default()
        }
    }

    fn state(event_type: &str, state_key: &str, body: Value) -> RoomEvent {
        RoomEvent {
            event_id: Some(format!("${event_type}-{state_key}")),
            event_type: event_type.to_owned(),
            sender: ME.to_owned(),
            state_key: Some(state_key.to_owned()),
            content: content(body),
            ..RoomEvent::default()
        }
    }

    fn update() -> SyncRoom {
        SyncRoom {
            room_id: ROOM.to_owned(),
            join_state: JoinState::Joined,
            ..SyncRoom::default()
        }
    }

    fn timeline_ids(room: &Room) -> Vec<String> {
        room.timeline()
            .iter()
            .filter_map(|event| event.event_id.clone())
            .collect()
    }

    #[test]
    fn duplicate_increments_leave_timeline_unchanged() {
        let mut room = Room::new(ROOM);
        let mut first = update();
        first.timeline = vec![message("$1", "@bob:example.org", "a"), message("$2", "@bob:example.org", "b")];
        let mut second = update();
        second.timeline = vec![message("$2", "@bob:example.org", "b"), message("$3", "@bob:example.org", "c")];

        room.apply_sync(&first, 1, Some(ME));
        let changes = room.apply_sync(&second, 2, Some(ME));
        room.apply_sync(&second, 2, Some(ME));

        assert_eq!(timeline_ids(&room), vec!["$1", "$2", "$3"]);
        let new_messages = changes
            .iter()
            .filter(|change| matches!(change, RoomChange::NewMessage(_)))
            .count();
        assert_eq!(new_messages, 1);
    }

    #[test]
    fn newer_state_wins_in_any_order() {
        let older = state(TOPIC, "", json!({ "topic": "old" }));
        let newer = state(TOPIC, "", json!({ "topic": "new" }));

        for order in [[(1, &older), (2, &newer)], [(2, &newer), (1, &older)]] {
            let mut room = Room::new(ROOM);
            for (seq, event) in order {
                let mut increment = update();
                increment.state = vec![event.clone()];
                room.apply_sync(&increment, seq, Some(ME));
            }
            assert_eq!(room.topic(), Some("new"));
        }
    }

    #[test]
    fn names_changed_is_raised_once_per_increment() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.state = vec![
            state(NAME, "", json!({ "name": "Lobby" })),
            state(CANONICAL_ALIAS, "", json!({ "alias": "#lobby:example.org" })),
            state(ALIASES, "example.org", json!({ "aliases": ["#hall:example.org"] })),
        ];
        increment.timeline = vec![state(TOPIC, "", json!({ "topic": "Welcome" }))];

        let changes = room.apply_sync(&increment, 1, Some(ME));

        let names = changes.iter().filter(|c| **c == RoomChange::NamesChanged).count();
        assert_eq!(names, 1);
        assert!(changes.contains(&RoomChange::TopicChanged));
        assert_eq!(room.display_name(Some(ME)), "Lobby");
        assert_eq!(room.aliases(), vec!["#hall:example.org".to_owned()]);

        let unchanged = room.apply_sync(&increment, 2, Some(ME));
        assert!(!unchanged.contains(&RoomChange::NamesChanged));
        assert!(!unchanged.contains(&RoomChange::TopicChanged));
    }

    #[test]
    fn membership_events_add_rename_and_remove() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.state = vec![state(MEMBER, "@bob:example.org", json!({ "membership": "join" }))];
        let changes = room.apply_sync(&increment, 1, Some(ME));
        assert!(changes.contains(&RoomChange::UserAdded {
            user_id: "@bob:example.org".into()
        }));

        let mut increment = update();
        increment.timeline = vec![state(
            MEMBER,
            "@bob:example.org",
            json!({ "membership": "join", "displayname": "Bob" }),
        )];
        let changes = room.apply_sync(&increment, 2, Some(ME));
        assert!(changes.contains(&RoomChange::DisplayNameChanged("Bob".into())));
        assert!(changes.contains(&RoomChange::MemberRenamed {
            user_id: "@bob:example.org".into(),
            old_name: None,
            new_name: Some("Bob".into()),
        }));
        assert_eq!(room.display_name(Some(ME)), "Bob");

        let mut increment = update();
        increment.state = vec![state(MEMBER, "@bob:example.org", json!({ "membership": "leave" }))];
        let changes = room.apply_sync(&increment, 3, Some(ME));
        assert!(changes.contains(&RoomChange::UserRemoved {
            user_id: "@bob:example.org".into()
        }));
        assert_eq!(room.display_name(Some(ME)), ROOM);
    }

    #[test]
    fn member_joining_nameless_room_changes_display_name() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.state = vec![state(MEMBER, ME, json!({ "membership": "join" }))];
        let changes = room.apply_sync(&increment, 1, Some(ME));
        assert!(
            !changes
                .iter()
                .any(|change| matches!(change, RoomChange::DisplayNameChanged(_)))
        );

        let mut increment = update();
        increment.timeline = vec![state(
            MEMBER,
            "@carol:example.org",
            json!({ "membership": "join", "displayname": "Carol" }),
        )];
        let changes = room.apply_sync(&increment, 2, Some(ME));
        assert_eq!(
            changes
                .iter()
                .filter(|change| matches!(change, RoomChange::DisplayNameChanged(_)))
                .collect::<Vec<_>>(),
            vec![&RoomChange::DisplayNameChanged("Carol".into())]
        );

        let mut named = update();
        named.state = vec![state(NAME, "", json!({ "name": "Book club" }))];
        let changes = room.apply_sync(&named, 3, Some(ME));
        assert!(changes.contains(&RoomChange::NamesChanged));
        assert!(changes.contains(&RoomChange::DisplayNameChanged("Book club".into())));

        let mut renamed = update();
        renamed.state = vec![state(
            MEMBER,
            "@carol:example.org",
            json!({ "membership": "join", "displayname": "Caroline" }),
        )];
        let changes = room.apply_sync(&renamed, 4, Some(ME));
        assert!(
            !changes
                .iter()
                .any(|change| matches!(change, RoomChange::DisplayNameChanged(_)))
        );
    }

    #[test]
    fn stale_membership_does_not_touch_members() {
        let mut room = Room::new(ROOM);
        let mut newer = update();
        newer.state = vec![state(MEMBER, "@bob:example.org", json!({ "membership": "join" }))];
        room.apply_sync(&newer, 5, Some(ME));

        let mut older = update();
        older.state = vec![state(MEMBER, "@bob:example.org", json!({ "membership": "leave" }))];
        let changes = room.apply_sync(&older, 4, Some(ME));

        assert!(changes.is_empty());
        assert!(room.member("@bob:example.org").is_some());
    }

    #[test]
    fn join_state_transitions_are_reported() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.join_state = JoinState::Left;

        let changes = room.apply_sync(&increment, 1, Some(ME));
        assert_eq!(
            changes,
            vec![RoomChange::JoinStateChanged {
                old: JoinState::Joined,
                new: JoinState::Left,
            }]
        );
        assert!(room.apply_sync(&increment, 2, Some(ME)).is_empty());
    }

    #[test]
    fn counts_unread_locally_without_server_counters() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.timeline = vec![
            message("$1", "@bob:example.org", "hello"),
            message("$2", "@bob:example.org", "ping @alice:example.org"),
            message("$3", ME, "my own message"),
        ];

        let changes = room.apply_sync(&increment, 1, Some(ME));

        assert_eq!(room.notification_count(), 2);
        assert_eq!(room.highlight_count(), 1);
        assert!(changes.contains(&RoomChange::NotificationCountChanged(2)));
        assert!(changes.contains(&RoomChange::HighlightCountChanged(1)));
    }

    #[test]
    fn server_counters_override_local_counting() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.timeline = vec![message("$1", "@bob:example.org", "hello @alice:example.org")];
        increment.unread = Some(UnreadCounts {
            highlight_count: Some(0),
            notification_count: Some(7),
        });

        room.apply_sync(&increment, 1, Some(ME));

        assert_eq!(room.notification_count(), 7);
        assert_eq!(room.highlight_count(), 0);
    }

    #[test]
    fn mark_as_read_moves_marker_and_clears_counters() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.timeline = vec![message("$1", "@bob:example.org", "hi @alice:example.org")];
        room.apply_sync(&increment, 1, Some(ME));

        let changes = room.mark_as_read(ME, "$1");

        assert_eq!(room.read_marker(ME), Some("$1"));
        assert_eq!(
            changes,
            vec![
                RoomChange::ReadMarkerMoved {
                    user_id: ME.into(),
                    event_id: "$1".into(),
                },
                RoomChange::HighlightCountChanged(0),
                RoomChange::NotificationCountChanged(0),
            ]
        );
        assert!(room.reset_notification_count().is_none());
        assert!(room.reset_highlight_count().is_none());
    }

    #[test]
    fn applies_typing_and_receipts() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.ephemeral = vec![
            EphemeralEvent {
                event_type: TYPING.into(),
                content: content(json!({ "user_ids": ["@carol:example.org", "@bob:example.org"] })),
            },
            EphemeralEvent {
                event_type: RECEIPT.into(),
                content: content(json!({
                    "$9": { "m.read": { "@bob:example.org": { "ts": 1 } } }
                })),
            },
        ];

        let changes = room.apply_sync(&increment, 1, Some(ME));

        assert_eq!(room.typing(), ["@bob:example.org", "@carol:example.org"]);
        assert_eq!(room.read_marker("@bob:example.org"), Some("$9"));
        assert_eq!(changes.len(), 2);

        let repeated = room.apply_sync(&increment, 2, Some(ME));
        assert!(repeated.is_empty());
    }

    #[test]
    fn prepends_history_and_moves_cursor() {
        let mut room = Room::new(ROOM);
        let mut increment = update();
        increment.prev_batch = Some("t1".into());
        increment.timeline = vec![message("$3", "@bob:example.org", "c")];
        room.apply_sync(&increment, 1, Some(ME));
        assert_eq!(room.prev_batch(), Some("t1"));

        let added = room.prepend_history(
            vec![message("$2", "@bob:example.org", "b"), message("$1", "@bob:example.org", "a")],
            Some("t0".into()),
        );

        assert_eq!(added, 2);
        assert_eq!(timeline_ids(&room), vec!["$1", "$2", "$3"]);
        assert_eq!(room.prev_batch(), Some("t0"));
    }

    #[test]
    fn display_name_falls_back_through_members() {
        let mut room = Room::new(ROOM);
        let members = ["@alice:example.org", "@bob:example.org", "@carol:example.org", "@dave:example.org"]
            .into_iter()
            .map(|user| state(MEMBER, user, json!({ "membership": "join" })))
            .collect::<Vec<_>>();

        room.apply_state_events(&members[..3], 1, Some(ME));
        assert_eq!(
            room.display_name(Some(ME)),
            "@bob:example.org and @carol:example.org"
        );

        let changes = room.apply_state_events(&members[3..], 1, Some(ME));
        assert!(changes.contains(&RoomChange::DisplayNameChanged(
            "@bob:example.org and 2 others".into()
        )));
        assert_eq!(room.display_name(Some(ME)), "@bob:example.org and 2 others");
    }
}
