use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    event::JoinState,
    room::{Room, RoomChange},
    sync::SyncIncrement,
    types::RoomSummary,
};

/// Result of applying an increment to one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRoom {
    pub room_id: String,
    /// The room entered the model during this increment.
    pub created: bool,
    /// Join state after the increment.
    pub join_state: JoinState,
    pub changes: Vec<RoomChange>,
    /// Malformed events dropped for this room.
    pub skipped: usize,
}

impl AppliedRoom {
    /// Whether the room is now joined and was not before.
    pub fn became_joined(&self) -> bool {
        if self.join_state != JoinState::Joined {
            return false;
        }
        self.created
            || self.changes.iter().any(|change| {
                matches!(
                    change,
                    RoomChange::JoinStateChanged {
                        new: JoinState::Joined,
                        ..
                    }
                )
            })
    }
}

/// All rooms known to the session, keyed by room ID.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    last_seq: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Highest increment sequence applied so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Return the room with `room_id`, creating it on first reference.
    pub fn provide_room(&mut self, room_id: &str) -> &mut Room {
        self.rooms.entry(room_id.to_owned()).or_insert_with(|| {
            debug!(room_id, "registering room");
            Room::new(room_id)
        })
    }

    /// Apply every room named by `increment`.
    pub fn apply_increment(
        &mut self,
        increment: &SyncIncrement,
        own_user_id: Option<&str>,
    ) -> Vec<AppliedRoom> {
        if increment.seq < self.last_seq {
            warn!(seq = increment.seq, last_seq = self.last_seq, "applying increment out of order");
        }
        self.last_seq = self.last_seq.max(increment.seq);

        increment
            .rooms
            .iter()
            .map(|update| {
                let created = !self.contains(&update.room_id);
                let room = self.provide_room(&update.room_id);
                if created {
                    // Initial join state is not a transition.
                    room.set_join_state(update.join_state);
                }
                let changes = room.apply_sync(update, increment.seq, own_user_id);
                AppliedRoom {
                    room_id: update.room_id.clone(),
                    created,
                    join_state: room.join_state(),
                    changes,
                    skipped: update.skipped,
                }
            })
            .collect()
    }

    /// Summaries of all rooms, sorted by room ID.
    pub fn summaries(&self, own_user_id: Option<&str>) -> Vec<RoomSummary> {
        let mut summaries: Vec<RoomSummary> = self
            .rooms
            .values()
            .map(|room| room.summary(own_user_id))
            .collect();
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
        self.last_seq = 0;
    }
}
