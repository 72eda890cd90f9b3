use std::collections::{HashSet, VecDeque};

use crate::event::RoomEvent;

/// Ordered room timeline with event-id deduplication.
///
/// Only events carrying an `event_id` are stored.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: VecDeque<RoomEvent>,
    ids: HashSet<String>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.ids.contains(event_id)
    }

    /// Events in server order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RoomEvent> {
        self.events.iter()
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.events.back().and_then(|event| event.event_id.as_deref())
    }

    /// Append a newer event. Returns `false` if it was already present.
    pub fn append(&mut self, event: RoomEvent) -> bool {
        if !self.remember(&event) {
            return false;
        }
        self.events.push_back(event);
        true
    }

    /// Prepend older events given newest first, as back-pagination returns them.
    ///
    /// Returns how many were inserted.
    pub fn prepend_newest_first(&mut self, events: impl IntoIterator<Item = RoomEvent>) -> usize {
        let mut added = 0;
        for event in events {
            if self.remember(&event) {
                self.events.push_front(event);
                added += 1;
            }
        }
        added
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    fn remember(&mut self, event: &RoomEvent) -> bool {
        match event.event_id.as_deref() {
            Some(id) => self.ids.insert(id.to_owned()),
            None => false,
        }
    }
}
