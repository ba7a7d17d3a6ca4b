//! Bounded per-category event buffer.

use crate::types::{Event, EventId, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// The most recent events of one category, oldest first.
///
/// Holds at most `capacity` events. Pushing past capacity evicts from the
/// front, so the remaining events keep their id order. Events are stored
/// behind `Arc` so fetches and wakeups share them instead of copying
/// payloads.
#[derive(Debug, Clone)]
pub struct CategoryBuffer {
    capacity: usize,
    events: VecDeque<Arc<Event>>,
}

impl CategoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::new(),
        }
    }

    /// Append an event, evicting the oldest when full.
    ///
    /// Returns the evicted event, if any.
    pub fn push(&mut self, event: Arc<Event>) -> Option<Arc<Event>> {
        debug_assert!(
            self.events.back().map_or(true, |last| last.id < event.id),
            "events must arrive in id order"
        );

        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// Events with `id > since`, oldest first.
    pub fn events_after(&self, since: EventId) -> impl Iterator<Item = &Arc<Event>> + '_ {
        // Ids are ascending, so skip the prefix instead of scanning it all.
        let start = self.events.partition_point(|e| e.id <= since);
        self.events.range(start..)
    }

    /// Drop events older than `ttl` as of `now`. Returns how many went.
    pub fn evict_expired(&mut self, ttl: Duration, now: Timestamp) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.events.front() {
            if front.timestamp.age_at(now) <= ttl {
                break;
            }
            self.events.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn last_id(&self) -> EventId {
        self.events.back().map(|e| e.id).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
