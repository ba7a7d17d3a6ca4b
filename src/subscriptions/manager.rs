//! Registry of pending long-poll waiters.

use crate::types::{Event, EventId};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::{PendingSubscription, WaiterId};

/// Internal waiter state.
struct Waiter {
    categories: Vec<String>,
    /// Last id the caller has already seen.
    since: EventId,
    deadline: Instant,
    /// One-shot result slot. Dropping it without sending expires the waiter.
    sender: Sender<Vec<Event>>,
}

#[derive(Default)]
struct Waiters {
    by_id: HashMap<WaiterId, Waiter>,
    by_category: HashMap<String, HashSet<WaiterId>>,
}

impl Waiters {
    fn remove(&mut self, id: WaiterId) -> Option<Waiter> {
        let waiter = self.by_id.remove(&id)?;
        for category in &waiter.categories {
            if let Some(ids) = self.by_category.get_mut(category) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_category.remove(category);
                }
            }
        }
        Some(waiter)
    }
}

/// Tracks pending waiters per category and resolves them.
///
/// All state sits behind one lock, so a waiter is removed exactly once:
/// whichever of wake, expire or cancel gets there first owns the outcome.
pub struct SubscriptionRegistry {
    waiters: Mutex<Waiters>,
    /// Counter for generating waiter IDs.
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Waiters::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a waiter for events with `id > since` in any of
    /// `categories`, expiring after `timeout`.
    ///
    /// The caller must hold whatever lock keeps publishes out between its
    /// own "nothing available" check and this call.
    pub fn register(
        self: &Arc<Self>,
        categories: Vec<String>,
        since: EventId,
        timeout: Duration,
    ) -> PendingSubscription {
        let id = WaiterId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(1);
        let deadline = Instant::now() + timeout;

        {
            let mut waiters = self.waiters.lock();
            for category in &categories {
                waiters
                    .by_category
                    .entry(category.clone())
                    .or_default()
                    .insert(id);
            }
            waiters.by_id.insert(
                id,
                Waiter {
                    categories,
                    since,
                    deadline,
                    sender,
                },
            );
        }

        debug!(waiter = id.0, since = %since, ?timeout, "Registered waiter");

        PendingSubscription {
            id,
            deadline,
            receiver,
            registry: Arc::clone(self),
            resolved: false,
        }
    }

    /// Fulfil every waiter on the event's category whose cursor is behind
    /// it. Each woken waiter receives just this event and is removed.
    ///
    /// Returns how many waiters were woken.
    pub fn wake(&self, event: &Event) -> usize {
        let mut waiters = self.waiters.lock();

        let matching: Vec<WaiterId> = match waiters.by_category.get(&event.category) {
            Some(ids) => ids
                .iter()
                .filter(|id| {
                    waiters
                        .by_id
                        .get(*id)
                        .map_or(false, |waiter| waiter.since < event.id)
                })
                .copied()
                .collect(),
            None => return 0,
        };

        let mut woken = 0;
        for id in matching {
            if let Some(waiter) = waiters.remove(id) {
                // A full or disconnected slot means the caller is gone.
                if waiter.sender.try_send(vec![event.clone()]).is_ok() {
                    woken += 1;
                }
            }
        }

        if woken > 0 {
            debug!(event = %event.id, category = %event.category, woken, "Woke waiters");
        }
        woken
    }

    /// Remove a waiter whose deadline passed. Returns false if it had
    /// already been fulfilled or removed.
    pub fn expire(&self, id: WaiterId) -> bool {
        let removed = self.waiters.lock().remove(id).is_some();
        if removed {
            debug!(waiter = id.0, "Waiter timed out");
        }
        removed
    }

    /// Remove a waiter whose caller went away. Nothing is delivered.
    pub fn cancel(&self, id: WaiterId) -> bool {
        let removed = self.waiters.lock().remove(id).is_some();
        if removed {
            debug!(waiter = id.0, "Waiter cancelled");
        }
        removed
    }

    /// Remove every waiter past its deadline. Their callers see an empty
    /// result.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let mut waiters = self.waiters.lock();
        let overdue: Vec<WaiterId> = waiters
            .by_id
            .iter()
            .filter(|(_, waiter)| waiter.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &overdue {
            waiters.remove(*id);
        }

        if !overdue.is_empty() {
            debug!(count = overdue.len(), "Reaped expired waiters");
        }
        overdue.len()
    }

    /// Expire every waiter at once.
    pub fn expire_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.by_id.len();
        waiters.by_id.clear();
        waiters.by_category.clear();
        count
    }

    /// Number of pending waiters.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().by_id.len()
    }

    /// Number of pending waiters on one category.
    pub fn pending_for(&self, category: &str) -> usize {
        self.waiters
            .lock()
            .by_category
            .get(category)
            .map_or(0, HashSet::len)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::WaitOutcome;
    use crate::types::Timestamp;
    use serde_json::json;
    use std::thread;

    fn make_event(id: u64, category: &str) -> Event {
        Event {
            id: EventId(id),
            category: category.to_string(),
            timestamp: Timestamp::now(),
            payload: json!({"username": "bob", "msg": "hello"}),
        }
    }

    fn rooms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_and_cancel() {
        let registry = Arc::new(SubscriptionRegistry::new());

        let pending = registry.register(rooms(&["room1"]), EventId(0), Duration::from_secs(5));
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.pending_for("room1"), 1);

        pending.cancel();
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.pending_for("room1"), 0);
    }

    #[test]
    fn test_drop_cancels_waiter() {
        let registry = Arc::new(SubscriptionRegistry::new());
        {
            let _pending =
                registry.register(rooms(&["room1", "room2"]), EventId(0), Duration::from_secs(5));
            assert_eq!(registry.pending_count(), 1);
        }
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.pending_for("room2"), 0);
    }

    #[test]
    fn test_wake_matching_category() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pending = registry.register(rooms(&["room1"]), EventId(3), Duration::from_secs(5));

        assert_eq!(registry.wake(&make_event(4, "room1")), 1);
        assert_eq!(registry.pending_count(), 0);

        match pending.wait() {
            WaitOutcome::Fulfilled(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].id, EventId(4));
            }
            other => panic!("Expected Fulfilled, got {:?}", other),
        }
    }

    #[test]
    fn test_wake_ignores_other_categories() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let _pending = registry.register(rooms(&["room1"]), EventId(0), Duration::from_secs(5));

        assert_eq!(registry.wake(&make_event(1, "room2")), 0);
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_wake_respects_cursor() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let _pending = registry.register(rooms(&["room1"]), EventId(10), Duration::from_secs(5));

        assert_eq!(registry.wake(&make_event(10, "room1")), 0);
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.wake(&make_event(11, "room1")), 1);
    }

    #[test]
    fn test_multi_category_waiter_woken_once() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pending = registry.register(rooms(&["room1", "room2"]), EventId(0), Duration::from_secs(5));

        assert_eq!(registry.wake(&make_event(1, "room2")), 1);
        assert_eq!(registry.wake(&make_event(2, "room1")), 0);

        let events = pending.wait().into_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, "room2");
    }

    #[test]
    fn test_wake_every_matching_waiter() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let a = registry.register(rooms(&["room1"]), EventId(0), Duration::from_secs(5));
        let b = registry.register(rooms(&["room1", "room2"]), EventId(0), Duration::from_secs(5));
        let c = registry.register(rooms(&["room2"]), EventId(0), Duration::from_secs(5));

        assert_eq!(registry.wake(&make_event(1, "room1")), 2);
        assert_eq!(registry.pending_count(), 1);

        assert_eq!(a.wait().into_events()[0].id, EventId(1));
        assert_eq!(b.wait().into_events()[0].id, EventId(1));
        drop(c);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let started = Instant::now();
        let pending = registry.register(rooms(&["room1"]), EventId(0), Duration::from_millis(50));

        assert_eq!(pending.wait(), WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_wake_from_other_thread() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pending = registry.register(rooms(&["room1"]), EventId(0), Duration::from_secs(5));

        let publisher = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.wake(&make_event(1, "room1"))
            })
        };

        let events = pending.wait().into_events();
        assert_eq!(publisher.join().unwrap(), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_reap_expired() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let short = registry.register(rooms(&["room1"]), EventId(0), Duration::from_millis(1));
        let _long = registry.register(rooms(&["room1"]), EventId(0), Duration::from_secs(60));

        thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.reap_expired(Instant::now()), 1);
        assert_eq!(registry.pending_count(), 1);

        // Reaped waiter sees an empty result
        assert_eq!(short.wait(), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_expire_all() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pending = registry.register(rooms(&["room1"]), EventId(0), Duration::from_secs(60));
        let _other = registry.register(rooms(&["room2"]), EventId(0), Duration::from_secs(60));

        assert_eq!(registry.expire_all(), 2);
        assert_eq!(pending.wait(), WaitOutcome::TimedOut);
    }
}
