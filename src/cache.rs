//! Latest event per category.

use crate::types::Event;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each category to its most recent event.
///
/// Purely derived from the event stream: feeding it the replayed log gives
/// the same map as feeding it live publishes. Categories starting with the
/// excluded prefix (private mention notifications) are never recorded.
pub struct LastEventCache {
    excluded_prefix: String,
    latest: RwLock<HashMap<String, Arc<Event>>>,
}

impl LastEventCache {
    pub fn new(excluded_prefix: impl Into<String>) -> Self {
        Self {
            excluded_prefix: excluded_prefix.into(),
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a category is kept out of the cache.
    pub fn is_excluded(&self, category: &str) -> bool {
        !self.excluded_prefix.is_empty() && category.starts_with(&self.excluded_prefix)
    }

    /// Record an event. Returns false if the category is excluded.
    ///
    /// An event older than the one already held is ignored, so the entry
    /// is always the highest id seen for its category.
    pub fn record(&self, event: &Arc<Event>) -> bool {
        if self.is_excluded(&event.category) {
            return false;
        }

        let mut latest = self.latest.write();
        match latest.get(&event.category) {
            Some(current) if current.id >= event.id => {}
            _ => {
                latest.insert(event.category.clone(), Arc::clone(event));
            }
        }
        true
    }

    pub fn get(&self, category: &str) -> Option<Arc<Event>> {
        self.latest.read().get(category).cloned()
    }

    /// Copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, Arc<Event>> {
        self.latest.read().clone()
    }

    pub fn len(&self) -> usize {
        self.latest.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.read().is_empty()
    }
}
