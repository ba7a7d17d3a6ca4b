//! Core types for the event bus.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Globally unique, strictly increasing event identifier.
///
/// Id 0 is never assigned, so a cursor of 0 means "nothing seen yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    /// Cursor for a subscriber that has seen nothing.
    pub const ZERO: EventId = EventId(0);

    pub fn next(self) -> Self {
        EventId(self.0 + 1)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        EventId(id)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// Time elapsed between `self` and `later`, zero if `later` is earlier.
    pub fn age_at(self, later: Timestamp) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A published event. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the bus at publish time.
    pub id: EventId,

    /// Partition key, e.g. a chat room name.
    pub category: String,

    /// Set by the bus, not the caller.
    pub timestamp: Timestamp,

    /// Caller-supplied data, opaque to the bus.
    pub payload: serde_json::Value,
}

/// Check a category against the shape constraints: non-empty and at most
/// `max_len` bytes.
pub fn validate_category(category: &str, max_len: usize) -> Result<()> {
    if category.is_empty() {
        return Err(BusError::InvalidCategory("category is empty".into()));
    }
    if category.len() > max_len {
        return Err(BusError::InvalidCategory(format!(
            "category is {} bytes, limit is {}",
            category.len(),
            max_len
        )));
    }
    Ok(())
}

/// Bus statistics.
#[derive(Clone, Debug, Default)]
pub struct BusStats {
    pub category_count: u64,
    pub buffered_events: u64,
    pub pending_waiters: u64,
    pub last_event_id: EventId,
    pub log_size_bytes: u64,
}
