//! # Roomcast
//!
//! A long-poll publish/subscribe event bus with bounded in-memory history
//! and a durable replay log.
//!
//! ## Core Concepts
//!
//! - **Events**: Immutable, globally ordered by a strictly increasing id
//! - **Categories**: Named partitions (chat rooms), each with a bounded buffer
//! - **Long-poll**: A subscribe blocks until something newer than its cursor
//!   arrives or its timeout passes
//! - **Durable log**: Every event is on disk before anyone sees it, and the
//!   log alone rebuilds the buffers and the last-event cache on restart
//!
//! ## Example
//!
//! ```ignore
//! use roomcast::{BusConfig, EventBus, EventId};
//! use serde_json::json;
//!
//! let bus = EventBus::open(BusConfig {
//!     log_path: "./chats.log".into(),
//!     ..Default::default()
//! })?;
//!
//! bus.publish("room1", json!({"username": "alice", "msg": "hi"}))?;
//!
//! // Blocks until something newer than id 0 shows up, or 30s pass
//! let events = bus.subscribe(&["room1"], EventId(0), Some(Duration::from_secs(30)))?;
//!
//! let latest = bus.last_event("room1");
//! ```

pub mod buffer;
pub mod bus;
pub mod cache;
pub mod error;
pub mod handler;
pub mod persistence;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use buffer::CategoryBuffer;
pub use bus::{BusConfig, EventBus, MIN_BUFFER_CAPACITY};
pub use cache::LastEventCache;
pub use error::{BusError, Result};
pub use handler::{
    ErrorResponse, Handlers, LastEventsResponse, PublishRequest, PublishResponse,
    SubscribeRequest, SubscribeResponse,
};
pub use persistence::{EventLog, LogReader};
pub use subscriptions::{
    PendingSubscription, Subscription, SubscriptionRegistry, WaitOutcome, WaiterId,
};
pub use types::*;
