//! Long-poll waiters.
//!
//! A subscribe call that finds nothing new registers a waiter here and
//! blocks on a one-shot channel. Each waiter ends in exactly one of two
//! ways:
//! - Fulfilled: a matching publish hands it the new event
//! - Timed out: its deadline passes and it gets an empty result
//!
//! Dropping a pending handle (the caller disconnected) removes the waiter
//! without delivering anything.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new());
//!
//! let pending = registry.register(
//!     vec!["room1".to_string()],
//!     EventId(12),
//!     Duration::from_secs(30),
//! );
//!
//! // On another thread: registry.wake(&event);
//!
//! match pending.wait() {
//!     WaitOutcome::Fulfilled(events) => println!("Got {} events", events.len()),
//!     WaitOutcome::TimedOut => println!("Nothing new, poll again"),
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionRegistry;
pub use types::{PendingSubscription, Subscription, WaitOutcome, WaiterId};
