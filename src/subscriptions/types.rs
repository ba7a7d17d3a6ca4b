//! Subscription handle types.

use crate::types::Event;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::manager::SubscriptionRegistry;

/// Unique identifier for a waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaiterId(pub u64);

/// How a pending subscription ended.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    /// A matching publish arrived.
    Fulfilled(Vec<Event>),
    /// The deadline passed first.
    TimedOut,
}

impl WaitOutcome {
    /// Events delivered, empty on timeout.
    pub fn into_events(self) -> Vec<Event> {
        match self {
            WaitOutcome::Fulfilled(events) => events,
            WaitOutcome::TimedOut => Vec::new(),
        }
    }
}

/// Result of starting a subscribe call.
#[derive(Debug)]
pub enum Subscription {
    /// Events were already available; no waiter was registered.
    Ready(Vec<Event>),
    /// Nothing yet; a waiter is registered.
    Pending(PendingSubscription),
}

impl Subscription {
    /// Block until there is a result.
    pub fn wait(self) -> Vec<Event> {
        match self {
            Subscription::Ready(events) => events,
            Subscription::Pending(pending) => pending.wait().into_events(),
        }
    }
}

/// Handle to a registered waiter.
///
/// Dropping it before it resolves cancels the waiter.
pub struct PendingSubscription {
    pub(crate) id: WaiterId,
    pub(crate) deadline: Instant,
    pub(crate) receiver: Receiver<Vec<Event>>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) resolved: bool,
}

impl PendingSubscription {
    pub fn id(&self) -> WaiterId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The one-shot channel, for selecting against a disconnect signal.
    ///
    /// A message on it means the waiter was fulfilled; a disconnect means
    /// it was expired by the registry.
    pub fn receiver(&self) -> &Receiver<Vec<Event>> {
        &self.receiver
    }

    /// Block until fulfilled or the deadline passes.
    pub fn wait(mut self) -> WaitOutcome {
        let timeout = self.deadline.saturating_duration_since(Instant::now());
        let outcome = match self.receiver.recv_timeout(timeout) {
            Ok(events) => WaitOutcome::Fulfilled(events),
            Err(RecvTimeoutError::Timeout) => {
                if self.registry.expire(self.id) {
                    WaitOutcome::TimedOut
                } else {
                    // A publish claimed the waiter between the timeout and
                    // the expire; its events are already in the channel.
                    match self.receiver.try_recv() {
                        Ok(events) => WaitOutcome::Fulfilled(events),
                        Err(_) => WaitOutcome::TimedOut,
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::TimedOut,
        };
        self.resolved = true;
        outcome
    }

    /// Withdraw the waiter without a result.
    pub fn cancel(mut self) {
        self.registry.cancel(self.id);
        self.resolved = true;
    }
}

impl fmt::Debug for PendingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSubscription")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Drop for PendingSubscription {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry.cancel(self.id);
        }
    }
}
