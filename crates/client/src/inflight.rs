//! Request coalescing for network fetches.
//!
//! When several loads for the same [`ResourceKey`] need the network at the
//! same time, only the first one (the initiator) performs the request. Every
//! other caller joins and receives a clone of the initiator's outcome.
//!
//! ```text
//! load A ─┐
//!         │                             network
//! load B ─┼──► InFlightRegistry ──────► request
//!         │        │                      │
//! load C ─┘        ▼                      ▼
//!            [A, B, C receive      [one transport call]
//!             the same outcome]◄──────────┘
//! ```
//!
//! The registry keeps a broadcast sender per key for exactly as long as the
//! operation runs. If the initiator's ticket is dropped without completing
//! (its task was aborted), the sender goes with it and every waiter sees the
//! channel close.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pixcache_core::ResourceKey;
use tokio::sync::broadcast;
use tracing::debug;

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total joins
    pub total_requests: u64,
    /// Joins that attached to an operation already in flight
    pub coalesced_requests: u64,
    /// Joins that started a new operation
    pub new_requests: u64,
}

struct State<T> {
    in_flight: HashMap<ResourceKey, broadcast::Sender<T>>,
    stats: RegistryStats,
}

/// Tracks in-flight network operations by key.
pub struct InFlightRegistry<T: Clone> {
    state: Arc<Mutex<State<T>>>,
}

/// The result of [`InFlightRegistry::join`].
pub struct Joined<T: Clone> {
    /// Yields the operation's outcome exactly once.
    pub receiver: broadcast::Receiver<T>,
    /// Present only for the caller that must perform the operation.
    pub ticket: Option<InFlightTicket<T>>,
}

impl<T: Clone> Joined<T> {
    pub fn is_new_operation(&self) -> bool {
        self.ticket.is_some()
    }
}

/// Proof of being the initiator for a key. Completing it fans the outcome
/// out to every joined caller and retires the key.
#[must_use = "dropping a ticket without completing it cancels the operation for every waiter"]
pub struct InFlightTicket<T: Clone> {
    key: ResourceKey,
    state: Arc<Mutex<State<T>>>,
    done: bool,
}

impl<T: Clone> InFlightRegistry<T> {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(State { in_flight: HashMap::new(), stats: RegistryStats::default() })) }
    }

    /// Register interest in `key`.
    ///
    /// The first caller for a key gets a ticket and must perform the
    /// operation; later callers only get a receiver.
    pub fn join(&self, key: &ResourceKey) -> Joined<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.stats.total_requests += 1;

        if let Some(tx) = state.in_flight.get(key) {
            let receiver = tx.subscribe();
            state.stats.coalesced_requests += 1;
            debug!(key = %key, "coalescing load onto in-flight request");
            return Joined { receiver, ticket: None };
        }

        // A single message is ever sent per channel.
        let (tx, receiver) = broadcast::channel(1);
        state.in_flight.insert(key.clone(), tx);
        state.stats.new_requests += 1;
        debug!(key = %key, in_flight = state.in_flight.len(), "starting new network request");

        Joined { receiver, ticket: Some(InFlightTicket { key: key.clone(), state: Arc::clone(&self.state), done: false }) }
    }

    /// Number of keys with an operation in flight.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }

    pub fn stats(&self) -> RegistryStats {
        self.state.lock().stats
    }
}

impl<T: Clone> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> InFlightTicket<T> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Deliver `outcome` to every waiter and remove the key.
    ///
    /// The send happens under the registry lock, so no caller can join
    /// between the broadcast and the removal and miss the outcome.
    pub fn complete(mut self, outcome: T) {
        self.done = true;
        let mut state = self.state.lock();
        if let Some(tx) = state.in_flight.remove(&self.key) {
            let waiters = tx.receiver_count();
            // Receivers may all have been dropped.
            let _ = tx.send(outcome);
            debug!(key = %self.key, waiters, "completed network request");
        }
    }
}

impl<T: Clone> Drop for InFlightTicket<T> {
    fn drop(&mut self) {
        if !self.done {
            let removed = self.state.lock().in_flight.remove(&self.key);
            if removed.is_some() {
                debug!(key = %self.key, "network request abandoned; waiters released");
            }
        }
    }
}
