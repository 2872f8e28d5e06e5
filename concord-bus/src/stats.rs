//! Bus activity counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the bus as it routes messages.
#[derive(Debug, Default)]
pub struct BusStats {
    /// Handler invocations dispatched to the delivery pool
    pub local_deliveries: AtomicU64,
    /// Envelopes published on the distributed channel
    pub distributed_publishes: AtomicU64,
    pub publish_failures: AtomicU64,
    /// Handlers that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Responses with no waiting request (late, duplicate or unknown)
    pub dropped_responses: AtomicU64,
    pub timeouts: AtomicU64,
    /// Envelopes received from other bus instances
    pub inbound_messages: AtomicU64,
    pub sweeps: AtomicU64,
}

impl BusStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            distributed_publishes: self.distributed_publishes.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            dropped_responses: self.dropped_responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            inbound_messages: self.inbound_messages.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusStatsSnapshot {
    pub local_deliveries: u64,
    pub distributed_publishes: u64,
    pub publish_failures: u64,
    pub handler_failures: u64,
    pub dropped_responses: u64,
    pub timeouts: u64,
    pub inbound_messages: u64,
    pub sweeps: u64,
}
