//! Distributed channel used for cross-process fan-out.

use crate::codec::WireEnvelope;
use async_trait::async_trait;
use concord_core::{BusError, ConcordResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A pub/sub transport shared by bus instances in different processes.
#[async_trait]
pub trait DistributedChannel: Send + Sync {
    /// Publish one envelope on a topic.
    async fn publish(&self, topic: &str, envelope: WireEnvelope) -> ConcordResult<()>;

    /// Receive every envelope published on `topic` from now on.
    fn subscribe(&self, topic: &str) -> ConcordResult<broadcast::Receiver<WireEnvelope>>;

    fn channel_id(&self) -> &str;
}

/// In-process channel backed by one tokio broadcast sender per topic.
///
/// Several [`MessageBus`](crate::MessageBus) instances sharing one
/// `InMemoryChannel` behave like processes sharing a pub/sub service.
#[derive(Debug)]
pub struct InMemoryChannel {
    topics: DashMap<String, broadcast::Sender<WireEnvelope>>,
    capacity: usize,
    published: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of successful publishes, across all topics.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Make every publish fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<WireEnvelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedChannel for InMemoryChannel {
    async fn publish(&self, topic: &str, envelope: WireEnvelope) -> ConcordResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(BusError::PublishFailed {
                topic: topic.to_string(),
                reason: "channel unavailable".to_string(),
            }
            .into());
        }
        // No subscribers is not an error: the envelope is simply not observed.
        let _ = self.sender(topic).send(envelope);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> ConcordResult<broadcast::Receiver<WireEnvelope>> {
        Ok(self.sender(topic).subscribe())
    }

    fn channel_id(&self) -> &str {
        "in-memory"
    }
}
