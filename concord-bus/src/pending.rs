//! Pending-request table.
//!
//! One entry per in-flight REQUEST, keyed by the request's message id. A
//! waiting entry owns the sender half of the caller's result channel and the
//! timer that will time it out. Every transition out of `Waiting` replaces the
//! entry with a settled tombstone in one step under the entry's shard lock, so
//! exactly one of resolve, fail, time out or cancel wins. Tombstones let late
//! duplicates be told apart from ids this bus never saw, and are purged by the
//! sweep after the retention period.

use concord_core::{AgentId, AgentMessage, BusError, ConcordError, ConcordResult, MessageId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

type ResultSender = oneshot::Sender<ConcordResult<AgentMessage>>;

/// How a request left the waiting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Resolved,
    TimedOut,
    Failed,
    Cancelled,
}

/// Outcome of offering a response to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The waiting caller received the response.
    Delivered,
    /// The request had already settled; the response was dropped.
    AlreadySettled(Settlement),
    /// No request with this id is known here.
    Unknown,
}

#[derive(Debug)]
enum PendingEntry {
    Waiting {
        target: AgentId,
        sender: ResultSender,
        timer: Option<AbortHandle>,
    },
    Settled {
        at: Instant,
        how: Settlement,
    },
}

impl PendingEntry {
    fn settled(how: Settlement) -> Self {
        PendingEntry::Settled {
            at: Instant::now(),
            how,
        }
    }
}

/// Concurrent table of in-flight requests.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: DashMap<MessageId, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiting request. Fails if the id is already present,
    /// waiting or settled.
    pub(crate) fn insert(
        &self,
        message_id: MessageId,
        target: AgentId,
    ) -> ConcordResult<oneshot::Receiver<ConcordResult<AgentMessage>>> {
        match self.entries.entry(message_id) {
            Entry::Occupied(_) => Err(BusError::DuplicatePending { message_id }.into()),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingEntry::Waiting {
                    target,
                    sender,
                    timer: None,
                });
                Ok(receiver)
            }
        }
    }

    /// Attach the timeout timer to a waiting entry. If the entry already
    /// settled the timer is aborted.
    pub(crate) fn arm_timer(&self, message_id: MessageId, timer: AbortHandle) {
        match self.entries.get_mut(&message_id) {
            Some(mut entry) => match entry.value_mut() {
                PendingEntry::Waiting { timer: slot, .. } => *slot = Some(timer),
                PendingEntry::Settled { .. } => timer.abort(),
            },
            None => timer.abort(),
        }
    }

    /// Move a waiting entry to settled and hand back what it owned.
    fn settle(
        &self,
        message_id: MessageId,
        how: Settlement,
    ) -> Result<(AgentId, ResultSender), Resolution> {
        let Some(mut entry) = self.entries.get_mut(&message_id) else {
            return Err(Resolution::Unknown);
        };
        if let PendingEntry::Settled { how: prior, .. } = entry.value() {
            return Err(Resolution::AlreadySettled(*prior));
        }
        match std::mem::replace(entry.value_mut(), PendingEntry::settled(how)) {
            PendingEntry::Waiting {
                target,
                sender,
                timer,
            } => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                Ok((target, sender))
            }
            PendingEntry::Settled { how: prior, .. } => Err(Resolution::AlreadySettled(prior)),
        }
    }

    /// Complete the request answered by `response`. First match wins.
    pub fn resolve(&self, response: AgentMessage) -> Resolution {
        let Some(request_id) = response.correlation_id() else {
            return Resolution::Unknown;
        };
        match self.settle(request_id, Settlement::Resolved) {
            Ok((_, sender)) => {
                // A closed receiver means the caller stopped waiting.
                let _ = sender.send(Ok(response));
                Resolution::Delivered
            }
            Err(resolution) => resolution,
        }
    }

    /// Fail a waiting request. Returns false if it was not waiting.
    pub fn fail(&self, message_id: MessageId, error: ConcordError) -> bool {
        match self.settle(message_id, Settlement::Failed) {
            Ok((_, sender)) => {
                let _ = sender.send(Err(error));
                true
            }
            Err(_) => false,
        }
    }

    /// Time out a waiting request. Returns false if it was not waiting.
    pub fn time_out(&self, message_id: MessageId, timeout: Duration) -> bool {
        match self.settle(message_id, Settlement::TimedOut) {
            Ok((target, sender)) => {
                tracing::debug!(message_id = %message_id, agent_id = %target, "Request timed out");
                let _ = sender.send(Err(BusError::Timeout {
                    message_id,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into()));
                true
            }
            Err(_) => false,
        }
    }

    /// Abandon a waiting request on behalf of a caller that went away.
    pub fn cancel(&self, message_id: MessageId) -> bool {
        self.settle(message_id, Settlement::Cancelled).is_ok()
    }

    /// Remove tombstones older than `retention` and waiting entries whose
    /// caller has gone away.
    pub fn purge(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            PendingEntry::Waiting { sender, timer, .. } => {
                if sender.is_closed() {
                    if let Some(timer) = timer.take() {
                        timer.abort();
                    }
                    false
                } else {
                    true
                }
            }
            PendingEntry::Settled { at, .. } => now.saturating_duration_since(*at) < retention,
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn is_waiting(&self, message_id: &MessageId) -> bool {
        self.entries
            .get(message_id)
            .is_some_and(|e| matches!(e.value(), PendingEntry::Waiting { .. }))
    }

    pub fn settlement(&self, message_id: &MessageId) -> Option<Settlement> {
        self.entries.get(message_id).and_then(|e| match e.value() {
            PendingEntry::Settled { how, .. } => Some(*how),
            PendingEntry::Waiting { .. } => None,
        })
    }

    /// Number of requests still waiting.
    pub fn waiting(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), PendingEntry::Waiting { .. }))
            .count()
    }

    /// Waiting entries plus tombstones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// PENDING RESPONSE
// ============================================================================

/// Future returned by [`MessageBus::request`](crate::MessageBus::request).
///
/// Resolves with the matching RESPONSE or fails with a timeout or delivery
/// error. Dropping it before completion cancels the request and releases its
/// bookkeeping; a handler already running elsewhere is not interrupted and
/// its late response is dropped.
#[derive(Debug)]
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    message_id: MessageId,
    receiver: oneshot::Receiver<ConcordResult<AgentMessage>>,
    table: Arc<PendingRequests>,
    done: bool,
}

impl PendingResponse {
    pub(crate) fn new(
        message_id: MessageId,
        receiver: oneshot::Receiver<ConcordResult<AgentMessage>>,
        table: Arc<PendingRequests>,
    ) -> Self {
        Self {
            message_id,
            receiver,
            table,
            done: false,
        }
    }

    /// Id of the REQUEST this future waits on.
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl Future for PendingResponse {
    type Output = ConcordResult<AgentMessage>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(BusError::Delivery {
                        message_id: this.message_id,
                        agent_id: String::new(),
                        reason: "pending request was discarded".to_string(),
                    }
                    .into())
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.done && self.table.cancel(self.message_id) {
            tracing::debug!(message_id = %self.message_id, "Pending request cancelled");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::MessageType;

    fn response_to(request_id: MessageId, n: i64) -> AgentMessage {
        AgentMessage::builder("b", "a", MessageType::Response, "t")
            .with_correlation_id(request_id)
            .with_field("n", n)
            .build()
    }

    fn table() -> Arc<PendingRequests> {
        Arc::new(PendingRequests::new())
    }

    #[tokio::test]
    async fn test_first_response_wins() {
        let table = table();
        let id = concord_core::new_message_id();
        let rx = table.insert(id, "b".into()).unwrap();
        let pending = PendingResponse::new(id, rx, table.clone());

        assert_eq!(table.resolve(response_to(id, 1)), Resolution::Delivered);
        assert_eq!(
            table.resolve(response_to(id, 2)),
            Resolution::AlreadySettled(Settlement::Resolved)
        );

        let reply = pending.await.unwrap();
        assert_eq!(reply.payload.get("n").and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let table = table();
        let id = concord_core::new_message_id();
        let _rx = table.insert(id, "b".into()).unwrap();
        assert!(matches!(
            table.insert(id, "b".into()),
            Err(ConcordError::Bus(BusError::DuplicatePending { .. }))
        ));
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_dropped() {
        let table = table();
        let id = concord_core::new_message_id();
        let rx = table.insert(id, "b".into()).unwrap();
        let pending = PendingResponse::new(id, rx, table.clone());

        assert!(table.time_out(id, Duration::from_millis(5)));
        assert_eq!(
            table.resolve(response_to(id, 1)),
            Resolution::AlreadySettled(Settlement::TimedOut)
        );
        assert!(matches!(
            pending.await,
            Err(ConcordError::Bus(BusError::Timeout { timeout_ms: 5, .. }))
        ));
    }

    #[test]
    fn test_unknown_response() {
        let table = table();
        let orphan = AgentMessage::builder("b", "a", MessageType::Response, "t").build();
        assert_eq!(table.resolve(orphan), Resolution::Unknown);
        assert_eq!(
            table.resolve(response_to(concord_core::new_message_id(), 0)),
            Resolution::Unknown
        );
    }

    #[test]
    fn test_drop_cancels() {
        let table = table();
        let id = concord_core::new_message_id();
        let rx = table.insert(id, "b".into()).unwrap();
        drop(PendingResponse::new(id, rx, table.clone()));
        assert!(!table.is_waiting(&id));
        assert_eq!(table.settlement(&id), Some(Settlement::Cancelled));
        assert_eq!(table.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_respects_retention() {
        let table = table();
        let settled = concord_core::new_message_id();
        let _rx = table.insert(settled, "b".into()).unwrap();
        table.fail(
            settled,
            BusError::Codec {
                reason: "x".into(),
            }
            .into(),
        );
        let live = concord_core::new_message_id();
        let _live_rx = table.insert(live, "b".into()).unwrap();

        assert_eq!(table.purge(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(table.purge(Duration::from_secs(60)), 1);
        assert!(table.is_waiting(&live));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_purge_drops_abandoned_waiters() {
        let table = table();
        let id = concord_core::new_message_id();
        let rx = table.insert(id, "b".into()).unwrap();
        drop(rx);
        assert_eq!(table.purge(Duration::from_secs(60)), 1);
        assert!(table.is_empty());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use concord_core::MessageType;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_exactly_one_settlement(ops in prop::collection::vec(0u8..4, 1..12)) {
            let table = PendingRequests::new();
            let id = concord_core::new_message_id();
            let mut rx = table.insert(id, "b".into()).unwrap();

            let mut wins = 0;
            for op in ops {
                let won = match op {
                    0 => {
                        let reply = AgentMessage::builder("b", "a", MessageType::Response, "t")
                            .with_correlation_id(id)
                            .build();
                        table.resolve(reply) == Resolution::Delivered
                    }
                    1 => table.fail(id, BusError::Codec { reason: "x".into() }.into()),
                    2 => table.time_out(id, Duration::from_millis(1)),
                    _ => table.cancel(id),
                };
                if won {
                    wins += 1;
                }
            }
            prop_assert_eq!(wins, 1);
            prop_assert!(!table.is_waiting(&id));
            // Cancel sends nothing; every other winner sends exactly once.
            let _ = rx.try_recv();
        }
    }
}
