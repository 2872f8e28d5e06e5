//! The message bus.

use crate::channel::{DistributedChannel, InMemoryChannel};
use crate::codec::{self, WireEnvelope};
use crate::handler::MessageHandler;
use crate::pending::{PendingRequests, PendingResponse, Resolution};
use crate::registry::{EndpointInfo, EndpointRegistry};
use crate::stats::{BusStats, BusStatsSnapshot};
use concord_core::{
    AgentId, AgentMessage, BusConfig, BusError, ConcordError, ConcordResult, MessageId,
    MessageType, Payload, HEADER_BUS_INSTANCE,
};
use futures_util::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Sender id used for events the bus emits itself.
pub const SYSTEM_SENDER: &str = "system";
pub const TOPIC_AGENT_REGISTERED: &str = "system.agent.registered";
pub const TOPIC_AGENT_UNREGISTERED: &str = "system.agent.unregistered";
pub const TOPIC_AGENT_INACTIVE: &str = "system.agent.inactive";

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Settled or abandoned pending entries removed
    pub purged_pending: usize,
    /// Unregistered endpoints forgotten
    pub purged_endpoints: usize,
    /// Endpoints announced on `system.agent.inactive`
    pub inactive: Vec<AgentId>,
}

struct BusInner {
    instance_id: String,
    config: BusConfig,
    channel_topic: String,
    registry: EndpointRegistry,
    pending: Arc<PendingRequests>,
    channel: Arc<dyn DistributedChannel>,
    delivery_permits: Arc<Semaphore>,
    stats: BusStats,
}

/// Routes messages between local endpoints and, through a
/// [`DistributedChannel`], to bus instances in other processes.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus publishing remote traffic on `channel`.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: BusConfig, channel: Arc<dyn DistributedChannel>) -> ConcordResult<Self> {
        config.validate()?;
        let channel_topic = config.qualified_topic();
        let delivery_permits = Arc::new(Semaphore::new(config.delivery_concurrency));
        Ok(Self {
            inner: Arc::new(BusInner {
                instance_id: uuid::Uuid::now_v7().to_string(),
                config,
                channel_topic,
                registry: EndpointRegistry::new(),
                pending: Arc::new(PendingRequests::new()),
                channel,
                delivery_permits,
                stats: BusStats::new(),
            }),
        })
    }

    /// Create a bus with a private in-memory channel.
    pub fn in_memory(config: BusConfig) -> ConcordResult<Self> {
        Self::new(config, Arc::new(InMemoryChannel::new()))
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Distributed topic this bus publishes on and listens to.
    pub fn channel_topic(&self) -> &str {
        &self.inner.channel_topic
    }

    pub fn channel(&self) -> &Arc<dyn DistributedChannel> {
        &self.inner.channel
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.inner.pending
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.inner.stats.snapshot()
    }

    fn window(&self) -> Duration {
        self.inner.config.heartbeat_window
    }

    // ========================================================================
    // ENDPOINTS
    // ========================================================================

    /// Register an endpoint, subscribe it to `agent.{id}` and
    /// `agent-type.{type}`, and announce it on `system.agent.registered`.
    pub async fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        handler: Arc<dyn MessageHandler>,
        capabilities: Vec<String>,
    ) -> ConcordResult<()> {
        if agent_id.trim().is_empty() {
            return Err(BusError::MissingRoutingField {
                field: "agent_id".to_string(),
            }
            .into());
        }
        self.inner
            .registry
            .register(agent_id, agent_type, capabilities.clone(), handler)?;
        tracing::info!(agent_id, agent_type, "Agent registered");

        self.system_event(
            TOPIC_AGENT_REGISTERED,
            json!({
                "agent_id": agent_id,
                "agent_type": agent_type,
                "capabilities": capabilities,
            }),
        )
        .await;
        Ok(())
    }

    /// Deactivate an endpoint, drop its subscriptions and announce it on
    /// `system.agent.unregistered`.
    pub async fn unregister(&self, agent_id: &str) -> ConcordResult<()> {
        let info = self.inner.registry.unregister(agent_id)?;
        tracing::info!(agent_id, agent_type = %info.agent_type, "Agent unregistered");
        self.system_event(
            TOPIC_AGENT_UNREGISTERED,
            json!({ "agent_id": agent_id, "agent_type": info.agent_type }),
        )
        .await;
        Ok(())
    }

    /// Subscribe an endpoint to a topic with its own handler.
    pub fn subscribe(&self, agent_id: &str, topic: &str) -> ConcordResult<()> {
        self.inner.registry.subscribe(agent_id, topic, None)
    }

    /// Subscribe an endpoint to a topic with a dedicated handler.
    pub fn subscribe_with(
        &self,
        agent_id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> ConcordResult<()> {
        self.inner.registry.subscribe(agent_id, topic, Some(handler))
    }

    /// Returns whether the endpoint was subscribed.
    pub fn unsubscribe(&self, agent_id: &str, topic: &str) -> ConcordResult<bool> {
        self.inner.registry.unsubscribe(agent_id, topic)
    }

    pub fn heartbeat(&self, agent_id: &str) -> ConcordResult<()> {
        self.inner.registry.heartbeat(agent_id)
    }

    pub fn is_live(&self, agent_id: &str) -> bool {
        self.inner
            .registry
            .live_handler(agent_id, self.window())
            .is_some()
    }

    pub fn endpoint(&self, agent_id: &str) -> Option<EndpointInfo> {
        self.inner.registry.endpoint(agent_id, self.window())
    }

    /// All known endpoints, sorted by id.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.inner.registry.endpoints(self.window())
    }

    /// Agents subscribed to `topic`, live or not.
    pub fn topic_members(&self, topic: &str) -> Vec<AgentId> {
        self.inner.registry.topic_members(topic)
    }

    pub fn live_endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints().into_iter().filter(|e| e.live).collect()
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    fn validate(&self, message: &AgentMessage) -> ConcordResult<()> {
        for (field, value) in [
            ("from", &message.from),
            ("to", &message.to),
            ("topic", &message.topic),
        ] {
            if value.trim().is_empty() {
                return Err(BusError::MissingRoutingField {
                    field: field.to_string(),
                }
                .into());
            }
        }
        let size = codec::payload_size(&message.payload)?;
        let limit = self.inner.config.max_message_size;
        if size > limit {
            return Err(BusError::MessageTooLarge {
                message_id: message.id,
                size,
                limit,
            }
            .into());
        }
        Ok(())
    }

    /// Route a message without waiting for any handler.
    ///
    /// A RESPONSE matching a local pending request completes it. A message
    /// for a live local endpoint is queued on the delivery pool. A broadcast
    /// reaches live local subscribers of its topic and is also published.
    /// Anything else is published on the distributed channel.
    ///
    /// # Errors
    /// Only validation errors: missing routing fields or a payload over the
    /// size cap. Handler and publish failures are logged and counted.
    pub async fn send(&self, message: AgentMessage) -> ConcordResult<()> {
        self.validate(&message)?;
        if let Err(e) = self.route(message).await {
            tracing::warn!(error = %e, "Message publish failed");
        }
        Ok(())
    }

    async fn route(&self, message: AgentMessage) -> ConcordResult<()> {
        if message.is_response() && message.correlation_id().is_some() {
            match self.inner.pending.resolve(message.clone()) {
                Resolution::Delivered => return Ok(()),
                Resolution::AlreadySettled(how) => {
                    BusStats::incr(&self.inner.stats.dropped_responses);
                    tracing::debug!(
                        message_id = %message.id,
                        settled = ?how,
                        "Dropped response for settled request"
                    );
                    return Ok(());
                }
                Resolution::Unknown => {}
            }
        }

        if message.is_broadcast() {
            self.deliver_to_topic(&message);
            return self.publish(message).await;
        }

        match self.inner.registry.live_handler(&message.to, self.window()) {
            Some(handler) => {
                self.dispatch(message.to.clone(), handler, message);
                Ok(())
            }
            None => self.publish(message).await,
        }
    }

    fn deliver_to_topic(&self, message: &AgentMessage) -> usize {
        let subscribers = self
            .inner
            .registry
            .subscribers(&message.topic, self.window());
        let count = subscribers.len();
        for (agent_id, handler) in subscribers {
            self.dispatch(agent_id, handler, message.clone());
        }
        count
    }

    async fn publish(&self, mut message: AgentMessage) -> ConcordResult<()> {
        message
            .headers
            .insert(HEADER_BUS_INSTANCE.to_string(), self.inner.instance_id.clone());
        let envelope = codec::encode(&message)?;
        match self
            .inner
            .channel
            .publish(&self.inner.channel_topic, envelope)
            .await
        {
            Ok(()) => {
                BusStats::incr(&self.inner.stats.distributed_publishes);
                tracing::debug!(
                    message_id = %message.id,
                    topic = %message.topic,
                    to = %message.to,
                    "Published on distributed channel"
                );
                Ok(())
            }
            Err(e) => {
                BusStats::incr(&self.inner.stats.publish_failures);
                Err(e)
            }
        }
    }

    /// Run a handler on the delivery pool. Never runs on the caller's stack.
    fn dispatch(&self, agent_id: AgentId, handler: Arc<dyn MessageHandler>, message: AgentMessage) {
        BusStats::incr(&self.inner.stats.local_deliveries);
        tracing::debug!(
            message_id = %message.id,
            agent_id = %agent_id,
            topic = %message.topic,
            message_type = %message.message_type,
            "Dispatching message"
        );
        let bus = self.clone();
        let permits = self.inner.delivery_permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let message_id = message.id;
            let is_request = message.is_request();
            let outcome = AssertUnwindSafe(handler.handle(&bus, message))
                .catch_unwind()
                .await;
            let reason = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            BusStats::incr(&bus.inner.stats.handler_failures);
            tracing::warn!(
                message_id = %message_id,
                agent_id = %agent_id,
                reason = %reason,
                "Message handler failed"
            );
            if is_request {
                bus.inner.pending.fail(
                    message_id,
                    BusError::Delivery {
                        message_id,
                        agent_id,
                        reason,
                    }
                    .into(),
                );
            }
        });
    }

    // ========================================================================
    // REQUEST / RESPONSE
    // ========================================================================

    /// Send a REQUEST and return a future for its RESPONSE.
    ///
    /// The pending entry is registered and its timer armed before the
    /// message is routed, so a fast responder cannot race the registration.
    ///
    /// # Arguments
    /// * `from` - Requesting agent; the response is addressed back to it
    /// * `to` - Target agent
    /// * `topic` - Request topic
    /// * `payload` - Request body
    /// * `timeout` - Deadline after which the future fails with a timeout error
    ///
    /// # Errors
    /// Validation errors are returned immediately. Timeouts and handler
    /// failures surface through the returned future.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        topic: &str,
        payload: Payload,
        timeout: Duration,
    ) -> ConcordResult<PendingResponse> {
        let message = AgentMessage::request(from, to, topic, payload);
        self.request_message(message, timeout).await
    }

    /// [`request`](Self::request) for a prebuilt REQUEST message.
    pub async fn request_message(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> ConcordResult<PendingResponse> {
        if !message.is_request() {
            return Err(BusError::NotARequest {
                message_id: message.id,
                message_type: message.message_type,
            }
            .into());
        }
        self.validate(&message)?;

        let message_id = message.id;
        let receiver = self
            .inner
            .pending
            .insert(message_id, message.to.clone())?;
        let response = PendingResponse::new(message_id, receiver, self.inner.pending.clone());

        let bus = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if bus.inner.pending.time_out(message_id, timeout) {
                BusStats::incr(&bus.inner.stats.timeouts);
            }
        });
        self.inner.pending.arm_timer(message_id, timer.abort_handle());

        let to = message.to.clone();
        if let Err(e) = self.route(message).await {
            self.inner.pending.fail(
                message_id,
                BusError::Delivery {
                    message_id,
                    agent_id: to,
                    reason: e.to_string(),
                }
                .into(),
            );
        }
        Ok(response)
    }

    /// Send a REQUEST and wait for its RESPONSE.
    pub async fn call(
        &self,
        from: &str,
        to: &str,
        topic: &str,
        payload: Payload,
        timeout: Duration,
    ) -> ConcordResult<AgentMessage> {
        self.request(from, to, topic, payload, timeout).await?.await
    }

    /// Send a RESPONSE to `request`, correlated by its id and addressed back
    /// to its sender.
    ///
    /// # Errors
    /// `NotARequest` if `request` is not a REQUEST.
    pub async fn respond(&self, request: &AgentMessage, payload: Payload) -> ConcordResult<MessageId> {
        if !request.is_request() {
            return Err(BusError::NotARequest {
                message_id: request.id,
                message_type: request.message_type,
            }
            .into());
        }
        let response = AgentMessage::builder(
            request.to.clone(),
            request.from.clone(),
            MessageType::Response,
            request.topic.clone(),
        )
        .with_payload(payload)
        .with_correlation_id(request.id)
        .build();
        let id = response.id;
        self.send(response).await?;
        Ok(id)
    }

    /// Deliver to every live local subscriber of `topic` and publish on the
    /// distributed channel.
    pub async fn broadcast(&self, from: &str, topic: &str, payload: Payload) -> ConcordResult<()> {
        self.send(AgentMessage::broadcast(from, topic, payload)).await
    }

    async fn system_event(&self, topic: &str, payload: serde_json::Value) {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => Payload::new(),
        };
        let event = AgentMessage::builder(
            SYSTEM_SENDER,
            concord_core::BROADCAST_TARGET,
            MessageType::Event,
            topic,
        )
        .with_payload(payload)
        .build();
        if let Err(e) = self.send(event).await {
            tracing::warn!(topic, error = %e, "System event rejected");
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// One maintenance pass: purge settled pending entries and long-gone
    /// endpoints, then announce every endpoint that lapsed since its last
    /// heartbeat on `system.agent.inactive`.
    pub async fn sweep_once(&self) -> SweepReport {
        let retention = self.inner.config.settled_retention;
        let purged_pending = self.inner.pending.purge(retention);
        let purged_endpoints = self.inner.registry.purge_unregistered(retention);
        let lapsed = self.inner.registry.take_lapsed(self.window());
        BusStats::incr(&self.inner.stats.sweeps);

        for (agent_id, agent_type) in &lapsed {
            tracing::info!(agent_id = %agent_id, agent_type = %agent_type, "Agent inactive");
            self.system_event(
                TOPIC_AGENT_INACTIVE,
                json!({ "agent_id": agent_id, "agent_type": agent_type }),
            )
            .await;
        }

        let report = SweepReport {
            purged_pending,
            purged_endpoints,
            inactive: lapsed.into_iter().map(|(id, _)| id).collect(),
        };
        if report != SweepReport::default() {
            tracing::info!(
                purged_pending = report.purged_pending,
                purged_endpoints = report.purged_endpoints,
                inactive = report.inactive.len(),
                "Bus sweep completed"
            );
        } else {
            tracing::trace!("Bus sweep completed with nothing to do");
        }
        report
    }

    /// Handle one envelope received from the distributed channel.
    ///
    /// Envelopes this instance published are ignored. Responses complete
    /// local pending requests; broadcasts reach local subscribers; direct
    /// messages reach live local endpoints. Nothing is republished.
    pub async fn ingest(&self, envelope: WireEnvelope) -> ConcordResult<()> {
        if envelope.attribute(HEADER_BUS_INSTANCE) == Some(self.instance_id()) {
            return Ok(());
        }
        let message = codec::decode(&envelope)?;
        BusStats::incr(&self.inner.stats.inbound_messages);

        if message.is_response() && message.correlation_id().is_some() {
            match self.inner.pending.resolve(message) {
                Resolution::Delivered | Resolution::Unknown => {}
                Resolution::AlreadySettled(_) => {
                    BusStats::incr(&self.inner.stats.dropped_responses);
                }
            }
            return Ok(());
        }

        if message.is_broadcast() {
            self.deliver_to_topic(&message);
            return Ok(());
        }

        match self.inner.registry.live_handler(&message.to, self.window()) {
            Some(handler) => self.dispatch(message.to.clone(), handler, message),
            None => tracing::trace!(to = %message.to, "Inbound message not for this instance"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("instance_id", &self.inner.instance_id)
            .field("channel", &self.inner.channel.channel_id())
            .field("channel_topic", &self.inner.channel_topic)
            .field("registry", &self.inner.registry)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

/// Convenience for building error values in handlers.
pub fn delivery_error(message: &AgentMessage, reason: impl Into<String>) -> ConcordError {
    BusError::Delivery {
        message_id: message.id,
        agent_id: message.to.clone(),
        reason: reason.into(),
    }
    .into()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, NoopHandler};
    use concord_core::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> MessageBus {
        MessageBus::in_memory(BusConfig::default()).unwrap()
    }

    fn echo() -> Arc<dyn MessageHandler> {
        handler_fn(|bus, message| async move {
            if message.is_request() {
                bus.respond(&message, message.payload.clone()).await?;
            }
            Ok::<_, ConcordError>(())
        })
    }

    fn payload(key: &str, value: &str) -> Payload {
        let mut p = Payload::new();
        p.insert(key.to_string(), value.into());
        p
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let bus = bus();
        bus.register("b", "echo", echo(), vec![]).await.unwrap();
        let reply = bus
            .call("a", "b", "ping", payload("x", "1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(reply.is_response());
        assert_eq!(reply.from, "b");
        assert_eq!(reply.to, "a");
        assert_eq!(reply.payload_str("x"), Some("1"));
        assert_eq!(bus.pending().waiting(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let config = BusConfig {
            max_message_size: 16,
            ..Default::default()
        };
        let bus = MessageBus::in_memory(config).unwrap();
        let big = payload("data", &"x".repeat(64));
        let err = bus
            .send(AgentMessage::request("a", "b", "t", big))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(matches!(err, ConcordError::Bus(BusError::MessageTooLarge { limit: 16, .. })));
    }

    #[tokio::test]
    async fn test_missing_routing_field_rejected() {
        let bus = bus();
        let err = bus
            .send(AgentMessage::request("a", "", "t", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Bus(BusError::MissingRoutingField { ref field }) if field == "to"
        ));
    }

    #[tokio::test]
    async fn test_respond_to_non_request_rejected() {
        let bus = bus();
        let event = AgentMessage::broadcast("a", "t", Payload::new());
        let err = bus.respond(&event, Payload::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_handler_error_fails_request() {
        let bus = bus();
        let failing = handler_fn(|_bus, message| async move {
            Err::<(), _>(delivery_error(&message, "model exploded"))
        });
        bus.register("b", "broken", failing, vec![]).await.unwrap();
        let err = bus
            .call("a", "b", "t", Payload::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Delivery);
        assert_eq!(bus.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_fails_request() {
        let bus = bus();
        let panicking = handler_fn(|_bus, _message| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, ConcordError>(())
        });
        bus.register("b", "broken", panicking, vec![]).await.unwrap();
        let err = bus
            .call("a", "b", "t", Payload::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_send_never_fails_on_handler_error() {
        let bus = bus();
        let failing = handler_fn(|_bus, message| async move {
            Err::<(), _>(delivery_error(&message, "no"))
        });
        bus.register("b", "broken", failing, vec![]).await.unwrap();
        let msg = AgentMessage::builder("a", "b", MessageType::Command, "t").build();
        assert!(bus.send(msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        for id in ["s1", "s2"] {
            let seen = seen.clone();
            let handler = handler_fn(move |_bus, _message| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ConcordError>(())
                }
            });
            bus.register(id, "listener", handler, vec![]).await.unwrap();
            bus.subscribe(id, "news").unwrap();
        }
        let before = bus.stats();
        bus.broadcast("x", "news", Payload::new()).await.unwrap();
        let after = bus.stats();
        assert_eq!(after.local_deliveries - before.local_deliveries, 2);
        assert_eq!(after.distributed_publishes - before.distributed_publishes, 1);

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_target_is_published() {
        let bus = bus();
        let before = bus.stats();
        bus.send(AgentMessage::builder("a", "remote", MessageType::Command, "t").build())
            .await
            .unwrap();
        let after = bus.stats();
        assert_eq!(after.local_deliveries, before.local_deliveries);
        assert_eq!(after.distributed_publishes - before.distributed_publishes, 1);
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let bus = bus();
        bus.register("a", "t", Arc::new(NoopHandler), vec![]).await.unwrap();
        let err = bus
            .register("a", "t", Arc::new(NoopHandler), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ConcordError::Bus(BusError::AlreadyRegistered { .. })));
    }

    #[tokio::test]
    async fn test_publish_failure_fails_request() {
        let channel = Arc::new(InMemoryChannel::new());
        channel.set_unavailable(true);
        let bus = MessageBus::new(BusConfig::default(), channel).unwrap();
        let err = bus
            .call("a", "remote", "t", Payload::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Delivery);
    }

    #[tokio::test]
    async fn test_ingest_ignores_own_envelopes() {
        let bus = bus();
        let mut message = AgentMessage::broadcast("a", "t", Payload::new());
        message
            .headers
            .insert(HEADER_BUS_INSTANCE.to_string(), bus.instance_id().to_string());
        bus.ingest(codec::encode(&message).unwrap()).await.unwrap();
        assert_eq!(bus.stats().inbound_messages, 0);
    }
}
