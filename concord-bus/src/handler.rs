//! Message handlers invoked by the delivery pool.

use crate::MessageBus;
use async_trait::async_trait;
use concord_core::{AgentMessage, ConcordResult};
use std::future::Future;
use std::sync::Arc;

/// Receives messages delivered to an endpoint or topic subscription.
///
/// Returning an error, or panicking, while handling a REQUEST fails the
/// requester's pending call with a delivery error. Handlers reply through
/// [`MessageBus::respond`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, bus: &MessageBus, message: AgentMessage) -> ConcordResult<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageBus, AgentMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ConcordResult<()>> + Send,
{
    async fn handle(&self, bus: &MessageBus, message: AgentMessage) -> ConcordResult<()> {
        (self.f)(bus.clone(), message).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```
/// use concord_bus::handler_fn;
/// use concord_core::ConcordError;
///
/// let echo = handler_fn(|bus, message| async move {
///     if message.is_request() {
///         bus.respond(&message, message.payload.clone()).await?;
///     }
///     Ok::<_, ConcordError>(())
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MessageBus, AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConcordResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handler that accepts and drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl MessageHandler for NoopHandler {
    async fn handle(&self, _bus: &MessageBus, _message: AgentMessage) -> ConcordResult<()> {
        Ok(())
    }
}
