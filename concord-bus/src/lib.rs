//! Concord Bus - Agent Messaging
//!
//! Routes [`AgentMessage`](concord_core::AgentMessage)s between agent
//! endpoints:
//! - Direct delivery to live local endpoints on a bounded delivery pool
//! - Topic subscriptions and broadcasts
//! - REQUEST/RESPONSE correlation with per-request timeouts
//! - Heartbeat liveness with a periodic sweep
//! - A distributed channel bridging bus instances in other processes
//!
//! ```no_run
//! use concord_bus::{handler_fn, MessageBus};
//! use concord_core::{BusConfig, ConcordError, Payload};
//! use std::time::Duration;
//!
//! # async fn demo() -> concord_core::ConcordResult<()> {
//! let bus = MessageBus::in_memory(BusConfig::default())?;
//! let tasks = bus.start()?;
//!
//! let echo = handler_fn(|bus, message| async move {
//!     bus.respond(&message, message.payload.clone()).await?;
//!     Ok::<_, ConcordError>(())
//! });
//! bus.register("echo-1", "echo", echo, vec![]).await?;
//!
//! let reply = bus
//!     .call("caller", "echo-1", "ping", Payload::new(), Duration::from_secs(5))
//!     .await?;
//! assert!(reply.is_response());
//!
//! tasks.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod bus;
pub mod channel;
pub mod codec;
pub mod handler;
pub mod pending;
mod registry;
pub mod runtime;
pub mod stats;

pub use bus::{
    delivery_error, MessageBus, SweepReport, SYSTEM_SENDER, TOPIC_AGENT_INACTIVE,
    TOPIC_AGENT_REGISTERED, TOPIC_AGENT_UNREGISTERED,
};
pub use channel::{DistributedChannel, InMemoryChannel};
pub use codec::WireEnvelope;
pub use handler::{handler_fn, FnHandler, MessageHandler, NoopHandler};
pub use pending::{PendingRequests, PendingResponse, Resolution, Settlement};
pub use registry::{agent_topic, agent_type_topic, EndpointInfo};
pub use runtime::{bus_listener_task, bus_sweeper_task, BusTaskSummary, BusTasks};
pub use stats::{BusStats, BusStatsSnapshot};
