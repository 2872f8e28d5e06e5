//! Background tasks that keep a bus healthy: the liveness sweeper and the
//! distributed-channel listener.

use crate::codec::WireEnvelope;
use crate::MessageBus;
use concord_core::ConcordResult;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Periodically run [`MessageBus::sweep_once`] until shutdown is signalled.
///
/// Returns the number of sweeps performed.
pub async fn bus_sweeper_task(bus: MessageBus, mut shutdown_rx: watch::Receiver<bool>) -> u64 {
    let mut sweep_interval = interval(bus.config().sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        instance_id = %bus.instance_id(),
        sweep_interval_ms = bus.config().sweep_interval.as_millis() as u64,
        heartbeat_window_secs = bus.config().heartbeat_window.as_secs(),
        "Bus sweeper started"
    );

    let mut sweeps = 0u64;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Bus sweeper shutting down");
                    break;
                }
            }
            _ = sweep_interval.tick() => {
                bus.sweep_once().await;
                sweeps += 1;
            }
        }
    }

    tracing::info!(sweeps, "Bus sweeper completed");
    sweeps
}

/// Feed envelopes from the distributed channel into [`MessageBus::ingest`]
/// until shutdown is signalled or the channel closes.
///
/// Returns the number of envelopes received.
pub async fn bus_listener_task(
    bus: MessageBus,
    mut inbound: broadcast::Receiver<WireEnvelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64 {
    tracing::info!(
        instance_id = %bus.instance_id(),
        topic = %bus.channel_topic(),
        channel = %bus.channel().channel_id(),
        "Bus listener started"
    );

    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Bus listener shutting down");
                    break;
                }
            }
            next = inbound.recv() => match next {
                Ok(envelope) => {
                    received += 1;
                    if let Err(e) = bus.ingest(envelope).await {
                        tracing::warn!(error = %e, "Dropped malformed inbound envelope");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Bus listener lagged behind the channel");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Distributed channel closed");
                    break;
                }
            }
        }
    }

    tracing::info!(received, "Bus listener completed");
    received
}

/// Handles to a running bus's background tasks.
#[derive(Debug)]
pub struct BusTasks {
    shutdown_tx: watch::Sender<bool>,
    sweeper: JoinHandle<u64>,
    listener: JoinHandle<u64>,
}

/// Totals reported by the background tasks when they stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusTaskSummary {
    pub sweeps: u64,
    pub envelopes_received: u64,
}

impl BusTasks {
    /// Signal both tasks to stop and wait for them.
    pub async fn shutdown(self) -> BusTaskSummary {
        let _ = self.shutdown_tx.send(true);
        let sweeps = match self.sweeper.await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Bus sweeper did not stop cleanly");
                0
            }
        };
        let envelopes_received = match self.listener.await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Bus listener did not stop cleanly");
                0
            }
        };
        BusTaskSummary {
            sweeps,
            envelopes_received,
        }
    }
}

impl MessageBus {
    /// Spawn the sweeper and the distributed listener.
    ///
    /// The channel subscription is taken before this returns, so envelopes
    /// published afterwards are never missed.
    pub fn start(&self) -> ConcordResult<BusTasks> {
        let inbound = self.channel().subscribe(self.channel_topic())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(bus_sweeper_task(self.clone(), shutdown_rx.clone()));
        let listener = tokio::spawn(bus_listener_task(self.clone(), inbound, shutdown_rx));
        Ok(BusTasks {
            shutdown_tx,
            sweeper,
            listener,
        })
    }
}
