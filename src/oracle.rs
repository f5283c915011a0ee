//! Periodic out-of-band observation of the backend.
//!
//! The oracle combines the IPMI power status with a TCP reachability probe
//! and posts the derived signal onto the state machine's event channel. It
//! never mutates lifecycle state itself; its output is advisory.

use crate::ipmi::{ObservedPower, PowerEffector};
use crate::lifecycle::Event;
use crate::probe::{probe, Reachability};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Derived backend observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedSignal {
    /// Power is off
    Off,
    /// Power is on but the backend port does not answer yet
    Starting,
    /// Power is on and the backend port accepts connections
    Ready,
    /// The power query failed; no conclusion
    Unknown,
}

pub struct Oracle<E> {
    effector: Arc<E>,
    target_host: String,
    /// First configured backend port; one answering port defines READY
    probe_port: u16,
    check_interval: Duration,
    probe_timeout: Duration,
    events_tx: mpsc::Sender<Event>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: PowerEffector> Oracle<E> {
    pub fn new(
        effector: Arc<E>,
        target_host: String,
        probe_port: u16,
        check_interval: Duration,
        probe_timeout: Duration,
        events_tx: mpsc::Sender<Event>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            effector,
            target_host,
            probe_port,
            check_interval,
            probe_timeout,
            events_tx,
            shutdown_rx,
        }
    }

    /// Observe immediately, then on every tick until shutdown. The first
    /// observation lets the machine sync with an already-running backend
    /// without waiting a full interval.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.check_interval.as_secs_f64(),
            port = self.probe_port,
            "Power state oracle started"
        );

        loop {
            let signal = self.observe().await;
            if self.events_tx.send(Event::Observed(signal)).await.is_err() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("Oracle shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn observe(&self) -> ObservedSignal {
        let signal = match self.effector.query_power().await {
            ObservedPower::Off => ObservedSignal::Off,
            ObservedPower::Unknown => ObservedSignal::Unknown,
            ObservedPower::On => {
                match probe(&self.target_host, self.probe_port, self.probe_timeout).await {
                    Reachability::Reachable => ObservedSignal::Ready,
                    Reachability::Unreachable => ObservedSignal::Starting,
                }
            }
        };
        debug!(?signal, "Backend observed");
        signal
    }
}
