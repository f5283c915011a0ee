//! Component wiring and process lifetime.

use crate::config::{PortMapping, Settings};
use crate::ipmi::PowerEffector;
use crate::lifecycle::{Event, LifecycleState, Machine, MachineHandles};
use crate::listener::PortListener;
use crate::oracle::Oracle;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Interval for polling the in-flight count during shutdown drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the state machine, the oracle and the listener set, and sequences
/// shutdown: stop accepting, fail held connections, drain forwarders for a
/// grace period. The backend is deliberately left powered on - shutting
/// down the proxy is not shutting down the backend.
pub struct Supervisor<E> {
    settings: Settings,
    target_host: String,
    effector: Arc<E>,
    mappings: Vec<PortMapping>,
    listeners: Vec<PortListener>,
    addrs: Vec<SocketAddr>,
    machine: Machine<E>,
    handles: MachineHandles,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: PowerEffector> Supervisor<E> {
    /// Bind every configured listener up front; any bind failure is fatal
    /// before the proxy starts serving.
    pub async fn bind(
        proxy_host: &str,
        mappings: Vec<PortMapping>,
        target_host: String,
        settings: Settings,
        effector: Arc<E>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!mappings.is_empty(), "no port mappings configured");

        let (machine, handles) =
            Machine::new(settings.clone(), target_host.clone(), Arc::clone(&effector));

        let mut listeners = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let listener = PortListener::bind(
                proxy_host,
                *mapping,
                settings.request_timeout,
                handles.events_tx.clone(),
                handles.state_rx.clone(),
                Arc::clone(&handles.idle),
                shutdown_rx.clone(),
            )
            .await?;
            listeners.push(listener);
        }
        let addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            settings,
            target_host,
            effector,
            mappings,
            listeners,
            addrs,
            machine,
            handles,
            shutdown_rx,
        })
    }

    /// Bound listener addresses, in mapping order.
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Snapshot reader for the lifecycle state.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.handles.state_rx.clone()
    }

    /// Run until the shutdown signal fires, then drain.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            settings,
            target_host,
            effector,
            mappings,
            listeners,
            addrs: _,
            machine,
            handles,
            mut shutdown_rx,
        } = self;

        let oracle = Oracle::new(
            effector,
            target_host,
            mappings[0].backend_port,
            settings.check_interval,
            settings.probe_timeout,
            handles.events_tx.clone(),
            shutdown_rx.clone(),
        );

        let machine_task = tokio::spawn(machine.run());
        tokio::spawn(oracle.run());
        for listener in listeners {
            tokio::spawn(listener.run());
        }
        info!("Proxy running");

        // A closed shutdown channel means the owner is gone; treat it the
        // same as an explicit signal.
        loop {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }
        info!("Shutdown requested, stopping accepts and failing held connections");

        let _ = handles.events_tx.send(Event::Shutdown).await;
        machine_task
            .await
            .map_err(|e| anyhow::anyhow!("lifecycle state machine task failed: {}", e))?;

        // Let live forwarders finish within the grace period.
        let grace = settings.request_timeout;
        let drain_start = Instant::now();
        while handles.in_flight.load(Ordering::SeqCst) > 0 {
            if drain_start.elapsed() > grace {
                warn!(
                    remaining = handles.in_flight.load(Ordering::SeqCst),
                    "Drain grace period exceeded, abandoning open connections"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("Proxy stopped; backend power state left unchanged");
        Ok(())
    }
}
