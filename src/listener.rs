//! Per-mapping TCP acceptors.

use crate::config::PortMapping;
use crate::idle::IdleAccountant;
use crate::lifecycle::{Event, LifecycleState};
use crate::queue::PendingIntent;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// One acceptor per configured port mapping. Accepted connections become
/// pending intents posted to the state machine; the machine decides
/// between immediate forwarding and holding.
pub struct PortListener {
    listener: TcpListener,
    mapping: PortMapping,
    request_timeout: Duration,
    events_tx: mpsc::Sender<Event>,
    state_rx: watch::Receiver<LifecycleState>,
    idle: Arc<IdleAccountant>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PortListener {
    pub async fn bind(
        bind_host: &str,
        mapping: PortMapping,
        request_timeout: Duration,
        events_tx: mpsc::Sender<Event>,
        state_rx: watch::Receiver<LifecycleState>,
        idle: Arc<IdleAccountant>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", bind_host, mapping.listen_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            anyhow::anyhow!("cannot bind listener on {}: {}", addr, e)
        })?;
        info!(
            addr = %listener.local_addr()?,
            backend_port = mapping.backend_port,
            "Listener bound"
        );
        Ok(Self {
            listener,
            mapping,
            request_timeout,
            events_tx,
            state_rx,
            idle,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) {
        let mut backoff = ACCEPT_BACKOFF_START;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            backoff = ACCEPT_BACKOFF_START;

                            // Accept counts as activity only once the
                            // backend is up; a cold-start connection must
                            // not look like recent backend traffic.
                            if *self.state_rx.borrow() == LifecycleState::Ready {
                                self.idle.touch();
                            }

                            let intent = PendingIntent::new(
                                stream,
                                peer,
                                self.mapping.listen_port,
                                self.mapping.backend_port,
                                tokio::time::Instant::now() + self.request_timeout,
                            );
                            debug!(
                                intent = %intent.id,
                                %peer,
                                listen_port = self.mapping.listen_port,
                                "Connection accepted"
                            );
                            if self.events_tx.send(Event::Intent(intent)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                listen_port = self.mapping.listen_port,
                                error = %e,
                                "Failed to accept connection"
                            );
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(ACCEPT_BACKOFF_CAP);
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!(listen_port = self.mapping.listen_port, "Listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}
