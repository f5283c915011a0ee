//! Bounded FIFO of connections held while the backend is not ready.

use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

/// A client connection waiting for the backend. The socket is owned by the
/// intent until it is handed to a forwarder or rejected; ownership is
/// linear, never shared.
#[derive(Debug)]
pub struct PendingIntent {
    pub id: Uuid,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub listen_port: u16,
    pub backend_port: u16,
    pub enqueued_at: Instant,
    pub deadline_at: Instant,
    /// Set once the intent has been re-enqueued after a failed dial; a
    /// second failure surfaces to the client.
    pub redialed: bool,
}

impl PendingIntent {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        listen_port: u16,
        backend_port: u16,
        deadline_at: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            peer,
            listen_port,
            backend_port,
            enqueued_at: Instant::now(),
            deadline_at,
            redialed: false,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline_at <= now
    }
}

/// Strict-FIFO admission queue with a hard capacity. Owned by the state
/// machine task, so capacity check and insert are naturally one atomic
/// step.
pub struct AdmissionQueue {
    items: VecDeque<PendingIntent>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an intent, or hand it back if the queue is at capacity.
    pub fn offer(&mut self, intent: PendingIntent) -> Result<(), PendingIntent> {
        if self.items.len() >= self.capacity {
            return Err(intent);
        }
        self.items.push_back(intent);
        Ok(())
    }

    /// Pop the oldest intent.
    pub fn pop(&mut self) -> Option<PendingIntent> {
        self.items.pop_front()
    }

    /// Remove and return every intent whose deadline has passed, preserving
    /// the order of the rest.
    pub fn expire_due(&mut self, now: Instant) -> Vec<PendingIntent> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for intent in self.items.drain(..) {
            if intent.expired(now) {
                expired.push(intent);
            } else {
                kept.push_back(intent);
            }
        }
        self.items = kept;
        expired
    }

    /// Remove every intent, FIFO order. Used for both the READY drain and
    /// the failure paths.
    pub fn take_all(&mut self) -> Vec<PendingIntent> {
        self.items.drain(..).collect()
    }
}
