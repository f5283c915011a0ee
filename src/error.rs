//! Client-visible failure handling.
//!
//! The proxy is byte-transparent, so the only HTTP it ever produces are the
//! minimal canned responses written to a client whose connection cannot be
//! forwarded.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// How long a reject write may take before the socket is dropped anyway.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason a held or newly arrived connection is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The admission queue is at capacity
    QueueFull,
    /// The connection's deadline passed before the backend became ready
    DeadlineExpired,
    /// The backend did not come up within the startup timeout
    StartTimeout,
    /// The proxy is shutting down
    ShuttingDown,
    /// The backend refused the forwarding dial
    DialFailed,
}

impl RejectReason {
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            RejectReason::QueueFull => (503, "Service Unavailable"),
            RejectReason::DeadlineExpired => (504, "Gateway Timeout"),
            RejectReason::StartTimeout => (504, "Gateway Timeout"),
            RejectReason::ShuttingDown => (503, "Service Unavailable"),
            RejectReason::DialFailed => (502, "Bad Gateway"),
        }
    }

    /// The full response written before closing the socket.
    pub fn response(&self) -> String {
        let (code, text) = self.status();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            code, text
        )
    }

    /// Queue overflow closes with an RST after the response so the client
    /// sees the rejection immediately instead of a lingering FIN.
    fn rst_on_close(&self) -> bool {
        matches!(self, RejectReason::QueueFull)
    }
}

/// Write the reject response and close the socket on a detached task so the
/// caller (the state machine) never blocks on a slow client.
pub fn reject(mut stream: TcpStream, id: Uuid, reason: RejectReason) {
    tokio::spawn(async move {
        if reason.rst_on_close() {
            let _ = stream.set_linger(Some(Duration::ZERO));
        }
        let response = reason.response();
        let result =
            tokio::time::timeout(REJECT_WRITE_TIMEOUT, stream.write_all(response.as_bytes()))
                .await;
        match result {
            Ok(Ok(())) => {
                let _ = stream.shutdown().await;
                if reason.rst_on_close() {
                    // The RST on close would discard anything the client
                    // has not consumed yet; wait for its close first.
                    let mut sink = [0u8; 1024];
                    let drained = async {
                        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                    };
                    let _ = tokio::time::timeout(REJECT_WRITE_TIMEOUT, drained).await;
                }
            }
            Ok(Err(e)) => debug!(intent = %id, error = %e, "Failed to write reject response"),
            Err(_) => debug!(intent = %id, "Timed out writing reject response"),
        }
    });
}
