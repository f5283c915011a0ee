//! TCP reachability probe against the backend.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Whether the backend answered a TCP connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// Open a TCP connection to `host:port` with the given timeout. The
/// connection is dropped immediately; no bytes are sent.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Reachability {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => Reachability::Reachable,
        Ok(Err(e)) => {
            trace!(%addr, error = %e, "Probe connect failed");
            Reachability::Unreachable
        }
        Err(_) => {
            trace!(%addr, "Probe timed out");
            Reachability::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert_eq!(result, Reachability::Reachable);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        // Bind and drop to get a port that is almost certainly closed.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = probe("127.0.0.1", port, Duration::from_millis(500)).await;
        assert_eq!(result, Reachability::Unreachable);
    }

    #[tokio::test]
    async fn test_probe_bad_host_is_unreachable() {
        let result = probe("name.invalid", 80, Duration::from_millis(500)).await;
        assert_eq!(result, Reachability::Unreachable);
    }
}
