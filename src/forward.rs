//! Bidirectional byte forwarding between a client and the backend.

use crate::error::{reject, RejectReason};
use crate::idle::IdleAccountant;
use crate::lifecycle::Event;
use crate::queue::PendingIntent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// RAII handle on the live-forwarder count, used by the supervisor to
/// bound the shutdown drain.
pub struct FlightGuard {
    counter: Arc<AtomicUsize>,
}

impl FlightGuard {
    pub fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dial the backend and pump bytes both ways until either side closes.
///
/// A failed dial is handed back to the state machine as `DialFailed`; the
/// machine decides between a retry (transient startup glitch) and a 502.
pub async fn run(
    intent: PendingIntent,
    target_host: String,
    dial_cap: Duration,
    idle: Arc<IdleAccountant>,
    events_tx: mpsc::Sender<Event>,
    _guard: FlightGuard,
) {
    let now = Instant::now();
    if intent.expired(now) {
        let PendingIntent { id, stream, .. } = intent;
        reject(stream, id, RejectReason::DeadlineExpired);
        return;
    }

    let remaining = intent.deadline_at.saturating_duration_since(now);
    let dial_timeout = remaining.min(dial_cap);
    let addr = format!("{}:{}", target_host, intent.backend_port);

    let backend = match tokio::time::timeout(dial_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(backend)) => backend,
        Ok(Err(e)) => {
            debug!(intent = %intent.id, %addr, error = %e, "Backend dial failed");
            hand_back(intent, &events_tx).await;
            return;
        }
        Err(_) => {
            debug!(intent = %intent.id, %addr, "Backend dial timed out");
            hand_back(intent, &events_tx).await;
            return;
        }
    };

    let id = intent.id;
    let listen_port = intent.listen_port;
    let backend_port = intent.backend_port;
    debug!(intent = %id, listen_port, backend_port, "Forwarding started");

    let (client_read, client_write) = intent.stream.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let (client_to_backend, backend_to_client) = tokio::join!(
        pump(client_read, backend_write, &idle),
        pump(backend_read, client_write, &idle),
    );

    // Connection teardown counts as activity.
    idle.touch();

    debug!(
        intent = %id,
        listen_port,
        client_to_backend,
        backend_to_client,
        "Connection closed"
    );
}

/// Return a dial-failed intent to the state machine, or surface a 502
/// directly if the machine is already gone (shutdown).
async fn hand_back(intent: PendingIntent, events_tx: &mpsc::Sender<Event>) {
    if let Err(send_error) = events_tx.send(Event::DialFailed(intent)).await {
        if let Event::DialFailed(intent) = send_error.0 {
            let PendingIntent { id, stream, .. } = intent;
            reject(stream, id, RejectReason::DialFailed);
        }
    }
}

/// One direction of the byte pump. EOF or an error half-closes the peer's
/// write side; the first forwarded byte stamps the idle accountant.
async fn pump(mut read: OwnedReadHalf, mut write: OwnedWriteHalf, idle: &IdleAccountant) -> u64 {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;

    loop {
        match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if total == 0 {
                    idle.touch();
                }
                if write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
            Err(_) => break,
        }
    }

    let _ = write.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (client, server_side, peer)
    }

    fn intent_from(stream: TcpStream, peer: SocketAddr, backend_port: u16) -> PendingIntent {
        PendingIntent::new(
            stream,
            peer,
            8080,
            backend_port,
            Instant::now() + Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_forwards_bytes_both_ways() {
        // Echo backend
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (mut client, proxy_side, peer) = socket_pair().await;
        let intent = intent_from(proxy_side, peer, backend_port);

        let idle = Arc::new(IdleAccountant::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (events_tx, _events_rx) = mpsc::channel(4);

        let guard = FlightGuard::new(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let forwarder = tokio::spawn(run(
            intent,
            "127.0.0.1".to_string(),
            Duration::from_secs(5),
            Arc::clone(&idle),
            events_tx,
            guard,
        ));

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        // Half-close from the client tears the whole forwarder down.
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), forwarder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_dial_hands_intent_back() {
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (_client, proxy_side, peer) = socket_pair().await;
        let intent = intent_from(proxy_side, peer, closed_port);
        let id = intent.id;

        let idle = Arc::new(IdleAccountant::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (events_tx, mut events_rx) = mpsc::channel(4);

        run(
            intent,
            "127.0.0.1".to_string(),
            Duration::from_secs(1),
            idle,
            events_tx,
            FlightGuard::new(&counter),
        )
        .await;

        match events_rx.recv().await {
            Some(Event::DialFailed(intent)) => assert_eq!(intent.id, id),
            other => panic!("expected DialFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_intent_gets_gateway_timeout() {
        let (mut client, proxy_side, peer) = socket_pair().await;
        let intent = PendingIntent::new(proxy_side, peer, 8080, 80, Instant::now());

        let idle = Arc::new(IdleAccountant::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (events_tx, _events_rx) = mpsc::channel(4);

        run(
            intent,
            "127.0.0.1".to_string(),
            Duration::from_secs(1),
            idle,
            events_tx,
            FlightGuard::new(&counter),
        )
        .await;

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
    }

    #[tokio::test]
    async fn test_first_byte_touches_accountant() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await;
        });

        let (mut client, proxy_side, peer) = socket_pair().await;
        let intent = intent_from(proxy_side, peer, backend_port);

        let idle = Arc::new(IdleAccountant::new());
        let before = idle.last_activity();
        let counter = Arc::new(AtomicUsize::new(0));
        let (events_tx, _events_rx) = mpsc::channel(4);

        let forwarder = tokio::spawn(run(
            intent,
            "127.0.0.1".to_string(),
            Duration::from_secs(5),
            Arc::clone(&idle),
            events_tx,
            FlightGuard::new(&counter),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        client.write_all(b"x").await.unwrap();
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), forwarder)
            .await
            .unwrap()
            .unwrap();

        assert!(idle.last_activity() > before);
    }
}
