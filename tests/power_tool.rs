//! End-to-end test of the subprocess power effector.
//!
//! Runs the proxy against `tests/mock_ipmitool.sh`, which keeps per-host
//! power state in a state file, the same way the proxy drives the real
//! tool in production. The fake backend follows that state file.

use smartproxy::config::{Config, PortMapping, Settings};
use smartproxy::ipmi::IpmiController;
use smartproxy::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const IPMI_HOST: &str = "e2e-cold.lan";
const BACKEND_PORT: u16 = 42820;

fn mock_tool_path() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/mock_ipmitool.sh");
    path
}

fn state_file(host: &str) -> PathBuf {
    let dir = std::env::var_os("MOCK_IPMI_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("smartproxy-mock-ipmi"));
    dir.join(format!("{}.state", host.replace(['.', '/'], "_")))
}

fn power_is_on(host: &str) -> bool {
    std::fs::read_to_string(state_file(host))
        .map(|s| s.trim() == "on")
        .unwrap_or(false)
}

fn test_config() -> Config {
    serde_json::from_str(&format!(
        r#"{{
            "proxy_host": "127.0.0.1",
            "port_mappings": [[8080, {}]],
            "target_host": "127.0.0.1",
            "ipmi_host": "{}",
            "ipmi_user": "admin",
            "ipmi_password": "hunter2",
            "ipmi_path": "{}"
        }}"#,
        BACKEND_PORT,
        IPMI_HOST,
        mock_tool_path().display()
    ))
    .unwrap()
}

fn fast_settings() -> Settings {
    Settings {
        inactivity_timeout: Duration::from_secs(60),
        startup_timeout: Duration::from_secs(10),
        check_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        max_queue_size: 100,
        ipmi_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_millis(200),
        dial_timeout: Duration::from_secs(1),
    }
}

/// Backend that follows the mock tool's state file.
fn spawn_state_file_backend(host: &'static str, port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener: Option<TcpListener> = None;
        loop {
            if power_is_on(host) {
                if listener.is_none() {
                    listener = TcpListener::bind(("127.0.0.1", port)).await.ok();
                }
            } else {
                listener = None;
            }

            match &listener {
                Some(l) => {
                    if let Ok(Ok((mut stream, _))) =
                        tokio::time::timeout(Duration::from_millis(20), l.accept()).await
                    {
                        tokio::spawn(async move {
                            let mut buf = [0u8; 1024];
                            let _ = tokio::time::timeout(
                                Duration::from_secs(1),
                                stream.read(&mut buf),
                            )
                            .await;
                            let body = "powered";
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                            let _ = stream.shutdown().await;
                        });
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
}

#[tokio::test]
async fn test_cold_start_through_subprocess_tool() {
    // Start from a powered-off host regardless of earlier runs.
    let _ = std::fs::remove_file(state_file(IPMI_HOST));

    let config = test_config();
    let effector = Arc::new(IpmiController::new(&config, Duration::from_secs(5)));
    let _backend = spawn_state_file_backend(IPMI_HOST, BACKEND_PORT);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::bind(
        &config.proxy_host,
        vec![PortMapping {
            listen_port: 0,
            backend_port: BACKEND_PORT,
        }],
        config.target_host.clone(),
        fast_settings(),
        effector,
        shutdown_rx,
    )
    .await
    .expect("bind proxy");

    let addr = supervisor.listen_addrs()[0];
    let run_task = tokio::spawn(supervisor.run());

    // The request powers the host on through the external tool and is
    // answered once the backend follows the state file up.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(15), stream.read_to_string(&mut response))
        .await
        .expect("cold start should finish within the startup window")
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.ends_with("powered"), "{}", response);
    assert!(power_is_on(IPMI_HOST));

    // Proxy shutdown leaves the backend powered.
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), run_task)
        .await
        .expect("proxy should stop promptly")
        .unwrap()
        .unwrap();
    assert!(power_is_on(IPMI_HOST));
}
