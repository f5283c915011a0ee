use clap::Parser;
use smartproxy::config::Config;
use smartproxy::ipmi::IpmiController;
use smartproxy::supervisor::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Transparent TCP reverse proxy that powers its backend host on and off
/// over IPMI.
#[derive(Parser, Debug)]
#[command(name = "smartproxy", version, about)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smartproxy=info".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    // Configuration and bind failures exit 1; runtime failures exit 2.
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::from(1);
        }
    };
    info!(path = %cli.config.display(), "Configuration loaded");
    print_startup_banner(&config);

    let settings = config.settings();
    let effector = Arc::new(IpmiController::new(&config, settings.ipmi_timeout));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = match Supervisor::bind(
        &config.proxy_host,
        config.port_mappings.clone(),
        config.target_host.clone(),
        settings,
        effector,
        shutdown_rx,
    )
    .await
    {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "Failed to bind listeners");
            return ExitCode::from(1);
        }
    };

    tokio::spawn(signal_task(shutdown_tx));

    match supervisor.run().await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

/// Flip the shutdown signal on SIGINT or SIGTERM.
async fn signal_task(shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
}

fn print_startup_banner(config: &Config) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting smartproxy"
    );
    info!(
        proxy_host = %config.proxy_host,
        mappings = ?config
            .port_mappings
            .iter()
            .map(|m| (m.listen_port, m.backend_port))
            .collect::<Vec<_>>(),
        target_host = %config.target_host,
        "Proxy configuration"
    );
    // The IPMI user and password stay out of the logs.
    info!(
        ipmi_host = %config.ipmi_host,
        ipmi_path = %config.ipmi_path,
        "Power management configuration"
    );
    info!(
        inactivity_timeout_secs = config.inactivity_timeout,
        startup_timeout_secs = config.startup_timeout,
        check_interval_secs = config.check_interval,
        max_queue_size = config.max_queue_size,
        request_timeout_secs = config.request_timeout,
        "Timing configuration"
    );
}
