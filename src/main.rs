//! Headless runner for the print worker. The desktop shell normally hosts
//! the worker; this binary wires it to a terminal instead, for kiosk-style
//! installs and debugging.

use std::path::PathBuf;
use sushiamo_print_bridge::{BackendSettings, PrintWorker, StateStore};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn user_data_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("sushiamo-print-bridge"))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = user_data_dir();
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "print-bridge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sushiamo_print_bridge=debug,info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    info!("========================================");
    info!("Sushiamo Print Bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("State file: {:?}", data_dir.join(sushiamo_print_bridge::config::STATE_FILE_NAME));
    info!("Log dir: {:?}", log_dir);
    info!("========================================");

    let store = StateStore::new(&data_dir);
    let worker = PrintWorker::new(store, BackendSettings::from_env());

    // Mirror state snapshots at debug level; log rows already reach tracing
    // through the worker itself.
    let mut state_rx = worker.subscribe_state();
    tokio::spawn(async move {
        while let Ok(snapshot) = state_rx.recv().await {
            debug!(
                "state: running={} processing={} claimed={} printed={} failed={}",
                snapshot.service.running,
                snapshot.service.processing,
                snapshot.stats.claimed,
                snapshot.stats.printed,
                snapshot.stats.failed,
            );
        }
    });

    if worker.auto_start_requested().await {
        match worker.start_service().await {
            Ok(_) => info!("Service auto-started"),
            Err(e) => warn!("Auto-start failed: {}", e),
        }
    } else {
        info!("Auto-start disabled; waiting for the shell (or ctrl-c to exit)");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping service");
    if let Err(e) = worker.stop_service().await {
        warn!("Stop failed during shutdown: {}", e);
    }
    info!("Bye");
    Ok(())
}
