mod config;
mod watch;

use cadence_agent::HttpAgentGateway;
use cadence_scheduler::{ScheduleStore, SchedulerService, SystemClock};
use crate::config::DaemonConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cadence_scheduler=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_sources().expect("failed to load configuration");
    tracing::info!(
        schedules_path = %config.schedules_path.display(),
        agent = %config.agent.base_url,
        "Loaded configuration"
    );

    let gateway = HttpAgentGateway::new(&config.agent).expect("failed to create agent client");
    let store = ScheduleStore::new(config.schedules_path.clone());
    let handle = SchedulerService::new(
        store.clone(),
        Arc::new(gateway),
        Arc::new(SystemClock),
        config.scheduler,
    )
    .start()
    .await;
    tracing::info!(active = handle.active_count().await, "Scheduler running");

    let watcher = tokio::spawn(watch::watch_schedules(
        store,
        handle.clone(),
        Duration::from_secs(config.watch.poll_interval_seconds.max(1)),
    ));

    shutdown_signal().await;

    watcher.abort();
    if let Err(e) = handle.shutdown().await {
        tracing::warn!(error = %e, "Scheduler already stopped");
    }
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
