use std::sync::Arc;

use anyhow::Context;
use api_monitor::{
    api::{ApiState, spawn_api_server},
    config::load_config,
    health::HealthState,
    hub::HubHandle,
    monitoring::{EndpointChecker, HttpAlertNotifier, MonitoringOrchestrator},
    storage::Storage,
};
use clap::Parser;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("api_monitor", LevelFilter::DEBUG),
        ("tower_http", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = load_config(args.file.as_deref())?;

    let storage = Storage::open(&config.storage)
        .await
        .context("failed to open storage")?;

    let shutdown = CancellationToken::new();
    let health = HealthState::new();
    let hub = HubHandle::spawn();

    let checker = Arc::new(
        EndpointChecker::from_config(&config.monitor).context("failed to build HTTP client")?,
    );

    let mut orchestrator = MonitoringOrchestrator::new(
        storage.repository.clone(),
        checker,
        Arc::new(hub.clone()),
        storage.streams.clone(),
    )
    .with_monitor_config(&config.monitor)
    .with_shutdown(shutdown.clone());

    if let Some(base_url) = &config.monitor.alert_evaluator_url {
        let client = Client::builder()
            .timeout(config.monitor.notify_timeout())
            .build()
            .context("failed to build alert client")?;
        info!("forwarding results to alert evaluator at {base_url}");
        orchestrator =
            orchestrator.with_notifier(Arc::new(HttpAlertNotifier::new(client, base_url)));
    }

    let orchestrator = Arc::new(orchestrator);
    let scheduler = orchestrator
        .clone()
        .spawn_scheduler(config.monitor.cycle_interval(), shutdown.clone());

    let state = ApiState::new(health.clone(), hub.clone(), orchestrator, shutdown.clone());
    let (addr, server) = spawn_api_server(config.api.bind, state).await?;
    info!("api monitor running on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    health.set_healthy(false);
    shutdown.cancel();

    if let Err(e) = scheduler.await {
        error!("monitoring scheduler panicked: {e}");
    }
    if let Err(e) = server.await {
        error!("API server panicked: {e}");
    }
    hub.shutdown().await;

    Ok(())
}
