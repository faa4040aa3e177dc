use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use api_monitor::{
    config::load_config,
    metrics::{
        MetricsAggregator, MetricsPublisher,
        collectors::{MonitoringCollector, SystemCollector},
    },
    storage::Storage,
};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,

    /// Collect a single round and exit
    #[arg(long)]
    once: bool,

    /// Seconds between two rounds, overrides the config file
    #[arg(long)]
    interval: Option<u64>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("api_monitor", LevelFilter::DEBUG),
        ("collect_metrics", LevelFilter::TRACE),
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

/// One round: collect, store, publish
#[instrument(skip_all)]
async fn collect_round(
    aggregator: &MetricsAggregator,
    storage: &Storage,
    publisher: &MetricsPublisher,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let outcome = aggregator.collect_all(cancel).await;
    if let Some(e) = &outcome.error {
        warn!("collection finished with errors: {e}");
    }

    let metrics = outcome.flatten();
    if metrics.is_empty() {
        info!("no metrics collected");
        return Ok(());
    }

    storage
        .metrics
        .store(&metrics)
        .await
        .context("failed to store metrics")?;
    publisher.publish(cancel, &metrics).await?;

    info!(
        "collected {} metrics from {} collectors",
        metrics.len(),
        outcome.metrics.len()
    );
    Ok(())
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

    let aggregator = MetricsAggregator::new(config.metrics.max_workers);
    if config.metrics.system_collector {
        aggregator.add_collector(Arc::new(SystemCollector::new())).await?;
    }
    if config.metrics.monitoring_collector {
        aggregator
            .add_collector(Arc::new(MonitoringCollector::new(storage.repository.clone())))
            .await?;
    }
    info!("registered collectors: {:?}", aggregator.list_collectors().await);

    let publisher = MetricsPublisher::new(storage.streams.clone());
    let cancel = CancellationToken::new();

    if args.once {
        return collect_round(&aggregator, &storage, &publisher, &cancel).await;
    }

    let interval = Duration::from_secs(args.interval.unwrap_or(config.metrics.interval_secs).max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                cancel.cancel();
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = collect_round(&aggregator, &storage, &publisher, &cancel).await {
                    error!("metrics round failed: {e:#}");
                }
            }
        }
    }

    Ok(())
}
