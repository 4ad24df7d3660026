pub mod config;
pub mod load;
pub mod logging;
pub mod shutdown;

pub use config::{Config, ConfigError, LoadConfig, LogFormat, LogLevel};
pub use load::{FeedEvent, LoadGenerator, LoadReport};
pub use logging::{LoggingError, init_logging};

use crate::coordinator::{DeliveryCoordinator, MetricsSummary};
use crate::pool::{ConnectionPool, InMemoryPool};
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_args_and_env(std::env::args_os())?;
    init_logging(config.log_level, config.log_format)?;

    info!(
        version = crate::VERSION,
        batch_size = config.batch.batch_size,
        batch_timeout_ms = config.batch_timeout_ms,
        max_memory_percent = config.monitor.max_memory_percent,
        "Starting push-fanout"
    );

    let pool = Arc::new(InMemoryPool::<FeedEvent>::new().without_recording());
    let coordinator = Arc::new(DeliveryCoordinator::new(
        pool.clone(),
        config.batch.clone(),
        config.monitor.clone(),
        config.coordinator.clone(),
    ));
    coordinator.initialize();

    let mut destinations = Vec::with_capacity(config.load.destinations);
    for index in 0..config.load.destinations {
        let user_id = format!("user-{index}");
        destinations.push(coordinator.connect(Some(&user_id)).await?);
    }
    info!(destinations = destinations.len(), "Destinations connected");

    let token = CancellationToken::new();
    let signals = shutdown::spawn_signal_listener(token.clone());
    let generator = LoadGenerator::new(coordinator.clone(), destinations, config.load.clone());
    let load_task = tokio::spawn(generator.run(token.clone()));

    let mut reporter = interval(config.coordinator.metrics_interval);
    reporter.set_missed_tick_behavior(MissedTickBehavior::Delay);
    reporter.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = reporter.tick() => log_summary(&coordinator.summary()),
        }
    }

    let report = match load_task.await {
        Ok(report) => report,
        Err(e) => {
            error!("Load generator task failed: {e}");
            LoadReport::default()
        }
    };
    let flushed = coordinator.shutdown().await;
    signals.abort();

    coordinator.collect_metrics();
    log_summary(&coordinator.summary());
    info!(
        generated = report.generated,
        rejected = report.rejected,
        flushed_on_shutdown = flushed,
        delivered = pool.delivered_messages(),
        released = pool.stats().total_released,
        "push-fanout stopped"
    );
    Ok(())
}

fn log_summary(summary: &MetricsSummary) {
    match summary.report() {
        Some(report) => info!(
            samples = report.samples,
            avg_buffered_messages = report.avg_buffered_messages,
            peak_buffered_messages = report.peak_buffered_messages,
            avg_memory_percent = report.avg_memory_percent,
            peak_memory_percent = report.peak_memory_percent,
            worst_pressure = %report.worst_pressure,
            messages_sent = report.messages_sent,
            send_failures = report.send_failures,
            avg_batch_size = report.avg_batch_size,
            "Delivery summary"
        ),
        None => info!("Delivery summary: no data collected yet"),
    }
}
