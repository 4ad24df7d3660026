use super::config::LoadConfig;
use crate::batcher::EnqueueOutcome;
use crate::coordinator::DeliveryCoordinator;
use crate::domain::{DeliveryClass, DestinationId};
use crate::pool::ConnectionPool;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const TICKS_PER_SECOND: u64 = 100;

/// Synthetic event pushed by the load generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub sequence: u64,
    pub kind: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub generated: u64,
    pub buffered: u64,
    pub flushed_batches: u64,
    pub immediate: u64,
    pub dropped: u64,
    pub rejected: u64,
}

impl LoadReport {
    fn record(&mut self, outcome: &EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Buffered => self.buffered += 1,
            EnqueueOutcome::Flushed(_) => self.flushed_batches += 1,
            EnqueueOutcome::SentImmediately => self.immediate += 1,
            EnqueueOutcome::Dropped => self.dropped += 1,
        }
    }
}

/// Pushes events at a fixed rate to randomly chosen destinations.
pub struct LoadGenerator<C>
where
    C: ConnectionPool<FeedEvent> + 'static,
{
    coordinator: Arc<DeliveryCoordinator<FeedEvent, C>>,
    destinations: Vec<DestinationId>,
    config: LoadConfig,
    body: String,
}

impl<C> LoadGenerator<C>
where
    C: ConnectionPool<FeedEvent> + 'static,
{
    pub fn new(
        coordinator: Arc<DeliveryCoordinator<FeedEvent, C>>,
        destinations: Vec<DestinationId>,
        config: LoadConfig,
    ) -> Self {
        let body = "x".repeat(config.payload_bytes);
        Self {
            coordinator,
            destinations,
            config,
            body,
        }
    }

    /// Events emitted per tick, rounded up so low rates still produce traffic.
    fn events_per_tick(&self) -> u64 {
        self.config.events_per_second.div_ceil(TICKS_PER_SECOND)
    }

    pub async fn run(self, token: CancellationToken) -> LoadReport {
        let mut report = LoadReport::default();
        if self.destinations.is_empty() || self.config.events_per_second == 0 {
            info!("Load generator has nothing to do");
            return report;
        }

        let mut ticker = interval(Duration::from_millis(1000 / TICKS_PER_SECOND));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let per_tick = self.events_per_tick();

        info!(
            destinations = self.destinations.len(),
            events_per_second = self.config.events_per_second,
            "Load generator started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    for _ in 0..per_tick {
                        self.emit(&mut report).await;
                    }
                }
            }
        }

        info!(
            generated = report.generated,
            buffered = report.buffered,
            immediate = report.immediate,
            dropped = report.dropped,
            "Load generator stopped"
        );
        report
    }

    async fn emit(&self, report: &mut LoadReport) {
        let (index, critical) = {
            let mut rng = rand::rng();
            (
                rng.random_range(0..self.destinations.len()),
                rng.random_bool(self.config.critical_ratio),
            )
        };
        let class = if critical {
            DeliveryClass::Critical
        } else {
            DeliveryClass::Batched
        };
        let event = FeedEvent {
            sequence: report.generated,
            kind: if critical { "alert" } else { "update" }.to_string(),
            body: self.body.clone(),
        };
        report.generated += 1;

        let destination_id = &self.destinations[index];
        let kind = event.kind.clone();
        match self
            .coordinator
            .enqueue(destination_id, &kind, event, class, false)
            .await
        {
            Ok(outcome) => {
                debug!(destination_id = %destination_id, ?outcome, "Enqueued synthetic event");
                report.record(&outcome);
            }
            Err(e) => {
                error!(destination_id = %destination_id, "Synthetic event rejected: {e}");
                report.rejected += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::BatchConfig;
    use crate::coordinator::CoordinatorConfig;
    use crate::memory::MonitorConfig;
    use crate::pool::InMemoryPool;

    #[tokio::test]
    async fn test_generator_delivers_until_cancelled() {
        let pool = Arc::new(InMemoryPool::<FeedEvent>::new());
        let coordinator = Arc::new(DeliveryCoordinator::new(
            pool.clone(),
            BatchConfig {
                batch_size: 5,
                max_batch_bytes: 64 * 1024,
                batch_timeout: Duration::from_millis(10),
            },
            MonitorConfig::default(),
            CoordinatorConfig::default(),
        ));
        let mut destinations = Vec::new();
        for _ in 0..3 {
            destinations.push(coordinator.connect(None).await.unwrap());
        }

        let generator = LoadGenerator::new(
            coordinator.clone(),
            destinations,
            LoadConfig {
                destinations: 3,
                events_per_second: 500,
                critical_ratio: 0.5,
                payload_bytes: 16,
            },
        );
        let token = CancellationToken::new();
        let task = tokio::spawn(generator.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let report = task.await.unwrap();
        coordinator.shutdown().await;

        assert!(report.generated > 0);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.dropped, 0);
        assert_eq!(pool.delivered_messages(), report.generated);
    }
}
