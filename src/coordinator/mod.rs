//! Composition root for the fan-out core.
//!
//! `DeliveryCoordinator` owns one `MessageBatcher` and one
//! `MemoryPressureMonitor`, fronts an external `ConnectionPool`, wires
//! flush-on-pressure callbacks between them and keeps a bounded metrics
//! history.

pub mod metrics;

pub use metrics::{AggregatedMetrics, DEFAULT_SUMMARY_WINDOW, MetricsHistory, MetricsSummary, SummaryReport};

use crate::batcher::{BatchConfig, EnqueueOutcome, MessageBatcher};
use crate::domain::{DeliveryClass, DeliveryError, DestinationId, OutboundMessage, Payload};
use crate::memory::{CallbackError, MemoryPressureMonitor, MemoryProbe, MonitorConfig, PressureLevel};
use crate::pool::{ConnectionPool, DeliverySink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(rename = "metrics_interval_ms", with = "crate::app::config::serde_helpers")]
    pub metrics_interval: Duration,
    /// Capacity of the metrics history ring.
    pub metrics_history: usize,
    /// Entries averaged by `summary()` when no window is given.
    pub summary_window: usize,
    /// Return an error for unknown destinations instead of dropping the message.
    pub reject_unknown_destinations: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(60),
            metrics_history: 1440,
            summary_window: DEFAULT_SUMMARY_WINDOW,
            reject_unknown_destinations: false,
        }
    }
}

struct MetricsLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DeliveryCoordinator<P, C>
where
    P: Payload,
    C: ConnectionPool<P> + 'static,
{
    config: CoordinatorConfig,
    pool: Arc<C>,
    batcher: MessageBatcher<P>,
    monitor: MemoryPressureMonitor,
    history: Mutex<MetricsHistory>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    metrics_loop: Mutex<Option<MetricsLoop>>,
}

impl<P, C> DeliveryCoordinator<P, C>
where
    P: Payload,
    C: ConnectionPool<P> + 'static,
{
    pub fn new(
        pool: Arc<C>,
        batch: BatchConfig,
        monitor: MonitorConfig,
        config: CoordinatorConfig,
    ) -> Self {
        Self::with_monitor(pool, batch, MemoryPressureMonitor::new(monitor), config)
    }

    /// Builds a coordinator whose monitor reads memory through `probe`.
    pub fn with_probe(
        pool: Arc<C>,
        batch: BatchConfig,
        monitor: MonitorConfig,
        config: CoordinatorConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self::with_monitor(
            pool,
            batch,
            MemoryPressureMonitor::with_probe(monitor, probe),
            config,
        )
    }

    fn with_monitor(
        pool: Arc<C>,
        batch: BatchConfig,
        monitor: MemoryPressureMonitor,
        config: CoordinatorConfig,
    ) -> Self {
        let sink: Arc<dyn DeliverySink<P>> = pool.clone();
        let history = MetricsHistory::new(config.metrics_history);
        Self {
            config,
            pool,
            batcher: MessageBatcher::new(batch, sink),
            monitor,
            history: Mutex::new(history),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            metrics_loop: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn batcher(&self) -> &MessageBatcher<P> {
        &self.batcher
    }

    pub fn monitor(&self) -> &MemoryPressureMonitor {
        &self.monitor
    }

    pub fn pool(&self) -> &Arc<C> {
        &self.pool
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Wires pressure callbacks, starts the monitor loops and the metrics loop.
    ///
    /// Calling it again is a no-op.
    pub fn initialize(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            debug!("Delivery coordinator already initialized");
            return;
        }

        let batcher = self.batcher.clone();
        self.monitor
            .register_pressure_callback(PressureLevel::High, move |sample| {
                let batcher = batcher.clone();
                async move {
                    let flushed = batcher.flush_all().await;
                    warn!(
                        percent = sample.percent_of_limit,
                        flushed, "High memory pressure, flushed all buffers"
                    );
                    Ok::<(), CallbackError>(())
                }
            });

        let batcher = self.batcher.clone();
        let pool = self.pool.clone();
        self.monitor
            .register_pressure_callback(PressureLevel::Critical, move |sample| {
                let batcher = batcher.clone();
                let pool = pool.clone();
                async move {
                    let flushed = batcher.flush_all().await;
                    let removed = pool.cleanup().await;
                    let dropped = batcher.retain(|destination_id| pool.contains(destination_id));
                    let compacted = batcher.compact();
                    warn!(
                        percent = sample.percent_of_limit,
                        flushed,
                        removed,
                        dropped,
                        compacted,
                        "Critical memory pressure, aggressive cleanup performed"
                    );
                    Ok::<(), CallbackError>(())
                }
            });

        let batcher = self.batcher.clone();
        self.monitor.register_reclaimer(move || batcher.compact());

        self.monitor.start();
        self.start_metrics_loop();

        info!(
            batch_size = self.batcher.config().batch_size,
            max_batch_bytes = self.batcher.config().max_batch_bytes,
            max_memory_percent = self.monitor.config().max_memory_percent,
            "Delivery coordinator initialized"
        );
    }

    fn start_metrics_loop(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let period = self.config.metrics_interval;
        let coordinator = Arc::downgrade(self);
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    () = sleep(period) => {
                        let Some(strong) = coordinator.upgrade() else {
                            break;
                        };
                        strong.collect_metrics();
                    }
                }
            }
            debug!("Metrics loop stopped");
        });

        *self.metrics_loop.lock() = Some(MetricsLoop { token, handle });
    }

    /// Hands one message to the batcher after checking the pool knows its destination.
    pub async fn enqueue(
        &self,
        destination_id: &str,
        event: &str,
        payload: P,
        delivery_class: DeliveryClass,
        send_immediately: bool,
    ) -> Result<EnqueueOutcome, DeliveryError> {
        if self.is_shut_down() {
            return Err(DeliveryError::ShutDown);
        }

        if !self.pool.contains(destination_id) {
            if self.config.reject_unknown_destinations {
                return Err(DeliveryError::UnknownDestination(destination_id.to_string()));
            }
            warn!(destination_id, event, "Dropping message for unknown destination");
            return Ok(EnqueueOutcome::Dropped);
        }

        let message =
            OutboundMessage::new(destination_id, event, payload).with_class(delivery_class);
        Ok(self.batcher.enqueue(message, send_immediately).await)
    }

    /// Acquires a new destination from the pool.
    pub async fn connect(&self, user_id: Option<&str>) -> Result<DestinationId, DeliveryError> {
        if self.is_shut_down() {
            return Err(DeliveryError::ShutDown);
        }
        let destination_id = self.pool.acquire(user_id).await?;
        debug!(destination_id = %destination_id, "Destination connected");
        Ok(destination_id)
    }

    /// Flushes what is buffered for the destination, then releases it to the pool.
    pub async fn disconnect(&self, destination_id: &str, had_error: bool) -> usize {
        let flushed = self.batcher.forget(destination_id).await;
        self.pool.release(destination_id, had_error).await;
        debug!(destination_id, had_error, flushed, "Destination disconnected");
        flushed
    }

    pub async fn flush_all(&self) -> usize {
        self.batcher.flush_all().await
    }

    /// Stops background work, flushes every buffer and drains the pool.
    ///
    /// Only the first call does anything; later calls return 0.
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Delivery coordinator already shut down");
            return 0;
        }
        info!("Shutting down delivery coordinator");

        let metrics_loop = self.metrics_loop.lock().take();
        if let Some(metrics_loop) = metrics_loop {
            metrics_loop.token.cancel();
            if let Err(e) = metrics_loop.handle.await {
                error!("Metrics loop terminated abnormally: {e}");
            }
        }

        self.monitor.stop().await;
        let flushed = self.batcher.flush_all().await;
        let cancelled = self.batcher.cancel_timers();
        self.pool.drain().await;

        info!(flushed, cancelled_timers = cancelled, "Delivery coordinator shut down");
        flushed
    }

    /// Appends one snapshot of batcher, monitor and pool figures to the history.
    pub fn collect_metrics(&self) -> AggregatedMetrics {
        let metrics = AggregatedMetrics::new(
            self.batcher.current_buffers(),
            self.batcher.statistics(),
            &self.monitor.stats(),
            self.pool.stats(),
        );
        self.history.lock().push(metrics.clone());
        debug!(
            buffered_messages = metrics.buffers.buffered_messages,
            pressure = %metrics.memory.pressure_level,
            "Collected delivery metrics"
        );
        metrics
    }

    /// Summary over the configured window.
    pub fn summary(&self) -> MetricsSummary {
        self.summary_over(self.config.summary_window)
    }

    pub fn summary_over(&self, window: usize) -> MetricsSummary {
        self.history.lock().summary(window)
    }

    pub fn history(&self, count: usize) -> Vec<AggregatedMetrics> {
        self.history.lock().recent(count)
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

impl<P, C> Drop for DeliveryCoordinator<P, C>
where
    P: Payload,
    C: ConnectionPool<P> + 'static,
{
    fn drop(&mut self) {
        if let Some(metrics_loop) = self.metrics_loop.get_mut().take() {
            metrics_loop.token.cancel();
        }
        // The monitor loops hold the callbacks, which keep the batcher and pool alive.
        self.monitor.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::InMemoryPool;
    use serde_json::{Value, json};

    fn coordinator(
        config: CoordinatorConfig,
    ) -> (Arc<InMemoryPool<Value>>, DeliveryCoordinator<Value, InMemoryPool<Value>>) {
        let pool = Arc::new(InMemoryPool::new());
        let coordinator = DeliveryCoordinator::new(
            pool.clone(),
            BatchConfig {
                batch_size: 3,
                max_batch_bytes: 64 * 1024,
                batch_timeout: Duration::from_secs(60),
            },
            MonitorConfig::default(),
            config,
        );
        (pool, coordinator)
    }

    #[tokio::test]
    async fn test_unknown_destination_is_dropped_by_default() {
        let (pool, coordinator) = coordinator(CoordinatorConfig::default());
        let outcome = coordinator
            .enqueue("missing", "update", json!({}), DeliveryClass::Batched, false)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Dropped);
        assert_eq!(pool.delivery_count(), 0);
        assert_eq!(coordinator.batcher().current_buffers().buffer_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_destination_rejected_in_strict_mode() {
        let (_pool, coordinator) = coordinator(CoordinatorConfig {
            reject_unknown_destinations: true,
            ..CoordinatorConfig::default()
        });
        let result = coordinator
            .enqueue("missing", "update", json!({}), DeliveryClass::Batched, false)
            .await;
        assert_eq!(
            result,
            Err(DeliveryError::UnknownDestination("missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_flushes_then_releases() {
        let (pool, coordinator) = coordinator(CoordinatorConfig::default());
        let sid = coordinator.connect(Some("user-1")).await.unwrap();

        for i in 0..2 {
            coordinator
                .enqueue(&sid, "update", json!({ "i": i }), DeliveryClass::Batched, false)
                .await
                .unwrap();
        }

        assert_eq!(coordinator.disconnect(&sid, false).await, 2);
        assert_eq!(pool.delivery_count(), 1);
        assert!(!pool.contains(&sid));
        assert_eq!(coordinator.batcher().buffered_messages(&sid), 0);
    }

    #[tokio::test]
    async fn test_collect_metrics_appends_history() {
        let (_pool, coordinator) = coordinator(CoordinatorConfig {
            metrics_history: 2,
            ..CoordinatorConfig::default()
        });
        assert!(coordinator.summary().is_no_data());

        for _ in 0..3 {
            coordinator.collect_metrics();
        }
        assert_eq!(coordinator.history_len(), 2);
        assert_eq!(coordinator.summary().report().unwrap().samples, 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let (pool, coordinator) = coordinator(CoordinatorConfig::default());
        pool.register("sid-1");
        coordinator.shutdown().await;

        let result = coordinator
            .enqueue("sid-1", "update", json!({}), DeliveryClass::Batched, false)
            .await;
        assert_eq!(result, Err(DeliveryError::ShutDown));
    }
}
