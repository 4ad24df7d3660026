use super::MonitorConfig;
use super::level::PressureLevel;
use super::probe::{MemoryProbe, SystemMemoryProbe};
use super::sample::MemorySample;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of samples reported in `MonitorStats::snapshots.recent`.
const RECENT_SNAPSHOTS: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallbackError {
    #[error("Pressure callback failed: {0}")]
    Failed(String),
}

impl CallbackError {
    pub fn new(reason: impl Into<String>) -> Self {
        CallbackError::Failed(reason.into())
    }
}

type PressureCallback =
    Arc<dyn Fn(MemorySample) -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync>;
type Reclaimer = Arc<dyn Fn() -> usize + Send + Sync>;

#[derive(Default)]
struct LoopHandles {
    token: CancellationToken,
    sampler: Option<JoinHandle<()>>,
    cleanup: Option<JoinHandle<()>>,
    reclaim: Option<JoinHandle<()>>,
}

struct MonitorInner {
    config: MonitorConfig,
    probe: Arc<dyn MemoryProbe>,
    history: Mutex<VecDeque<MemorySample>>,
    current_level: Mutex<PressureLevel>,
    // Level whose callbacks last ran; cleared once pressure drops below high.
    last_dispatched: Mutex<Option<PressureLevel>>,
    callbacks: RwLock<HashMap<PressureLevel, Vec<PressureCallback>>>,
    reclaimers: RwLock<Vec<Reclaimer>>,
    cleanup_count: AtomicU64,
    gc_count: AtomicU64,
    loops: Mutex<LoopHandles>,
}

/// Samples process memory and drives mitigation under pressure.
///
/// Cloning is cheap and yields a handle to the same monitor.
#[derive(Clone)]
pub struct MemoryPressureMonitor {
    inner: Arc<MonitorInner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatistics {
    pub cleanup_count: u64,
    pub gc_count: u64,
    pub avg_memory_percent: f64,
    pub max_memory_percent: f64,
    pub current_level: PressureLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub total: usize,
    pub max_stored: usize,
    pub recent: Vec<MemorySample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    pub current: MemorySample,
    pub statistics: MonitorStatistics,
    pub snapshots: SnapshotStats,
}

impl MemoryPressureMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let probe = Arc::new(SystemMemoryProbe::new(config.memory_limit_bytes));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: MonitorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let capacity = config.snapshot_history.max(1);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                current_level: Mutex::new(PressureLevel::Normal),
                last_dispatched: Mutex::new(None),
                callbacks: RwLock::new(HashMap::new()),
                reclaimers: RwLock::new(Vec::new()),
                cleanup_count: AtomicU64::new(0),
                gc_count: AtomicU64::new(0),
                loops: Mutex::new(LoopHandles::default()),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Reads and classifies process memory without recording it.
    ///
    /// A probe failure is logged and yields a normal, all-zero sample.
    pub fn sample(&self) -> MemorySample {
        match self.inner.probe.read() {
            Ok(reading) => MemorySample::from_reading(reading, self.inner.config.max_memory_percent),
            Err(e) => {
                error!("Failed to sample process memory: {e}");
                MemorySample::unavailable()
            }
        }
    }

    /// One tick of the sampling loop: record a sample and track level transitions.
    pub fn record_sample(&self) -> MemorySample {
        let sample = self.sample();

        {
            let mut history = self.inner.history.lock();
            while history.len() >= self.inner.config.snapshot_history.max(1) {
                history.pop_front();
            }
            history.push_back(sample.clone());
        }

        let previous = std::mem::replace(&mut *self.inner.current_level.lock(), sample.pressure_level);
        if previous != sample.pressure_level {
            if sample.pressure_level > previous && sample.pressure_level.is_elevated() {
                warn!(
                    from = %previous,
                    to = %sample.pressure_level,
                    percent = sample.percent_of_limit,
                    "Memory pressure rose"
                );
            } else {
                info!(
                    from = %previous,
                    to = %sample.pressure_level,
                    percent = sample.percent_of_limit,
                    "Memory pressure changed"
                );
            }
        }

        sample
    }

    /// One tick of the cleanup loop.
    ///
    /// Runs the callbacks registered for the current level when it is high or
    /// critical and differs from the level callbacks last ran for. Every tick
    /// at an elevated level counts as a cleanup. Returns whether callbacks ran.
    pub async fn run_cleanup_cycle(&self) -> bool {
        self.cleanup(false).await
    }

    /// Runs the callbacks for the current elevated level even if they already ran for it.
    pub async fn trigger_cleanup(&self) -> bool {
        self.cleanup(true).await
    }

    /// One tick of the reclamation loop. Returns the total reported by reclaimers.
    pub fn run_reclamation(&self) -> usize {
        let reclaimers = self.inner.reclaimers.read().clone();
        let mut reclaimed = 0;
        for reclaimer in &reclaimers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| reclaimer())) {
                Ok(count) => reclaimed += count,
                Err(_) => error!("Memory reclaimer panicked"),
            }
        }
        self.inner.gc_count.fetch_add(1, Ordering::Relaxed);
        debug!(reclaimed, "Reclamation pass complete");
        reclaimed
    }

    /// Adds an async callback for `level`. Callbacks accumulate and are never deduplicated.
    pub fn register_pressure_callback<F, Fut>(&self, level: PressureLevel, callback: F)
    where
        F: Fn(MemorySample) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        let callback: PressureCallback = Arc::new(move |sample| callback(sample).boxed());
        self.inner
            .callbacks
            .write()
            .entry(level)
            .or_default()
            .push(callback);
        debug!(level = %level, "Registered pressure callback");
    }

    pub fn register_sync_callback<F>(&self, level: PressureLevel, callback: F)
    where
        F: Fn(&MemorySample) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.register_pressure_callback(level, move |sample| std::future::ready(callback(&sample)));
    }

    pub fn register_reclaimer<F>(&self, reclaimer: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.inner.reclaimers.write().push(Arc::new(reclaimer));
    }

    pub fn callback_count(&self, level: PressureLevel) -> usize {
        self.inner.callbacks.read().get(&level).map_or(0, Vec::len)
    }

    /// Spawns whichever of the three loops is not already running.
    pub fn start(&self) {
        let mut loops = self.inner.loops.lock();
        if loops.token.is_cancelled() {
            loops.token = CancellationToken::new();
        }
        let token = loops.token.clone();
        let config = &self.inner.config;
        let mut spawned = 0;

        if !is_live(loops.sampler.as_ref()) {
            loops.sampler = Some(self.spawn_loop(
                "sampler",
                config.monitor_interval,
                token.clone(),
                |monitor| async move {
                    monitor.record_sample();
                },
            ));
            spawned += 1;
        }
        if !is_live(loops.cleanup.as_ref()) {
            loops.cleanup = Some(self.spawn_loop(
                "cleanup",
                config.cleanup_interval,
                token.clone(),
                |monitor| async move {
                    monitor.run_cleanup_cycle().await;
                },
            ));
            spawned += 1;
        }
        if !is_live(loops.reclaim.as_ref()) {
            loops.reclaim = Some(self.spawn_loop(
                "reclaim",
                config.gc_interval,
                token,
                |monitor| async move {
                    monitor.run_reclamation();
                },
            ));
            spawned += 1;
        }

        if spawned > 0 {
            info!(
                ceiling = config.max_memory_percent,
                monitor_interval = ?config.monitor_interval,
                cleanup_interval = ?config.cleanup_interval,
                gc_interval = ?config.gc_interval,
                "Memory pressure monitor started"
            );
        }
    }

    /// Cancels all loops and waits for them to finish. Safe to call when not started.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.inner.loops.lock();
            loops.token.cancel();
            [loops.sampler.take(), loops.cleanup.take(), loops.reclaim.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        if handles.is_empty() {
            return;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Memory monitor loop terminated abnormally: {e}");
                }
            }
        }
        info!("Memory pressure monitor stopped");
    }

    /// Signals every loop to stop without waiting for it.
    ///
    /// Usable from synchronous contexts such as `Drop`; `stop` is the awaited form.
    pub fn cancel(&self) {
        self.inner.loops.lock().token.cancel();
    }

    pub fn is_running(&self) -> bool {
        let loops = self.inner.loops.lock();
        is_live(loops.sampler.as_ref()) || is_live(loops.cleanup.as_ref()) || is_live(loops.reclaim.as_ref())
    }

    /// Level as of the last recorded sample.
    pub fn current_level(&self) -> PressureLevel {
        *self.inner.current_level.lock()
    }

    pub fn history(&self) -> Vec<MemorySample> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn cleanup_count(&self) -> u64 {
        self.inner.cleanup_count.load(Ordering::Relaxed)
    }

    pub fn gc_count(&self) -> u64 {
        self.inner.gc_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> MonitorStats {
        let (latest, total, avg_memory_percent, max_memory_percent, recent) = {
            let history = self.inner.history.lock();
            let total = history.len();
            let sum: f64 = history.iter().map(|s| s.percent_of_limit).sum();
            let max = history
                .iter()
                .map(|s| s.percent_of_limit)
                .fold(0.0_f64, f64::max);
            let avg = if total == 0 { 0.0 } else { sum / total as f64 };
            let recent: Vec<MemorySample> = history
                .iter()
                .skip(total.saturating_sub(RECENT_SNAPSHOTS))
                .cloned()
                .collect();
            (history.back().cloned(), total, avg, max, recent)
        };

        MonitorStats {
            current: latest.unwrap_or_else(|| self.sample()),
            statistics: MonitorStatistics {
                cleanup_count: self.cleanup_count(),
                gc_count: self.gc_count(),
                avg_memory_percent,
                max_memory_percent,
                current_level: self.current_level(),
            },
            snapshots: SnapshotStats {
                total,
                max_stored: self.inner.config.snapshot_history,
                recent,
            },
        }
    }

    async fn cleanup(&self, force: bool) -> bool {
        let sample = self.sample();
        let level = sample.pressure_level;
        let dispatch = self.claim_dispatch(level, force);
        if dispatch {
            self.dispatch(level, sample).await;
        }
        if level.is_elevated() {
            self.inner.cleanup_count.fetch_add(1, Ordering::Relaxed);
        }
        dispatch
    }

    fn claim_dispatch(&self, level: PressureLevel, force: bool) -> bool {
        let mut last = self.inner.last_dispatched.lock();
        if !level.is_elevated() {
            *last = None;
            return false;
        }
        if !force && *last == Some(level) {
            return false;
        }
        *last = Some(level);
        true
    }

    async fn dispatch(&self, level: PressureLevel, sample: MemorySample) {
        let callbacks: Vec<PressureCallback> = self
            .inner
            .callbacks
            .read()
            .get(&level)
            .cloned()
            .unwrap_or_default();

        warn!(
            level = %level,
            percent = sample.percent_of_limit,
            callbacks = callbacks.len(),
            "Running memory pressure callbacks"
        );

        for (index, callback) in callbacks.iter().enumerate() {
            let outcome = AssertUnwindSafe(async { callback(sample.clone()).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(level = %level, index, "{e}"),
                Err(_) => error!(level = %level, index, "Pressure callback panicked"),
            }
        }
    }

    fn spawn_loop<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        token: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(MemoryPressureMonitor) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            debug!(task = name, ?period, "Memory monitor loop started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = sleep(period) => tick(monitor.clone()).await,
                }
            }
            debug!(task = name, "Memory monitor loop stopped");
        })
    }
}

fn is_live(handle: Option<&JoinHandle<()>>) -> bool {
    handle.is_some_and(|handle| !handle.is_finished())
}
