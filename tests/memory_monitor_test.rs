use parking_lot::Mutex;
use push_fanout::memory::{
    CallbackError, MemoryPressureMonitor, MemoryProbe, MemoryReading, MonitorConfig,
    PressureLevel, SampleError,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Replays percentages in order, then keeps returning the last one.
struct ScriptedProbe {
    script: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
}

impl ScriptedProbe {
    fn new(script: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(0.0),
        })
    }

    fn set(&self, percent: f64) {
        self.script.lock().clear();
        *self.last.lock() = percent;
    }
}

impl MemoryProbe for ScriptedProbe {
    fn read(&self) -> Result<MemoryReading, SampleError> {
        let percent = match self.script.lock().pop_front() {
            Some(next) => {
                *self.last.lock() = next;
                next
            }
            None => *self.last.lock(),
        };
        Ok(MemoryReading {
            resident_bytes: (percent * 10_000_000.0) as u64,
            virtual_bytes: (percent * 20_000_000.0) as u64,
            percent_of_limit: percent,
        })
    }
}

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        max_memory_percent: 80.0,
        memory_limit_bytes: None,
        monitor_interval: Duration::from_millis(10),
        cleanup_interval: Duration::from_millis(10),
        gc_interval: Duration::from_millis(10),
        snapshot_history: 100,
    }
}

#[test]
fn test_pressure_levels_at_breakpoints() {
    let probe = ScriptedProbe::new(&[50.0, 60.0, 72.0, 80.0, 95.0, 10.0]);
    let monitor = MemoryPressureMonitor::with_probe(fast_config(), probe);

    let levels: Vec<PressureLevel> = (0..6).map(|_| monitor.record_sample().pressure_level).collect();
    assert_eq!(
        levels,
        vec![
            PressureLevel::Normal,
            PressureLevel::Moderate,
            PressureLevel::High,
            PressureLevel::Critical,
            PressureLevel::Critical,
            PressureLevel::Normal,
        ]
    );
    assert_eq!(monitor.current_level(), PressureLevel::Normal);
}

#[test]
fn test_stats_report_average_and_peak() {
    let probe = ScriptedProbe::new(&[10.0, 30.0, 50.0]);
    let monitor = MemoryPressureMonitor::with_probe(fast_config(), probe);
    for _ in 0..3 {
        monitor.record_sample();
    }

    let stats = monitor.stats();
    assert!((stats.statistics.avg_memory_percent - 30.0).abs() < 1e-9);
    assert!((stats.statistics.max_memory_percent - 50.0).abs() < 1e-9);
    assert_eq!(stats.snapshots.total, 3);
    assert_eq!(stats.snapshots.max_stored, 100);
    assert_eq!(stats.snapshots.recent.len(), 3);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let probe = ScriptedProbe::new(&[]);
    probe.set(20.0);
    let monitor = MemoryPressureMonitor::with_probe(fast_config(), probe);
    let reclaimed = Arc::new(AtomicUsize::new(0));
    let counter = reclaimed.clone();
    monitor.register_reclaimer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        0
    });

    monitor.start();
    monitor.start();
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_millis(80)).await;
    monitor.stop().await;
    monitor.stop().await;
    assert!(!monitor.is_running());

    let sampled = monitor.history().len();
    assert!(sampled >= 2);
    assert!(monitor.gc_count() >= 2);
    assert_eq!(monitor.gc_count() as usize, reclaimed.load(Ordering::SeqCst));

    // Nothing runs after stop.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(monitor.history().len(), sampled);

    // A stopped monitor can be restarted.
    monitor.start();
    assert!(monitor.is_running());
    monitor.stop().await;
}

#[tokio::test]
async fn test_cleanup_loop_fires_once_per_transition() {
    let probe = ScriptedProbe::new(&[]);
    probe.set(20.0);
    let monitor = MemoryPressureMonitor::with_probe(fast_config(), probe.clone());

    let high_calls = Arc::new(AtomicUsize::new(0));
    let counter = high_calls.clone();
    monitor.register_pressure_callback(PressureLevel::High, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), CallbackError>(())
        }
    });

    monitor.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(high_calls.load(Ordering::SeqCst), 0);

    probe.set(75.0);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(high_calls.load(Ordering::SeqCst), 1);

    // Back to normal, then high again: a new transition.
    probe.set(20.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    probe.set(75.0);
    tokio::time::sleep(Duration::from_millis(80)).await;
    monitor.stop().await;

    assert_eq!(high_calls.load(Ordering::SeqCst), 2);
    // Every elevated tick is a cleanup, even when callbacks are suppressed.
    assert!(monitor.cleanup_count() > 2);
}

#[tokio::test]
async fn test_cleanup_count_tracks_elevated_ticks() {
    let probe = ScriptedProbe::new(&[]);
    probe.set(75.0);
    let monitor = MemoryPressureMonitor::with_probe(fast_config(), probe.clone());

    let mut dispatched = Vec::new();
    for _ in 0..3 {
        dispatched.push(monitor.run_cleanup_cycle().await);
    }
    assert_eq!(dispatched, vec![true, false, false]);
    assert_eq!(monitor.cleanup_count(), 3);

    probe.set(20.0);
    assert!(!monitor.run_cleanup_cycle().await);
    assert_eq!(monitor.cleanup_count(), 3);
    assert_eq!(monitor.stats().statistics.cleanup_count, 3);
}

#[tokio::test]
async fn test_failing_callback_does_not_block_others() {
    let probe = ScriptedProbe::new(&[]);
    probe.set(90.0);
    let monitor = MemoryPressureMonitor::with_probe(fast_config(), probe);

    let ran = Arc::new(AtomicUsize::new(0));
    monitor.register_sync_callback(PressureLevel::Critical, |_| {
        Err(CallbackError::new("cache eviction failed"))
    });
    let counter = ran.clone();
    monitor.register_sync_callback(PressureLevel::Critical, move |sample| {
        assert_eq!(sample.pressure_level, PressureLevel::Critical);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert!(monitor.run_cleanup_cycle().await);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.callback_count(PressureLevel::Critical), 2);
    assert_eq!(monitor.callback_count(PressureLevel::High), 0);
}
