use crate::batcher::{BatchStatistics, CurrentBuffers};
use crate::memory::{MemorySample, MonitorStats, PressureLevel};
use crate::pool::PoolStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of summary entries, one per collection.
pub const DEFAULT_SUMMARY_WINDOW: usize = 60;

/// Point-in-time copy of batcher, monitor and pool figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub timestamp: DateTime<Utc>,
    pub buffers: CurrentBuffers,
    pub batching: BatchStatistics,
    pub memory: MemorySample,
    pub cleanup_count: u64,
    pub gc_count: u64,
    pub pool: PoolStats,
}

impl AggregatedMetrics {
    pub fn new(
        buffers: CurrentBuffers,
        batching: BatchStatistics,
        monitor: &MonitorStats,
        pool: PoolStats,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            buffers,
            batching,
            memory: monitor.current.clone(),
            cleanup_count: monitor.statistics.cleanup_count,
            gc_count: monitor.statistics.gc_count,
            pool,
        }
    }
}

/// Averages and peaks over the most recent entries of the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReport {
    pub window: usize,
    pub samples: usize,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub avg_buffered_messages: f64,
    pub peak_buffered_messages: usize,
    pub avg_buffered_bytes: f64,
    pub peak_buffered_bytes: usize,
    pub avg_memory_percent: f64,
    pub peak_memory_percent: f64,
    pub worst_pressure: PressureLevel,
    pub current_pressure: PressureLevel,
    /// Batches, messages and bytes sent between the first and last entry.
    pub batches_sent: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub avg_batch_size: f64,
    pub active_destinations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricsSummary {
    NoData,
    Available(SummaryReport),
}

impl MetricsSummary {
    pub fn is_no_data(&self) -> bool {
        matches!(self, MetricsSummary::NoData)
    }

    pub fn report(&self) -> Option<&SummaryReport> {
        match self {
            MetricsSummary::Available(report) => Some(report),
            MetricsSummary::NoData => None,
        }
    }
}

/// Bounded history of collected metrics; the oldest entry is evicted first.
#[derive(Debug)]
pub struct MetricsHistory {
    entries: VecDeque<AggregatedMetrics>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, metrics: AggregatedMetrics) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(metrics);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&AggregatedMetrics> {
        self.entries.back()
    }

    pub fn recent(&self, count: usize) -> Vec<AggregatedMetrics> {
        self.entries
            .iter()
            .skip(self.entries.len().saturating_sub(count))
            .cloned()
            .collect()
    }

    pub fn summary(&self, window: usize) -> MetricsSummary {
        let window = window.max(1);
        let entries: Vec<&AggregatedMetrics> = self
            .entries
            .iter()
            .skip(self.entries.len().saturating_sub(window))
            .collect();

        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return MetricsSummary::NoData;
        };

        let samples = entries.len();
        let count = samples as f64;
        let avg = |value: fn(&AggregatedMetrics) -> f64| -> f64 {
            entries.iter().map(|m| value(m)).sum::<f64>() / count
        };

        let batches_sent = last
            .batching
            .total_batches_sent
            .saturating_sub(first.batching.total_batches_sent);
        let messages_sent = last
            .batching
            .total_messages_sent
            .saturating_sub(first.batching.total_messages_sent);

        MetricsSummary::Available(SummaryReport {
            window,
            samples,
            period_start: first.timestamp,
            period_end: last.timestamp,
            avg_buffered_messages: avg(|m| m.buffers.buffered_messages as f64),
            peak_buffered_messages: entries
                .iter()
                .map(|m| m.buffers.buffered_messages)
                .max()
                .unwrap_or(0),
            avg_buffered_bytes: avg(|m| m.buffers.buffered_bytes as f64),
            peak_buffered_bytes: entries
                .iter()
                .map(|m| m.buffers.buffered_bytes)
                .max()
                .unwrap_or(0),
            avg_memory_percent: avg(|m| m.memory.percent_of_limit),
            peak_memory_percent: entries
                .iter()
                .map(|m| m.memory.percent_of_limit)
                .fold(0.0_f64, f64::max),
            worst_pressure: entries
                .iter()
                .map(|m| m.memory.pressure_level)
                .max()
                .unwrap_or_default(),
            current_pressure: last.memory.pressure_level,
            batches_sent,
            messages_sent,
            bytes_sent: last
                .batching
                .total_bytes_sent
                .saturating_sub(first.batching.total_bytes_sent),
            send_failures: last
                .batching
                .total_send_failures
                .saturating_sub(first.batching.total_send_failures),
            avg_batch_size: if batches_sent == 0 {
                last.batching.avg_batch_size
            } else {
                messages_sent as f64 / batches_sent as f64
            },
            active_destinations: last.pool.active_destinations,
        })
    }
}
