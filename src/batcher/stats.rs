// Lock-free batcher statistics.
//
// Counters are updated on the hot path from any destination's flush, so they
// are plain atomics rather than fields behind the buffer map lock.

use super::BatchConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AtomicBatcherStats {
    total_messages_buffered: AtomicU64,
    total_batches_sent: AtomicU64,
    total_messages_sent: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_immediate_sent: AtomicU64,
    total_send_failures: AtomicU64,
}

impl AtomicBatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_buffered(&self) {
        self.total_messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch that the send primitive accepted.
    pub fn record_batch(&self, messages: usize, bytes: usize) {
        self.total_batches_sent.fetch_add(1, Ordering::Relaxed);
        self.total_messages_sent
            .fetch_add(messages as u64, Ordering::Relaxed);
        self.total_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_immediate(&self) {
        self.total_immediate_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BatchStatistics {
        let total_batches_sent = self.total_batches_sent.load(Ordering::Relaxed);
        let total_messages_sent = self.total_messages_sent.load(Ordering::Relaxed);
        let avg_batch_size = if total_batches_sent == 0 {
            0.0
        } else {
            total_messages_sent as f64 / total_batches_sent as f64
        };

        BatchStatistics {
            total_messages_buffered: self.total_messages_buffered.load(Ordering::Relaxed),
            total_batches_sent,
            total_messages_sent,
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            avg_batch_size,
            total_immediate_sent: self.total_immediate_sent.load(Ordering::Relaxed),
            total_send_failures: self.total_send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Cumulative counters since the batcher was created.
///
/// `total_messages_sent` and `avg_batch_size` cover batched traffic only;
/// critical and immediate sends are counted in `total_immediate_sent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub total_messages_buffered: u64,
    pub total_batches_sent: u64,
    pub total_messages_sent: u64,
    pub total_bytes_sent: u64,
    pub avg_batch_size: f64,
    pub total_immediate_sent: u64,
    pub total_send_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentBuffers {
    pub buffer_count: usize,
    pub buffered_messages: usize,
    pub buffered_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub configuration: BatchConfig,
    pub current_buffers: CurrentBuffers,
    pub statistics: BatchStatistics,
}
