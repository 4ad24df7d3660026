//! Per-destination message batching.
//!
//! Every destination owns one [`ConnectionBuffer`]. Enqueued messages are
//! appended to it and leave it as a single aggregated [`BatchEnvelope`] when
//! the buffer fills up (count or bytes) or when its flush timer fires.
//! Critical messages skip the buffer entirely.
//!
//! Each destination slot carries two locks: a short synchronous one guarding
//! the buffer and its timer, and an async one held for the duration of a send
//! so at most one flush per destination is ever in flight. The slot map is
//! only locked to look up or insert a slot.

pub mod buffer;
pub mod size;
pub mod stats;

pub use buffer::{BufferSnapshot, ConnectionBuffer};
pub use size::{DEFAULT_MESSAGE_SIZE, estimate_payload_size};
pub use stats::{AtomicBatcherStats, BatchStatistics, BatcherStats, CurrentBuffers};

use crate::domain::{BATCH_EVENT, BatchEnvelope, Delivery, DestinationId, OutboundMessage, Payload};
use crate::pool::DeliverySink;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush once this many messages are buffered for a destination.
    pub batch_size: usize,
    /// Flush once the buffered payloads reach this many bytes.
    pub max_batch_bytes: usize,
    /// Flush a partially filled buffer this long after its first message.
    #[serde(rename = "batch_timeout_ms", with = "crate::app::config::serde_helpers")]
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batch_bytes: 64 * 1024, // 64KB
            batch_timeout: Duration::from_millis(50),
        }
    }
}

/// What happened to a message handed to [`MessageBatcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to the destination's buffer; a timer will flush it.
    Buffered,
    /// Appended and the buffer became full; this many messages were delivered.
    Flushed(usize),
    /// Sent alone, bypassing the buffer.
    SentImmediately,
    /// The send primitive rejected the message or batch; it is gone.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Full,
    Timeout,
    Manual,
    Forced,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct SlotState<P> {
    buffer: ConnectionBuffer<P>,
    timer: Option<PendingTimer>,
}

struct DestinationSlot<P> {
    state: Mutex<SlotState<P>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl<P> DestinationSlot<P> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                buffer: ConnectionBuffer::new(),
                timer: None,
            }),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }
}

struct BatcherInner<P: Payload> {
    config: BatchConfig,
    sink: Arc<dyn DeliverySink<P>>,
    slots: RwLock<HashMap<DestinationId, Arc<DestinationSlot<P>>>>,
    stats: AtomicBatcherStats,
    timer_seq: AtomicU64,
}

pub struct MessageBatcher<P: Payload> {
    inner: Arc<BatcherInner<P>>,
}

impl<P: Payload> Clone for MessageBatcher<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Payload> MessageBatcher<P> {
    pub fn new(config: BatchConfig, sink: Arc<dyn DeliverySink<P>>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                sink,
                slots: RwLock::new(HashMap::new()),
                stats: AtomicBatcherStats::new(),
                timer_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queues `message` for its destination.
    ///
    /// Critical messages, and any message when `send_immediately` is set, are
    /// sent alone right away. Everything else is buffered; a full buffer is
    /// flushed before this returns, otherwise a flush timer is armed if none
    /// is pending for the destination.
    pub async fn enqueue(&self, message: OutboundMessage<P>, send_immediately: bool) -> EnqueueOutcome {
        if send_immediately || message.is_critical() {
            return self.send_immediate(message).await;
        }

        let size = estimate_payload_size(&message.payload);
        let destination_id = message.destination_id.clone();
        let slot = self.slot(&destination_id);

        if !self.push(&destination_id, &slot, message, size) {
            return EnqueueOutcome::Buffered;
        }

        match self.flush_slot(&destination_id, &slot, FlushTrigger::Full).await {
            Some(messages) => EnqueueOutcome::Flushed(messages),
            None => EnqueueOutcome::Dropped,
        }
    }

    /// Sends everything buffered for `destination_id` as one batch.
    ///
    /// Returns the number of messages delivered; zero when the buffer was
    /// empty, the destination unknown, or the send failed.
    pub async fn flush(&self, destination_id: &str) -> usize {
        let Some(slot) = self.existing_slot(destination_id) else {
            return 0;
        };
        self.flush_slot(destination_id, &slot, FlushTrigger::Manual)
            .await
            .unwrap_or(0)
    }

    /// Flushes every destination concurrently and cancels their pending timers.
    ///
    /// A failed send at one destination does not affect the others.
    pub async fn flush_all(&self) -> usize {
        let slots = self.all_slots();
        let flushes = slots
            .iter()
            .map(|(destination_id, slot)| self.flush_slot(destination_id, slot, FlushTrigger::Forced));

        let flushed: usize = join_all(flushes).await.into_iter().flatten().sum();
        if flushed > 0 {
            info!(
                destinations = slots.len(),
                messages = flushed,
                "Flushed all destination buffers"
            );
        }
        flushed
    }

    /// Flushes and then drops the buffer of a destination that went away.
    pub async fn forget(&self, destination_id: &str) -> usize {
        let Some(slot) = self.remove_slot(destination_id) else {
            return 0;
        };
        self.flush_slot(destination_id, &slot, FlushTrigger::Forced)
            .await
            .unwrap_or(0)
    }

    /// Drops the buffers of destinations for which `keep` returns false.
    ///
    /// Their pending timers are aborted and anything still buffered is
    /// discarded unsent. Returns the number of buffers removed.
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut slots = self.inner.slots.write();
        let before = slots.len();
        let mut discarded = 0;
        slots.retain(|destination_id, slot| {
            if keep(destination_id) {
                return true;
            }
            let mut state = slot.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.handle.abort();
            }
            discarded += state.buffer.take().len();
            false
        });
        let removed = before - slots.len();
        drop(slots);

        if removed > 0 {
            info!(
                buffers = removed,
                discarded_messages = discarded,
                "Dropped buffers of departed destinations"
            );
        }
        removed
    }

    /// Aborts every pending flush timer without flushing. Returns how many were aborted.
    pub fn cancel_timers(&self) -> usize {
        self.all_slots()
            .iter()
            .filter(|(_, slot)| {
                let mut state = slot.state.lock();
                match state.timer.take() {
                    Some(timer) => {
                        timer.handle.abort();
                        true
                    }
                    None => false,
                }
            })
            .count()
    }

    /// Releases spare capacity held by idle buffers. Busy buffers are skipped.
    pub fn compact(&self) -> usize {
        self.inner
            .slots
            .read()
            .values()
            .filter(|slot| {
                slot.state
                    .try_lock()
                    .is_some_and(|mut state| state.buffer.compact())
            })
            .count()
    }

    pub fn pending_timers(&self) -> usize {
        self.inner
            .slots
            .read()
            .values()
            .filter(|slot| slot.state.lock().timer.is_some())
            .count()
    }

    pub fn buffered_messages(&self, destination_id: &str) -> usize {
        self.existing_slot(destination_id)
            .map_or(0, |slot| slot.state.lock().buffer.len())
    }

    pub fn buffered_bytes(&self, destination_id: &str) -> usize {
        self.existing_slot(destination_id)
            .map_or(0, |slot| slot.state.lock().buffer.total_byte_size())
    }

    /// Checks that the byte total of a buffer matches the sizes of its messages.
    pub fn buffer_consistent(&self, destination_id: &str) -> bool {
        self.existing_slot(destination_id).is_none_or(|slot| {
            let state = slot.state.lock();
            state.buffer.total_byte_size() == state.buffer.charged_bytes()
        })
    }

    pub fn current_buffers(&self) -> CurrentBuffers {
        let slots = self.inner.slots.read();
        let mut current = CurrentBuffers {
            buffer_count: slots.len(),
            buffered_messages: 0,
            buffered_bytes: 0,
        };
        for slot in slots.values() {
            let state = slot.state.lock();
            current.buffered_messages += state.buffer.len();
            current.buffered_bytes += state.buffer.total_byte_size();
        }
        current
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.inner.stats.snapshot()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            configuration: self.inner.config.clone(),
            current_buffers: self.current_buffers(),
            statistics: self.statistics(),
        }
    }

    async fn send_immediate(&self, message: OutboundMessage<P>) -> EnqueueOutcome {
        let OutboundMessage {
            destination_id,
            event_name,
            payload,
            delivery_class,
            ..
        } = message;

        match self
            .inner
            .sink
            .send(&destination_id, &event_name, Delivery::Single(payload))
            .await
        {
            Ok(()) => {
                self.inner.stats.record_immediate();
                debug!(
                    destination_id = %destination_id,
                    event = %event_name,
                    class = ?delivery_class,
                    "Sent message immediately"
                );
                EnqueueOutcome::SentImmediately
            }
            Err(e) => {
                self.inner.stats.record_failure();
                error!(
                    destination_id = %destination_id,
                    event = %event_name,
                    "Failed to send immediate message: {e}"
                );
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Snapshots, clears and sends one destination's buffer.
    ///
    /// `None` means the send primitive failed; the snapshot is dropped.
    async fn flush_slot(
        &self,
        destination_id: &str,
        slot: &DestinationSlot<P>,
        trigger: FlushTrigger,
    ) -> Option<usize> {
        let _in_flight = slot.in_flight.lock().await;

        let snapshot = Self::take_snapshot(slot);
        if snapshot.is_empty() {
            return Some(0);
        }

        let messages = snapshot.len();
        let bytes = snapshot.total_byte_size;
        let envelope = BatchEnvelope::from_messages(snapshot.messages);

        match self
            .inner
            .sink
            .send(destination_id, BATCH_EVENT, Delivery::Batch(envelope))
            .await
        {
            Ok(()) => {
                self.inner.stats.record_batch(messages, bytes);
                debug!(
                    destination_id,
                    messages,
                    bytes,
                    trigger = ?trigger,
                    "Flushed batch"
                );
                Some(messages)
            }
            Err(e) => {
                self.inner.stats.record_failure();
                error!(
                    destination_id,
                    messages,
                    trigger = ?trigger,
                    "Failed to deliver batch: {e}"
                );
                None
            }
        }
    }

    fn take_snapshot(slot: &DestinationSlot<P>) -> BufferSnapshot<P> {
        let mut state = slot.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        state.buffer.take()
    }

    /// Appends under the slot lock. Returns true when the buffer is now full.
    fn push(
        &self,
        destination_id: &str,
        slot: &Arc<DestinationSlot<P>>,
        message: OutboundMessage<P>,
        size: usize,
    ) -> bool {
        let config = &self.inner.config;
        let mut state = slot.state.lock();
        state.buffer.push(message, size);
        self.inner.stats.record_buffered();

        if state.buffer.is_full(config.batch_size, config.max_batch_bytes) {
            return true;
        }
        if state.timer.is_none() {
            state.timer = Some(self.schedule_timer(destination_id, slot));
        }
        false
    }

    fn schedule_timer(&self, destination_id: &str, slot: &Arc<DestinationSlot<P>>) -> PendingTimer {
        let id = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        let batcher = self.clone();
        let slot = Arc::clone(slot);
        let destination_id = destination_id.to_string();
        let timeout = self.inner.config.batch_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // A flush that ran in the meantime already took (and aborted) this
            // timer or replaced it with a newer one.
            if Self::claim_timer(&slot, id) {
                batcher
                    .flush_slot(&destination_id, &slot, FlushTrigger::Timeout)
                    .await;
            }
        });

        PendingTimer { id, handle }
    }

    fn claim_timer(slot: &DestinationSlot<P>, id: u64) -> bool {
        let mut state = slot.state.lock();
        let owned = state.timer.as_ref().is_some_and(|timer| timer.id == id);
        if owned {
            state.timer = None;
        }
        owned
    }

    fn slot(&self, destination_id: &str) -> Arc<DestinationSlot<P>> {
        if let Some(slot) = self.existing_slot(destination_id) {
            return slot;
        }
        let mut slots = self.inner.slots.write();
        Arc::clone(
            slots
                .entry(destination_id.to_string())
                .or_insert_with(|| Arc::new(DestinationSlot::new())),
        )
    }

    fn existing_slot(&self, destination_id: &str) -> Option<Arc<DestinationSlot<P>>> {
        self.inner.slots.read().get(destination_id).map(Arc::clone)
    }

    fn remove_slot(&self, destination_id: &str) -> Option<Arc<DestinationSlot<P>>> {
        self.inner.slots.write().remove(destination_id)
    }

    fn all_slots(&self) -> Vec<(DestinationId, Arc<DestinationSlot<P>>)> {
        self.inner
            .slots
            .read()
            .iter()
            .map(|(destination_id, slot)| (destination_id.clone(), Arc::clone(slot)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::InMemoryPool;
    use serde_json::{Value, json};

    fn batcher(config: BatchConfig) -> (MessageBatcher<Value>, Arc<InMemoryPool<Value>>) {
        let pool = Arc::new(InMemoryPool::new());
        pool.register("sid_1");
        pool.register("sid_2");
        let sink: Arc<dyn DeliverySink<Value>> = pool.clone();
        (MessageBatcher::new(config, sink), pool)
    }

    #[tokio::test]
    async fn test_timer_on_empty_buffer_is_noop() {
        let (batcher, pool) = batcher(BatchConfig {
            batch_size: 100,
            max_batch_bytes: 64 * 1024,
            batch_timeout: Duration::from_millis(30),
        });

        let outcome = batcher
            .enqueue(OutboundMessage::new("sid_1", "tick", json!(1)), false)
            .await;
        assert_eq!(outcome, EnqueueOutcome::Buffered);
        assert_eq!(batcher.pending_timers(), 1);

        // Manual flush empties the buffer and disarms the timer.
        assert_eq!(batcher.flush("sid_1").await, 1);
        assert_eq!(batcher.pending_timers(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.delivery_count(), 1);
        assert_eq!(batcher.statistics().total_batches_sent, 1);
    }

    #[tokio::test]
    async fn test_flush_unknown_destination_returns_zero() {
        let (batcher, pool) = batcher(BatchConfig::default());
        assert_eq!(batcher.flush("nobody").await, 0);
        assert_eq!(pool.delivery_count(), 0);
    }

    #[tokio::test]
    async fn test_byte_threshold_triggers_flush() {
        let (batcher, pool) = batcher(BatchConfig {
            batch_size: 1000,
            max_batch_bytes: 1024,
            batch_timeout: Duration::from_secs(10),
        });

        let large = "x".repeat(398); // 400 bytes encoded
        let mut outcomes = Vec::new();
        for i in 0..3 {
            outcomes.push(
                batcher
                    .enqueue(OutboundMessage::new("sid_1", format!("e{i}"), json!(large)), false)
                    .await,
            );
        }

        assert_eq!(
            outcomes,
            vec![
                EnqueueOutcome::Buffered,
                EnqueueOutcome::Buffered,
                EnqueueOutcome::Flushed(3)
            ]
        );
        assert_eq!(pool.delivery_count(), 1);
        assert_eq!(batcher.statistics().total_bytes_sent, 1200);
        assert_eq!(batcher.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch_and_counts_failure() {
        let (batcher, pool) = batcher(BatchConfig {
            batch_size: 2,
            ..BatchConfig::default()
        });
        pool.set_failing("sid_1", true);

        batcher
            .enqueue(OutboundMessage::new("sid_1", "a", json!(1)), false)
            .await;
        let outcome = batcher
            .enqueue(OutboundMessage::new("sid_1", "b", json!(2)), false)
            .await;

        assert_eq!(outcome, EnqueueOutcome::Dropped);
        assert_eq!(batcher.buffered_messages("sid_1"), 0);
        let statistics = batcher.statistics();
        assert_eq!(statistics.total_send_failures, 1);
        assert_eq!(statistics.total_batches_sent, 0);
        assert_eq!(statistics.total_messages_sent, 0);
    }

    #[tokio::test]
    async fn test_forget_flushes_and_removes_buffer() {
        let (batcher, pool) = batcher(BatchConfig::default());
        batcher
            .enqueue(OutboundMessage::new("sid_2", "a", json!(1)), false)
            .await;

        assert_eq!(batcher.forget("sid_2").await, 1);
        assert_eq!(batcher.current_buffers().buffer_count, 0);
        assert_eq!(pool.delivery_count(), 1);
        assert_eq!(batcher.forget("sid_2").await, 0);
    }

    #[tokio::test]
    async fn test_retain_drops_departed_destinations() {
        let (batcher, pool) = batcher(BatchConfig {
            batch_timeout: Duration::from_millis(20),
            ..BatchConfig::default()
        });
        for destination in ["sid_1", "sid_2"] {
            batcher
                .enqueue(OutboundMessage::new(destination, "a", json!(1)), false)
                .await;
        }

        assert_eq!(batcher.retain(|id| id == "sid_1"), 1);
        assert_eq!(batcher.current_buffers().buffer_count, 1);
        assert_eq!(batcher.pending_timers(), 1);
        assert_eq!(batcher.buffered_messages("sid_2"), 0);
        assert_eq!(batcher.retain(|_| true), 0);

        // Only the kept destination's timer fires.
        assert!(pool.wait_for_deliveries(1, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.delivery_count(), 1);
        assert!(pool.deliveries_for("sid_2").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_timers_keeps_messages_buffered() {
        let (batcher, pool) = batcher(BatchConfig {
            batch_timeout: Duration::from_millis(20),
            ..BatchConfig::default()
        });
        batcher
            .enqueue(OutboundMessage::new("sid_1", "a", json!(1)), false)
            .await;

        assert_eq!(batcher.cancel_timers(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(pool.delivery_count(), 0);
        assert_eq!(batcher.buffered_messages("sid_1"), 1);
    }
}
