// Loopback connection pool.
//
// Keeps destinations in memory and records every delivery instead of writing
// to a socket. Used by the synthetic load driver and by the test-suite.

use super::{ConnectionPool, DeliverySink, PoolStats};
use crate::domain::{Delivery, DestinationId, Payload, PoolError, SendError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RecordedDelivery<P> {
    pub destination_id: DestinationId,
    pub event: String,
    pub delivery: Delivery<P>,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DestinationEntry {
    user_id: Option<String>,
    failing: bool,
    errored: bool,
}

pub struct InMemoryPool<P> {
    destinations: RwLock<HashMap<DestinationId, DestinationEntry>>,
    deliveries: Mutex<Vec<RecordedDelivery<P>>>,
    delivered_messages: AtomicU64,
    record: bool,
    capacity: Option<usize>,
    send_delay: Option<Duration>,
    closed: AtomicBool,
    delivered: Notify,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    released_with_error: AtomicU64,
}

impl<P> Default for InMemoryPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> InMemoryPool<P> {
    pub fn new() -> Self {
        Self {
            destinations: RwLock::new(HashMap::new()),
            deliveries: Mutex::new(Vec::new()),
            delivered_messages: AtomicU64::new(0),
            record: true,
            capacity: None,
            send_delay: None,
            closed: AtomicBool::new(false),
            delivered: Notify::new(),
            total_acquired: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
            released_with_error: AtomicU64::new(0),
        }
    }

    /// Caps the number of concurrently acquired destinations.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Counts deliveries without retaining their payloads.
    #[must_use]
    pub fn without_recording(mut self) -> Self {
        self.record = false;
        self
    }

    /// Simulates transport latency on every send.
    #[must_use]
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    /// Registers a destination under a caller-chosen id.
    pub fn register(&self, destination_id: impl Into<String>) {
        self.destinations
            .write()
            .insert(destination_id.into(), DestinationEntry::default());
    }

    /// Makes every subsequent send to `destination_id` fail with a transport error.
    pub fn set_failing(&self, destination_id: &str, failing: bool) {
        if let Some(entry) = self.destinations.write().get_mut(destination_id) {
            entry.failing = failing;
        }
    }

    pub fn user_of(&self, destination_id: &str) -> Option<String> {
        self.destinations
            .read()
            .get(destination_id)
            .and_then(|entry| entry.user_id.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of send invocations recorded so far.
    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().len()
    }

    /// Number of logical messages delivered, counting every entry of a batch.
    pub fn delivered_messages(&self) -> u64 {
        self.delivered_messages.load(Ordering::Relaxed)
    }

    pub fn take_deliveries(&self) -> Vec<RecordedDelivery<P>> {
        std::mem::take(&mut *self.deliveries.lock())
    }

    pub fn deliveries_for(&self, destination_id: &str) -> Vec<RecordedDelivery<P>>
    where
        P: Clone,
    {
        self.deliveries
            .lock()
            .iter()
            .filter(|recorded| recorded.destination_id == destination_id)
            .cloned()
            .collect()
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery<P>>
    where
        P: Clone,
    {
        self.deliveries.lock().clone()
    }

    /// Waits until at least `count` sends have been recorded or `timeout` elapses.
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.delivered.notified();
            if self.delivery_count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.delivery_count() >= count;
            }
        }
    }

    fn record_delivery(&self, destination_id: &str, event: &str, delivery: Delivery<P>) {
        self.delivered_messages
            .fetch_add(delivery.message_count() as u64, Ordering::Relaxed);
        if self.record {
            self.deliveries.lock().push(RecordedDelivery {
                destination_id: destination_id.to_string(),
                event: event.to_string(),
                delivery,
                delivered_at: Utc::now(),
            });
        }
        self.delivered.notify_waiters();
    }
}

#[async_trait]
impl<P: Payload> DeliverySink<P> for InMemoryPool<P> {
    async fn send(
        &self,
        destination_id: &str,
        event: &str,
        delivery: Delivery<P>,
    ) -> Result<(), SendError> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }

        if self.is_closed() {
            return Err(SendError::DestinationClosed {
                destination_id: destination_id.to_string(),
            });
        }

        {
            let mut destinations = self.destinations.write();
            let Some(entry) = destinations.get_mut(destination_id) else {
                return Err(SendError::DestinationClosed {
                    destination_id: destination_id.to_string(),
                });
            };
            if entry.failing {
                entry.errored = true;
                return Err(SendError::transport(destination_id, "simulated send failure"));
            }
        }

        self.record_delivery(destination_id, event, delivery);
        Ok(())
    }
}

#[async_trait]
impl<P: Payload> ConnectionPool<P> for InMemoryPool<P> {
    async fn acquire(&self, user_id: Option<&str>) -> Result<DestinationId, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let mut destinations = self.destinations.write();
        if let Some(capacity) = self.capacity {
            if destinations.len() >= capacity {
                return Err(PoolError::Exhausted {
                    active: destinations.len(),
                    capacity,
                });
            }
        }

        let destination_id = format!("sid_{}", Uuid::new_v4().simple());
        destinations.insert(
            destination_id.clone(),
            DestinationEntry {
                user_id: user_id.map(str::to_string),
                ..DestinationEntry::default()
            },
        );
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(destination_id)
    }

    async fn release(&self, destination_id: &str, had_error: bool) {
        if self.destinations.write().remove(destination_id).is_some() {
            self.total_released.fetch_add(1, Ordering::Relaxed);
            if had_error {
                self.released_with_error.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn contains(&self, destination_id: &str) -> bool {
        !self.is_closed() && self.destinations.read().contains_key(destination_id)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            active_destinations: self.destinations.read().len() as u64,
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            released_with_error: self.released_with_error.load(Ordering::Relaxed),
        }
    }

    async fn cleanup(&self) -> usize {
        let mut destinations = self.destinations.write();
        let before = destinations.len();
        destinations.retain(|_, entry| !entry.errored);
        let removed = before - destinations.len();
        if removed > 0 {
            self.released_with_error
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.total_released.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    async fn drain(&self) {
        self.closed.store(true, Ordering::Release);
        self.destinations.write().clear();
    }
}
