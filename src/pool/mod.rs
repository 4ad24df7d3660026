//! Seams to the connection/session pool.
//!
//! The fan-out core never manages connections itself. It needs a send
//! primitive (`DeliverySink`) for every flush and immediate send, and the
//! pool's acquire/release contract for destination bookkeeping.

pub mod memory;

use crate::domain::{Delivery, DestinationId, Payload, PoolError, SendError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{InMemoryPool, RecordedDelivery};

/// The raw send primitive the batcher invokes.
#[async_trait]
pub trait DeliverySink<P: Payload>: Send + Sync {
    async fn send(
        &self,
        destination_id: &str,
        event: &str,
        delivery: Delivery<P>,
    ) -> Result<(), SendError>;
}

/// External pool owning destination identities and transport.
#[async_trait]
pub trait ConnectionPool<P: Payload>: DeliverySink<P> {
    async fn acquire(&self, user_id: Option<&str>) -> Result<DestinationId, PoolError>;

    async fn release(&self, destination_id: &str, had_error: bool);

    fn contains(&self, destination_id: &str) -> bool;

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }

    /// Drops idle or errored destinations. Returns how many were removed.
    async fn cleanup(&self) -> usize {
        0
    }

    /// Closes every destination. Called once buffers have been flushed on shutdown.
    async fn drain(&self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active_destinations: u64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub released_with_error: u64,
}
