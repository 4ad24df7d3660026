use crate::domain::OutboundMessage;
use chrono::{DateTime, Utc};

/// A message together with the size it was charged at enqueue time.
#[derive(Debug)]
struct BufferedMessage<P> {
    message: OutboundMessage<P>,
    size: usize,
}

/// Pending messages for one destination.
///
/// `total_byte_size` always equals the sum of the charged sizes of the
/// buffered messages. The buffer itself outlives flushes and is reused.
#[derive(Debug)]
pub struct ConnectionBuffer<P> {
    messages: Vec<BufferedMessage<P>>,
    total_byte_size: usize,
    created_at: DateTime<Utc>,
}

/// Contents removed from a buffer by a flush.
#[derive(Debug)]
pub struct BufferSnapshot<P> {
    pub messages: Vec<OutboundMessage<P>>,
    pub total_byte_size: usize,
    pub accumulated_since: DateTime<Utc>,
}

impl<P> BufferSnapshot<P> {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl<P> Default for ConnectionBuffer<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ConnectionBuffer<P> {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            total_byte_size: 0,
            created_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: OutboundMessage<P>, size: usize) {
        self.messages.push(BufferedMessage { message, size });
        self.total_byte_size += size;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn total_byte_size(&self) -> usize {
        self.total_byte_size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True once either the count or the byte threshold is reached.
    pub fn is_full(&self, batch_size: usize, max_batch_bytes: usize) -> bool {
        self.messages.len() >= batch_size || self.total_byte_size >= max_batch_bytes
    }

    /// Removes every message in enqueue order and resets the accumulation clock.
    ///
    /// Allocated capacity is kept for the next cycle; see [`Self::compact`].
    pub fn take(&mut self) -> BufferSnapshot<P> {
        let messages = self.messages.drain(..).map(|buffered| buffered.message).collect();
        let snapshot = BufferSnapshot {
            messages,
            total_byte_size: self.total_byte_size,
            accumulated_since: self.created_at,
        };
        self.total_byte_size = 0;
        self.created_at = Utc::now();
        snapshot
    }

    /// Releases spare capacity. Returns false when the buffer still holds messages.
    pub fn compact(&mut self) -> bool {
        if !self.messages.is_empty() {
            return false;
        }
        self.messages.shrink_to_fit();
        true
    }

    pub fn capacity(&self) -> usize {
        self.messages.capacity()
    }

    /// Recomputes the byte total from the individual charges.
    pub fn charged_bytes(&self) -> usize {
        self.messages.iter().map(|buffered| buffered.size).sum()
    }
}
