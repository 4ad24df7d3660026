//! Domain layer for push-fanout.
//!
//! Contains the canonical types shared across all modules:
//! - `OutboundMessage`: one event bound for one destination
//! - `Delivery` / `BatchEnvelope`: what the send primitive receives
//! - `SendError`, `PoolError`, `DeliveryError`: errors crossing module seams

pub mod error;
pub mod message;

pub use error::{DeliveryError, PoolError, SendError};
pub use message::{
    BATCH_EVENT, BatchEntry, BatchEnvelope, Delivery, DeliveryClass, DestinationId,
    OutboundMessage, Payload,
};
