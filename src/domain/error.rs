use thiserror::Error;

/// Failure reported by the send primitive for a single destination.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    #[error("Destination '{destination_id}' is closed")]
    DestinationClosed { destination_id: String },

    #[error("Transport error for '{destination_id}': {reason}")]
    Transport {
        destination_id: String,
        reason: String,
    },

    #[error("Payload encoding failed: {0}")]
    Encoding(String),
}

/// Errors raised by a connection pool's acquire/release contract.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    #[error("Pool exhausted: {active} of {capacity} destinations in use")]
    Exhausted { active: usize, capacity: usize },

    #[error("Pool is closed")]
    Closed,
}

/// Errors surfaced to producers by the delivery coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Destination '{0}' is not known to the connection pool")]
    UnknownDestination(String),

    #[error("Coordinator is shut down")]
    ShutDown,

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

impl SendError {
    pub fn transport(destination_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SendError::Transport {
            destination_id: destination_id.into(),
            reason: reason.into(),
        }
    }
}
