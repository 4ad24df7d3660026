#![warn(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![warn(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed:
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::doc_markdown
)]

pub mod app;
pub mod batcher;
pub mod coordinator;
pub mod domain;
pub mod memory;
pub mod pool;

// Re-export main types for easy access
pub use app::Config;
pub use batcher::{BatchConfig, EnqueueOutcome, MessageBatcher};
pub use coordinator::{CoordinatorConfig, DeliveryCoordinator, MetricsSummary};
pub use domain::{Delivery, DeliveryClass, DeliveryError, OutboundMessage, SendError};
pub use memory::{MemoryPressureMonitor, MonitorConfig, PressureLevel};
pub use pool::{ConnectionPool, DeliverySink, InMemoryPool};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
