//! Refinery service layer
//!
//! Accumulates inbound fact messages into bounded batches, executes each
//! batch as one atomic store transaction (ensure index → resolve conflicts
//! → compile → apply, per message in submission order), and classifies
//! per-message outcomes for the transport: ack, discard, or requeue.

pub mod config;
pub mod coordinator;
pub mod transport;

pub use config::RefineryConfig;
pub use coordinator::{BatchCoordinator, BatchOptions, Outcome, SubmitError};
pub use transport::Disposition;
