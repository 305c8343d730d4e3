//! Shared building blocks for the dwsync workspace.
//!
//! Home of the common error type and the logging initialization used by the
//! worker and the CLI. Everything engine-specific lives in `dwsync-engine`.

pub mod error;
pub mod logging;

pub use error::{Result, SyncError};
