//! Error types for the WhoFi environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The output feed was closed by its consumer or by shutdown
    #[error("Feed closed")]
    FeedClosed,
}
