//! Error types for the upgrader.

use std::time::Duration;

use thiserror::Error;

use tierlift_jobs::JobQueueError;
use tierlift_state::StateError;

/// Result type alias for upgrader operations.
pub type UpgradeResult<T> = Result<T, UpgradeError>;

/// Errors that can occur while maintaining upgrades.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("job queue error: {0}")]
    Queue(#[from] JobQueueError),

    #[error("job queue did not answer within {0:?}")]
    Timeout(Duration),
}
