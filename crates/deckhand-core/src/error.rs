//! Error types for deckhand.

use thiserror::Error;

/// Maximum length of a failure message persisted on a runner or timeline row.
pub const MAX_MESSAGE_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A gate refused to let the stage advance.
    #[error("{0}")]
    Blocked(String),

    #[error("ErrImagePathInUse: image path {0} is already reserved")]
    ImagePathInUse(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The remote executor could not be reached before anything was applied.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded(_))
    }

    /// The message written to a runner row when this error terminates it.
    pub fn runner_message(&self) -> String {
        match self {
            Error::Blocked(msg) => truncate_message(msg),
            other => truncate_message(&other.to_string()),
        }
    }
}

/// Truncate a user-visible message to [`MAX_MESSAGE_LEN`] characters.
pub fn truncate_message(msg: &str) -> String {
    match msg.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
