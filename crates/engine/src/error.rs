//! Engine errors.

use promptloom_core::error::{BackendError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A generation is already running on this pipeline
    #[error("A generation is already in progress")]
    AlreadyGenerating,

    #[error("Nothing to continue: the chat is empty")]
    NothingToContinue,

    #[error("Nothing to regenerate: the chat is empty")]
    NothingToRegenerate,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<EngineError> for promptloom_core::Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Backend(e) => Self::Backend(e),
            EngineError::Store(e) => Self::Store(e),
            other => Self::Internal(other.to_string()),
        }
    }
}
