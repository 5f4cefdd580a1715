use crate::ids::{ShapeId, UserId};

/// Error taxonomy for every collaboration operation.
///
/// `LockConflict` is ordinary control flow for interactive callers: another
/// session holds the shape and the UI should simply not start the edit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollabError {
    #[error("shape not found: {0}")]
    NotFound(ShapeId),

    #[error("shape {shape} is locked by {holder}")]
    LockConflict { shape: ShapeId, holder: UserId },

    #[error("no signed-in session")]
    Unauthenticated,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl CollabError {
    /// Backend/network failures that may succeed on a later attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CollabError::StoreUnavailable(_))
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, CollabError::LockConflict { .. })
    }
}

pub type CollabResult<T> = Result<T, CollabError>;
