//! Error definitions for the tree engine, allocation pool and block store.

use thiserror::Error;

use crate::store::BlockId;

pub type TreeResult<T> = Result<T, TreeError>;

/// Errors surfaced by the storage core.
///
/// `Structural` and `RefCount` indicate corruption of an invariant and are
/// never retried. Everything else is a recoverable, caller-visible condition.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Reference count error: {0}")]
    RefCount(String),

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: u64, len: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TreeError {
    /// Whether this error means an invariant has been broken.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TreeError::Structural(_) | TreeError::RefCount(_))
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            TreeError::Io(_) => "io_error",
            TreeError::InvalidState(_) => "invalid_state",
            TreeError::Structural(_) => "structural_error",
            TreeError::BlockNotFound(_) => "block_not_found",
            TreeError::RefCount(_) => "ref_count_error",
            TreeError::OutOfSpace(_) => "out_of_space",
            TreeError::IndexOutOfBounds { .. } => "index_out_of_bounds",
            TreeError::Config(_) => "config_error",
            TreeError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        TreeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TreeError::Structural("bad entry".into()).is_fatal());
        assert!(TreeError::RefCount("underflow".into()).is_fatal());
        assert!(!TreeError::InvalidState("inactive".into()).is_fatal());
        assert_eq!(
            TreeError::IndexOutOfBounds { index: 5, len: 2 }.kind(),
            "index_out_of_bounds"
        );
        assert_eq!(
            TreeError::BlockNotFound(BlockId(7)).to_string(),
            "Block not found: #7"
        );
    }
}
