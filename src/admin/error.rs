use std::path::{Path, PathBuf};

use crate::types::ColstoreError;
use thiserror::Error;

/// Error type for inspection and maintenance commands.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Relation file not found at the specified path.
    #[error("relation not found: {0}")]
    MissingRelation(PathBuf),
    /// Invalid command input.
    #[error("{0}")]
    Message(String),
    /// Core storage error.
    #[error(transparent)]
    Core(#[from] ColstoreError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_relation(path: impl AsRef<Path>) -> Self {
        AdminError::MissingRelation(path.as_ref().to_path_buf())
    }

    /// Returns `true` when the underlying failure is on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(self, AdminError::Core(err) if err.is_corruption())
    }
}
