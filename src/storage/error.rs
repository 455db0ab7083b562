//! Local backend error types
//!
//! Errors raised while operating on the local object store. They are mapped
//! onto [`RemoteError`] with the status codes the hosted API would return
//! for the same situation, so callers cannot tell the backends apart.

use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;

/// the main error type for local object store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the specified branch/ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// a tree or blob was not found
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// branch already exists
    #[error("reference already exists: {0}")]
    BranchAlreadyExists(String),

    /// the ref update would discard history
    #[error("update is not a fast forward: {branch} at {current}, proposed {proposed}")]
    NotFastForward {
        branch: String,
        current: String,
        proposed: String,
    },

    /// a tree edit names a path that is not in the base tree
    #[error("path not found in tree: {0}")]
    PathNotFound(String),

    /// the tree entry has an unexpected type
    #[error("unexpected entry type at {path}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        path: String,
        expected: String,
        found: String,
    },

    /// malformed object id or tree path in a request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),
}

/// result type alias for local store operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RefNotFound(_)
                | StorageError::CommitNotFound(_)
                | StorageError::ObjectNotFound(_)
        )
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::BranchAlreadyExists(_) | StorageError::NotFastForward { .. }
        )
    }
}

impl From<StorageError> for RemoteError {
    fn from(error: StorageError) -> Self {
        let message = error.to_string();
        match error {
            StorageError::NotFastForward { .. } => RemoteError::NonFastForward { message },
            StorageError::RefNotFound(_)
            | StorageError::CommitNotFound(_)
            | StorageError::ObjectNotFound(_) => RemoteError::not_found(message),
            StorageError::Git(ref e) if e.code() == git2::ErrorCode::NotFound => {
                RemoteError::not_found(message)
            }
            StorageError::BranchAlreadyExists(_)
            | StorageError::PathNotFound(_)
            | StorageError::UnexpectedEntryType { .. }
            | StorageError::InvalidRequest(_) => RemoteError::status(422, message),
            StorageError::Git(_) | StorageError::Io(_) | StorageError::NotInitialized(_) => {
                RemoteError::status(500, message)
            }
        }
    }
}
