//! File changes and batch validation.
//!
//! A batch is checked as a whole before anything is sent to the remote: one
//! bad entry rejects every entry.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted repository path, in bytes.
pub const MAX_PATH_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Create and update carry content; delete does not.
    pub fn needs_content(&self) -> bool {
        !matches!(self, ChangeOperation::Delete)
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Why a change (or the whole batch) was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidChange {
    #[error("nothing to commit")]
    EmptyBatch,

    #[error("path is empty")]
    EmptyPath,

    #[error("path must be relative to the repository root")]
    AbsolutePath,

    #[error("path contains a '..' segment")]
    Traversal,

    #[error("path contains an empty or '.' segment")]
    EmptySegment,

    #[error("path contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("path is {len} bytes, limit is {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("{0} requires content")]
    MissingContent(ChangeOperation),

    #[error("delete must not carry content")]
    UnexpectedContent,

    #[error("content is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("path appears more than once in the batch")]
    DuplicatePath,
}

/// A rejected batch, naming the offending path when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{reason}", at_path(.path))]
pub struct ValidationError {
    pub path: Option<String>,
    pub reason: InvalidChange,
}

fn at_path(path: &Option<String>) -> String {
    match path {
        Some(path) => format!("'{}': ", path),
        None => String::new(),
    }
}

impl ValidationError {
    pub fn at(path: impl Into<String>, reason: InvalidChange) -> Self {
        Self {
            path: Some(path.into()),
            reason,
        }
    }

    pub fn batch(reason: InvalidChange) -> Self {
        Self { path: None, reason }
    }
}

/// A repository-relative path that is safe to put in a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPath(String);

impl RepoPath {
    pub fn new(path: impl Into<String>) -> Result<Self, InvalidChange> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    fn validate(path: &str) -> Result<(), InvalidChange> {
        if path.is_empty() {
            return Err(InvalidChange::EmptyPath);
        }
        if path.len() > MAX_PATH_BYTES {
            return Err(InvalidChange::PathTooLong {
                len: path.len(),
                max: MAX_PATH_BYTES,
            });
        }
        if path.starts_with('/') {
            return Err(InvalidChange::AbsolutePath);
        }
        if let Some(c) = path.chars().find(|c| c.is_control() || *c == '\\') {
            return Err(InvalidChange::InvalidCharacter(c));
        }
        for segment in path.split('/') {
            match segment {
                ".." => return Err(InvalidChange::Traversal),
                "" | "." => return Err(InvalidChange::EmptySegment),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One edit in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

impl FileChange {
    pub fn create(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            operation: ChangeOperation::Create,
            content: Some(content.into()),
        }
    }

    pub fn update(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            operation: ChangeOperation::Update,
            content: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            operation: ChangeOperation::Delete,
            content: None,
        }
    }

    /// Check this change on its own.
    pub fn validate(&self, max_file_bytes: u64) -> Result<RepoPath, ValidationError> {
        let fail = |reason| ValidationError::at(self.path.clone(), reason);

        let path = RepoPath::new(self.path.as_str()).map_err(fail)?;

        match (self.operation.needs_content(), &self.content) {
            (true, None) => return Err(fail(InvalidChange::MissingContent(self.operation))),
            (false, Some(_)) => return Err(fail(InvalidChange::UnexpectedContent)),
            (true, Some(content)) => {
                let size = content.len() as u64;
                if size > max_file_bytes {
                    return Err(fail(InvalidChange::TooLarge {
                        size,
                        max: max_file_bytes,
                    }));
                }
            }
            (false, None) => {}
        }

        Ok(path)
    }
}

/// Validate a whole batch. The first offending entry rejects it.
pub fn validate_batch(changes: &[FileChange], max_file_bytes: u64) -> Result<Vec<RepoPath>, ValidationError> {
    if changes.is_empty() {
        return Err(ValidationError::batch(InvalidChange::EmptyBatch));
    }

    let mut seen = HashSet::with_capacity(changes.len());
    let mut paths = Vec::with_capacity(changes.len());
    for change in changes {
        let path = change.validate(max_file_bytes)?;
        if !seen.insert(path.clone()) {
            return Err(ValidationError::at(path.as_str(), InvalidChange::DuplicatePath));
        }
        paths.push(path);
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 1024;

    fn reason(change: FileChange) -> InvalidChange {
        change.validate(MAX).unwrap_err().reason
    }

    #[test]
    fn test_valid_paths() {
        assert!(RepoPath::new("data.json").is_ok());
        assert!(RepoPath::new("content/posts/2024-01-01.md").is_ok());
        assert!(RepoPath::new(".github/workflows/deploy.yml").is_ok());
        assert!(RepoPath::new("notes..txt").is_ok());
    }

    #[test]
    fn test_path_rules() {
        assert_eq!(RepoPath::new(""), Err(InvalidChange::EmptyPath));
        assert_eq!(RepoPath::new("/etc/passwd"), Err(InvalidChange::AbsolutePath));
        assert_eq!(RepoPath::new("../etc/passwd"), Err(InvalidChange::Traversal));
        assert_eq!(RepoPath::new("a/../../b"), Err(InvalidChange::Traversal));
        assert_eq!(RepoPath::new("a//b"), Err(InvalidChange::EmptySegment));
        assert_eq!(RepoPath::new("a/./b"), Err(InvalidChange::EmptySegment));
        assert_eq!(RepoPath::new("dir/"), Err(InvalidChange::EmptySegment));
        assert_eq!(RepoPath::new("a\\b"), Err(InvalidChange::InvalidCharacter('\\')));
        assert_eq!(RepoPath::new("a\0b"), Err(InvalidChange::InvalidCharacter('\0')));
        assert!(matches!(
            RepoPath::new("x".repeat(MAX_PATH_BYTES + 1)),
            Err(InvalidChange::PathTooLong { .. })
        ));
    }

    #[test]
    fn test_content_pairing() {
        let missing = FileChange {
            path: "a.md".into(),
            operation: ChangeOperation::Update,
            content: None,
        };
        assert_eq!(reason(missing), InvalidChange::MissingContent(ChangeOperation::Update));

        let unexpected = FileChange {
            path: "a.md".into(),
            operation: ChangeOperation::Delete,
            content: Some(b"x".to_vec()),
        };
        assert_eq!(reason(unexpected), InvalidChange::UnexpectedContent);

        // empty content is still content
        assert!(FileChange::create("empty.txt", Vec::new()).validate(MAX).is_ok());
    }

    #[test]
    fn test_size_ceiling() {
        assert!(FileChange::update("a.bin", vec![0u8; MAX as usize]).validate(MAX).is_ok());
        assert_eq!(
            reason(FileChange::update("a.bin", vec![0u8; MAX as usize + 1])),
            InvalidChange::TooLarge {
                size: MAX + 1,
                max: MAX
            }
        );
    }

    #[test]
    fn test_batch_rejects_on_any_entry() {
        assert_eq!(
            validate_batch(&[], MAX).unwrap_err(),
            ValidationError::batch(InvalidChange::EmptyBatch)
        );

        let batch = [
            FileChange::update("data.json", "{}"),
            FileChange::create("../etc/passwd", "x"),
        ];
        let err = validate_batch(&batch, MAX).unwrap_err();
        assert_eq!(err.path.as_deref(), Some("../etc/passwd"));
        assert_eq!(err.reason, InvalidChange::Traversal);
        assert_eq!(err.to_string(), "'../etc/passwd': path contains a '..' segment");
    }

    #[test]
    fn test_duplicate_paths() {
        let batch = [FileChange::update("data.json", "{}"), FileChange::delete("data.json")];
        let err = validate_batch(&batch, MAX).unwrap_err();
        assert_eq!(err.reason, InvalidChange::DuplicatePath);
    }

    #[test]
    fn test_operation_serde() {
        let change: FileChange =
            serde_json::from_str(r#"{"path":"data.json","operation":"delete"}"#).unwrap();
        assert_eq!(change, FileChange::delete("data.json"));
        assert_eq!(serde_json::to_string(&ChangeOperation::Update).unwrap(), "\"update\"");
    }
}
