//! Core type-safe wrappers shared by every layer.
//!
//! Object ids arrive from the remote as hex strings, so they are kept as
//! strings here. Separate newtypes make sure we don't accidentally pass a
//! blob sha where a commit sha is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! sha_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// wrap a hex object id
            pub fn new(sha: impl Into<String>) -> Self {
                Self(sha.into())
            }

            /// parse and validate a hex object id (sha-1 or sha-256 length)
            pub fn from_hex(hex: &str) -> Result<Self, InvalidNameError> {
                if hex.len() != 40 && hex.len() != 64 {
                    return Err(InvalidNameError::InvalidLength(hex.len()));
                }
                if let Some((position, c)) = hex.chars().enumerate().find(|(_, c)| !c.is_ascii_hexdigit()) {
                    return Err(InvalidNameError::InvalidCharacter { char: c, position });
                }
                Ok(Self(hex.to_ascii_lowercase()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// short form of the id
            pub fn short(&self) -> &str {
                &self.0[..7.min(self.0.len())]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

sha_type!(
    /// Commit object id.
    CommitSha
);
sha_type!(
    /// Tree object id.
    TreeSha
);
sha_type!(
    /// Blob object id.
    BlobSha
);

/// A validated branch name.
///
/// Git is more permissive than this, but anything we accept here is also a
/// valid path segment in the remote's REST routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// the default branch name
    pub const MAIN: &'static str = "main";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > 255 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if name.contains("..")
            || name.contains("//")
            || name.contains("@{")
            || name.starts_with('/')
            || name.ends_with('/')
            || name.ends_with(".lock")
            || name.starts_with('-')
        {
            return Err(InvalidNameError::InvalidPath(name.to_string()));
        }
        for (position, c) in name.chars().enumerate() {
            if c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
                return Err(InvalidNameError::InvalidCharacter { char: c, position });
            }
        }
        Ok(())
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    /// get the full ref path (e.g., "refs/heads/main")
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for BranchName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchName> for String {
    fn from(value: BranchName) -> Self {
        value.0
    }
}

/// A repository on the remote, identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// The unit a save slot is scoped to: (owner, repo, branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoTarget {
    pub repo: RepoId,
    pub branch: BranchName,
}

impl RepoTarget {
    pub fn new(repo: RepoId, branch: BranchName) -> Self {
        Self { repo, branch }
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.branch)
    }
}

/// git signature (author/committer info)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for commits made by this crate
    pub fn foliosync() -> Self {
        Self::new("foliosync", "foliosync@localhost")
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::foliosync()
    }
}

/// error type for invalid names (branches, object ids)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidLength(usize),
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidLength(len) => write!(f, "object id has invalid length {}", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_valid() {
        assert!(BranchName::new("main").is_ok());
        assert!(BranchName::new("feature/portfolio-edit").is_ok());
        assert!(BranchName::new("backup/main-20240101120000").is_ok());
    }

    #[test]
    fn test_branch_name_invalid() {
        assert_eq!(BranchName::new(""), Err(InvalidNameError::Empty));
        assert!(BranchName::new("../main").is_err());
        assert!(BranchName::new("/main").is_err());
        assert!(BranchName::new("main/").is_err());
        assert!(BranchName::new("main.lock").is_err());
        assert!(BranchName::new("has space").is_err());
        assert!(BranchName::new("a:b").is_err());
    }

    #[test]
    fn test_branch_ref_path() {
        assert_eq!(BranchName::main().as_ref_path(), "refs/heads/main");
    }

    #[test]
    fn test_sha_parsing() {
        let sha = CommitSha::from_hex("A94A8FE5CCB19BA61C4C0873D391E987982FBBD3").unwrap();
        assert_eq!(sha.as_str(), "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
        assert_eq!(sha.short(), "a94a8fe");

        assert!(matches!(TreeSha::from_hex("abc"), Err(InvalidNameError::InvalidLength(3))));
        assert!(BlobSha::from_hex(&"g".repeat(40)).is_err());
    }

    #[test]
    fn test_branch_name_serde() {
        let branch: BranchName = serde_json::from_str("\"main\"").unwrap();
        assert_eq!(branch, BranchName::main());
        assert!(serde_json::from_str::<BranchName>("\"bad..name\"").is_err());
    }

    #[test]
    fn test_repo_target_display() {
        let target = RepoTarget::new(RepoId::new("octo", "portfolio"), BranchName::main());
        assert_eq!(target.to_string(), "octo/portfolio@main");
        assert_eq!(target.repo.full_name(), "octo/portfolio");
    }
}
