//! Request and response shapes of the remote object API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ratelimit::QuotaHeaders;
use crate::types::{BlobSha, CommitSha, GitSignature, TreeSha};

/// A response body together with the quota metadata sent alongside it.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub body: T,
    pub quota: Option<QuotaHeaders>,
}

impl<T> ApiResponse<T> {
    /// A response with no quota headers (local backends, fakes).
    pub fn new(body: T) -> Self {
        Self { body, quota: None }
    }

    pub fn with_quota(body: T, quota: Option<QuotaHeaders>) -> Self {
        Self { body, quota }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            body: f(self.body),
            quota: self.quota,
        }
    }
}

/// Where a ref points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTarget {
    pub ref_name: String,
    pub sha: CommitSha,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitObject {
    pub sha: CommitSha,
    pub tree: TreeSha,
    pub parents: Vec<CommitSha>,
    pub message: String,
    pub author: Option<CommitAuthor>,
}

impl CommitObject {
    /// first line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// Short description of a commit, enough to render a conflict prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: CommitSha,
    pub message: String,
    pub author: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&CommitObject> for CommitSummary {
    fn from(commit: &CommitObject) -> Self {
        Self {
            sha: commit.sha.clone(),
            message: commit.summary().to_string(),
            author: commit.author.as_ref().map(|a| a.name.clone()),
            timestamp: commit.author.as_ref().and_then(|a| a.date),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    Commit,
}

/// One entry of a tree listing. `path` is relative to the listed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    pub kind: EntryKind,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeListing {
    pub sha: TreeSha,
    pub entries: Vec<TreeEntry>,
    /// the server cut the listing short
    pub truncated: bool,
}

impl TreeListing {
    pub fn contains_blob(&self, path: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == EntryKind::Blob && e.path == path)
    }

    pub fn blob_sha(&self, path: &str) -> Option<BlobSha> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Blob && e.path == path)
            .map(|e| BlobSha::new(e.sha.clone()))
    }

    pub fn blob_mode(&self, path: &str) -> Option<FileMode> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Blob && e.path == path)
            .and_then(|e| FileMode::parse(&e.mode))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
    Symlink,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Symlink => "120000",
        }
    }

    /// Parse an octal git mode as it appears in tree listings.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "100644" => Some(FileMode::Regular),
            "100755" => Some(FileMode::Executable),
            "120000" => Some(FileMode::Symlink),
            _ => None,
        }
    }
}

/// One entry for a new tree. A `None` sha removes the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTreeEntry {
    pub path: String,
    pub mode: FileMode,
    pub sha: Option<BlobSha>,
}

impl NewTreeEntry {
    pub fn upsert(path: impl Into<String>, sha: BlobSha) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::Regular,
            sha: Some(sha),
        }
    }

    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::Regular,
            sha: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.sha.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommit {
    pub message: String,
    pub tree: TreeSha,
    pub parents: Vec<CommitSha>,
    pub author: Option<GitSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
}

/// Result of comparing `base...head`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    pub ahead_by: u32,
    pub behind_by: u32,
    /// commits reachable from head but not base, oldest first
    pub commits: Vec<CommitSummary>,
    pub files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobContent {
    pub sha: BlobSha,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: Option<String>,
    pub head: String,
    pub base: String,
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_listing_lookup() {
        let listing = TreeListing {
            sha: TreeSha::new("t"),
            entries: vec![
                TreeEntry {
                    path: "content".into(),
                    mode: "040000".into(),
                    kind: EntryKind::Tree,
                    sha: "a".into(),
                },
                TreeEntry {
                    path: "content/about.md".into(),
                    mode: "100644".into(),
                    kind: EntryKind::Blob,
                    sha: "b".into(),
                },
            ],
            truncated: false,
        };

        assert!(listing.contains_blob("content/about.md"));
        assert!(!listing.contains_blob("content"));
        assert_eq!(listing.blob_sha("content/about.md"), Some(BlobSha::new("b")));
        assert_eq!(listing.blob_mode("content/about.md"), Some(FileMode::Regular));
        assert_eq!(listing.blob_mode("content"), None);
    }

    #[test]
    fn test_file_mode_parse() {
        for mode in [FileMode::Regular, FileMode::Executable, FileMode::Symlink] {
            assert_eq!(FileMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(FileMode::parse("040000"), None);
    }

    #[test]
    fn test_commit_summary_uses_first_line() {
        let commit = CommitObject {
            sha: CommitSha::new("c1"),
            tree: TreeSha::new("t1"),
            parents: vec![],
            message: "Update bio\n\nlonger body".into(),
            author: Some(CommitAuthor {
                name: "Ada".into(),
                email: "ada@example.com".into(),
                date: None,
            }),
        };
        let summary = CommitSummary::from(&commit);
        assert_eq!(summary.message, "Update bio");
        assert_eq!(summary.author.as_deref(), Some("Ada"));
    }
}
