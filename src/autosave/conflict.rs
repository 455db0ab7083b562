//! Detects when the remote branch has moved past the last known commit.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::ratelimit::RequestGate;
use crate::remote::{CommitSummary, FileStatus, GitDataApi};
use crate::types::{CommitSha, RepoTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// the remote changed the file's content
    ContentConflict,
    /// the remote deleted the file
    DeleteConflict,
}

/// One path the remote changed since the last known commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub path: String,
    pub kind: ConflictKind,
    pub remote_commits: Vec<CommitSummary>,
}

/// Everything the UI needs to ask the user how to resolve a divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub target: RepoTarget,
    /// the commit local edits are based on
    pub local_sha: CommitSha,
    /// where the remote branch is now
    pub remote_sha: CommitSha,
    pub records: Vec<ConflictRecord>,
}

impl ConflictReport {
    /// Remote commits across all records, without duplicates.
    pub fn remote_commits(&self) -> Vec<&CommitSummary> {
        let mut commits: Vec<&CommitSummary> = Vec::new();
        for record in &self.records {
            for commit in &record.remote_commits {
                if !commits.iter().any(|c| c.sha == commit.sha) {
                    commits.push(commit);
                }
            }
        }
        commits
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.path.as_str())
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} moved from {} to {} ({} path(s) changed remotely)",
            self.target,
            self.local_sha.short(),
            self.remote_sha.short(),
            self.records.len()
        )
    }
}

/// Result of a conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    /// the remote is still at the last known commit
    Clear { tip: CommitSha },
    Diverged(ConflictReport),
}

impl ConflictCheck {
    pub fn is_clear(&self) -> bool {
        matches!(self, ConflictCheck::Clear { .. })
    }
}

/// Compares the last known commit with the remote tip.
///
/// Any movement of the branch is a conflict; the comparison only decides
/// what to show. Paths in `watched` are reported even when the remote
/// history cannot be diffed (for example after a force push removed the
/// last known commit).
#[derive(Clone)]
pub struct ConflictDetector {
    api: Arc<dyn GitDataApi>,
    gate: Arc<RequestGate>,
}

impl ConflictDetector {
    pub fn new(api: Arc<dyn GitDataApi>, gate: Arc<RequestGate>) -> Self {
        Self { api, gate }
    }

    pub async fn check(
        &self,
        target: &RepoTarget,
        last_known: &CommitSha,
        watched: &[String],
    ) -> SyncResult<ConflictCheck> {
        let api = &self.api;
        let remote = self.gate.execute("get_ref", || api.get_ref(target)).await?;

        if remote.sha == *last_known {
            debug!(repo = %target, tip = %remote.sha.short(), "no remote changes");
            return Ok(ConflictCheck::Clear { tip: remote.sha });
        }

        let comparison = match self
            .gate
            .execute("compare", || api.compare(&target.repo, last_known, &remote.sha))
            .await
        {
            Ok(comparison) => Some(comparison),
            Err(e) if e.remote_error().is_some_and(|r| r.is_not_found()) => {
                debug!(repo = %target, base = %last_known.short(), "last known commit not comparable");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let commits = match &comparison {
            Some(c) if !c.commits.is_empty() => c.commits.clone(),
            _ => {
                let head = self
                    .gate
                    .execute("get_commit", || api.get_commit(&target.repo, &remote.sha))
                    .await?;
                vec![CommitSummary::from(&head)]
            }
        };

        let mut records: Vec<ConflictRecord> = comparison
            .iter()
            .flat_map(|c| c.files.iter())
            .map(|file| ConflictRecord {
                path: file.path.clone(),
                kind: match file.status {
                    FileStatus::Removed => ConflictKind::DeleteConflict,
                    _ => ConflictKind::ContentConflict,
                },
                remote_commits: commits.clone(),
            })
            .collect();

        if records.is_empty() {
            records = watched
                .iter()
                .map(|path| ConflictRecord {
                    path: path.clone(),
                    kind: ConflictKind::ContentConflict,
                    remote_commits: commits.clone(),
                })
                .collect();
        }

        warn!(
            repo = %target,
            local = %last_known.short(),
            remote = %remote.sha.short(),
            paths = records.len(),
            "remote branch diverged"
        );

        Ok(ConflictCheck::Diverged(ConflictReport {
            target: target.clone(),
            local_sha: last_known.clone(),
            remote_sha: remote.sha,
            records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ratelimit::RetryPolicy;
    use crate::storage::LocalRemote;
    use crate::types::{BranchName, RepoId};
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalRemote, ConflictDetector, RepoTarget) {
        let dir = TempDir::new().unwrap();
        let remote = LocalRemote::init(dir.path(), &BranchName::main()).unwrap();
        let gate = Arc::new(RequestGate::new(RetryPolicy::no_retries(), Duration::from_secs(10)));
        let detector = ConflictDetector::new(Arc::new(remote.clone()), gate);
        let target = RepoTarget::new(RepoId::new("local", "portfolio"), BranchName::main());
        (dir, remote, detector, target)
    }

    fn watched() -> Vec<String> {
        vec!["data.json".to_string()]
    }

    #[tokio::test]
    async fn test_clear_when_tip_unchanged() {
        let (_dir, remote, detector, target) = setup();
        let tip = remote.tip(&target.branch).unwrap();

        let check = detector.check(&target, &tip, &watched()).await.unwrap();
        assert_eq!(check, ConflictCheck::Clear { tip });
    }

    #[tokio::test]
    async fn test_remote_edit_is_reported() {
        let (_dir, remote, detector, target) = setup();
        let base = remote
            .write_files(&target.branch, &[("data.json", Some(&b"{}"[..])), ("old.md", Some(&b"x"[..]))], "seed")
            .unwrap();
        remote
            .write_files(&target.branch, &[("data.json", Some(&b"{\"a\":2}"[..])), ("old.md", None)], "edit on laptop")
            .unwrap();

        let ConflictCheck::Diverged(report) = detector.check(&target, &base, &watched()).await.unwrap() else {
            panic!("expected a conflict");
        };

        assert_eq!(report.local_sha, base);
        let mut paths: Vec<_> = report.paths().collect();
        paths.sort();
        assert_eq!(paths, vec!["data.json", "old.md"]);

        let deleted = report.records.iter().find(|r| r.path == "old.md").unwrap();
        assert_eq!(deleted.kind, ConflictKind::DeleteConflict);
        assert_eq!(report.remote_commits().len(), 1);
        assert_eq!(report.remote_commits()[0].message, "edit on laptop");
    }

    #[tokio::test]
    async fn test_unknown_local_commit_falls_back_to_watched_paths() {
        let (_dir, remote, detector, target) = setup();
        remote
            .write_files(&target.branch, &[("data.json", Some(&b"{}"[..]))], "remote")
            .unwrap();
        let gone = CommitSha::new("0123456789012345678901234567890123456789");

        let ConflictCheck::Diverged(report) = detector.check(&target, &gone, &watched()).await.unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].path, "data.json");
        assert_eq!(report.records[0].remote_commits[0].message, "remote");
    }
}
