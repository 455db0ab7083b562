//! Commit pipeline - turns a batch of file changes into one commit.
//!
//! The pipeline is the main entry point for writes. It handles:
//! - Validating the batch before any remote call
//! - Resolving the branch tip and its base tree
//! - Writing blobs, one tree and one commit
//! - Moving the branch with a fast-forward-only ref update
//!
//! Objects written before the ref update are unreachable until it succeeds,
//! so a failure at any step leaves the branch exactly where it was.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{SyncError, SyncResult};
use crate::pipeline::change::{validate_batch, ChangeOperation, FileChange};
use crate::ratelimit::{GateError, RequestGate};
use crate::remote::{GitDataApi, NewCommit, NewPullRequest, NewTreeEntry, PullRequest, TreeListing};
use crate::types::{BranchName, CommitSha, GitSignature, InvalidNameError, RepoTarget, TreeSha};

/// Last observed position of a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTip {
    pub branch: BranchName,
    pub commit_sha: CommitSha,
    pub tree_sha: TreeSha,
}

/// Outcome of a successful commit; the new tip of the branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_sha: CommitSha,
    pub tree_sha: TreeSha,
    pub parent_sha: CommitSha,
    /// tree entries actually applied
    pub files_changed: usize,
    pub timestamp: DateTime<Utc>,
}

impl CommitResult {
    pub fn tip(&self, branch: &BranchName) -> BranchTip {
        BranchTip {
            branch: branch.clone(),
            commit_sha: self.commit_sha.clone(),
            tree_sha: self.tree_sha.clone(),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// overrides [`PipelineConfig::create_backup`]
    pub create_backup: Option<bool>,
    /// fail unless the branch is still at this commit
    pub expected_parent: Option<CommitSha>,
    /// overrides [`PipelineConfig::author`]
    pub author: Option<GitSignature>,
}

impl CommitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backup(mut self, enabled: bool) -> Self {
        self.create_backup = Some(enabled);
        self
    }

    pub fn expect_parent(mut self, sha: CommitSha) -> Self {
        self.expected_parent = Some(sha);
        self
    }

    pub fn with_author(mut self, author: GitSignature) -> Self {
        self.author = Some(author);
        self
    }
}

/// Name of the backup branch taken before committing to `branch` at `at`.
pub fn backup_branch_name(
    prefix: &str,
    branch: &BranchName,
    at: DateTime<Utc>,
) -> Result<BranchName, InvalidNameError> {
    BranchName::new(format!("{}{}-{}", prefix, branch, at.format("%Y%m%d%H%M%S")))
}

/// Builds commits against a [`GitDataApi`], one call at a time through a
/// shared [`RequestGate`].
///
/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
#[derive(Clone)]
pub struct CommitPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    api: Arc<dyn GitDataApi>,
    gate: Arc<RequestGate>,
    config: PipelineConfig,
    /// serializes commits per branch
    commit_locks: Mutex<HashMap<RepoTarget, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommitPipeline {
    pub fn new(api: Arc<dyn GitDataApi>, gate: Arc<RequestGate>, config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                api,
                gate,
                config,
                commit_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.inner.gate
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    fn commit_lock(&self, target: &RepoTarget) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .commit_locks
            .lock()
            .entry(target.clone())
            .or_default()
            .clone()
    }

    /// Read the branch ref and the commit it points to.
    pub async fn resolve_tip(&self, target: &RepoTarget) -> SyncResult<BranchTip> {
        let api = &self.inner.api;
        let gate = &self.inner.gate;

        let reference = gate.execute("get_ref", || api.get_ref(target)).await?;
        let commit = gate
            .execute("get_commit", || api.get_commit(&target.repo, &reference.sha))
            .await?;

        Ok(BranchTip {
            branch: target.branch.clone(),
            commit_sha: commit.sha,
            tree_sha: commit.tree,
        })
    }

    async fn list_tree(&self, target: &RepoTarget, tree: &TreeSha) -> SyncResult<TreeListing> {
        let api = &self.inner.api;
        Ok(self
            .inner
            .gate
            .execute("get_tree", || api.get_tree(&target.repo, tree, true))
            .await?)
    }

    /// Read `path` at the current tip of the branch.
    ///
    /// Returns `None` when the path does not exist.
    pub async fn read_file(&self, target: &RepoTarget, path: &str) -> SyncResult<Option<Vec<u8>>> {
        let tip = self.resolve_tip(target).await?;
        self.read_file_at(target, &tip, path).await
    }

    /// Read `path` from the tree of an already resolved `tip`.
    pub async fn read_file_at(
        &self,
        target: &RepoTarget,
        tip: &BranchTip,
        path: &str,
    ) -> SyncResult<Option<Vec<u8>>> {
        let listing = self.list_tree(target, &tip.tree_sha).await?;
        let Some(sha) = listing.blob_sha(path) else {
            return Ok(None);
        };

        let api = &self.inner.api;
        let blob = self
            .inner
            .gate
            .execute("get_blob", || api.get_blob(&target.repo, &sha))
            .await?;
        Ok(Some(blob.content))
    }

    /// Commit `changes` on top of the branch tip, all or nothing.
    pub async fn create_commit(
        &self,
        target: &RepoTarget,
        changes: &[FileChange],
        message: &str,
        options: &CommitOptions,
    ) -> SyncResult<CommitResult> {
        validate_batch(changes, self.inner.config.max_file_bytes)?;

        let lock = self.commit_lock(target);
        let _guard = lock.lock().await;

        let api = &self.inner.api;
        let gate = &self.inner.gate;

        debug!(repo = %target, changes = changes.len(), "resolving branch tip");
        let tip = self.resolve_tip(target).await?;

        if let Some(expected) = &options.expected_parent {
            if *expected != tip.commit_sha {
                warn!(
                    repo = %target,
                    expected = %expected.short(),
                    actual = %tip.commit_sha.short(),
                    "branch moved before commit"
                );
                return Err(SyncError::ConcurrentModification {
                    branch: target.branch.to_string(),
                    expected: expected.clone(),
                    actual: Some(tip.commit_sha),
                });
            }
        }

        if options.create_backup.unwrap_or(self.inner.config.create_backup) {
            if let Err(e) = self.create_backup(target, &tip).await {
                warn!(repo = %target, error = %e, "backup branch not created");
            }
        }

        // deletes need to know what exists, updates keep the existing mode
        let needs_listing = changes
            .iter()
            .any(|c| matches!(c.operation, ChangeOperation::Delete | ChangeOperation::Update));
        let base_listing = if needs_listing {
            Some(self.list_tree(target, &tip.tree_sha).await?)
        } else {
            None
        };

        let mut entries = Vec::with_capacity(changes.len());
        for change in changes {
            match (change.operation, change.content.as_deref()) {
                (ChangeOperation::Delete, _) => {
                    let exists = base_listing
                        .as_ref()
                        .map_or(true, |l| l.truncated || l.contains_blob(&change.path));
                    if exists {
                        entries.push(NewTreeEntry::delete(change.path.as_str()));
                    } else {
                        debug!(path = %change.path, "already deleted, skipping");
                    }
                }
                (_, Some(content)) => {
                    let sha = gate
                        .execute("create_blob", || api.create_blob(&target.repo, content))
                        .await?;
                    debug!(path = %change.path, blob = %sha.short(), "blob created");
                    let mode = base_listing
                        .as_ref()
                        .and_then(|l| l.blob_mode(&change.path))
                        .unwrap_or_default();
                    entries.push(NewTreeEntry::upsert(change.path.as_str(), sha).with_mode(mode));
                }
                (operation, None) => {
                    return Err(SyncError::InvalidState(format!(
                        "{} of {} has no content",
                        operation, change.path
                    )))
                }
            }
        }

        let tree_sha = if entries.is_empty() {
            tip.tree_sha.clone()
        } else {
            gate.execute("create_tree", || {
                api.create_tree(&target.repo, &tip.tree_sha, &entries)
            })
            .await?
        };
        debug!(tree = %tree_sha.short(), entries = entries.len(), "tree created");

        let new_commit = NewCommit {
            message: message.to_string(),
            tree: tree_sha.clone(),
            parents: vec![tip.commit_sha.clone()],
            author: options
                .author
                .clone()
                .or_else(|| self.inner.config.author.clone()),
        };
        let commit_sha = gate
            .execute("create_commit", || api.create_commit(&target.repo, &new_commit))
            .await?;
        debug!(commit = %commit_sha.short(), "commit created");

        let moved = gate
            .execute("update_ref", || {
                api.update_ref(&target.repo, &target.branch, &commit_sha, false)
            })
            .await;
        if let Err(e) = moved {
            return Err(self.ref_update_failure(target, &tip, e).await);
        }

        info!(
            repo = %target,
            commit = %commit_sha.short(),
            parent = %tip.commit_sha.short(),
            files = entries.len(),
            "commit created"
        );

        Ok(CommitResult {
            commit_sha,
            tree_sha,
            parent_sha: tip.commit_sha,
            files_changed: entries.len(),
            timestamp: gate.clock().now(),
        })
    }

    async fn ref_update_failure(&self, target: &RepoTarget, tip: &BranchTip, error: GateError) -> SyncError {
        let rejected = error
            .remote_error()
            .map_or(false, |e| e.is_non_fast_forward());
        if !rejected {
            return error.into();
        }

        let actual = self.resolve_tip(target).await.ok().map(|t| t.commit_sha);
        warn!(
            repo = %target,
            expected = %tip.commit_sha.short(),
            actual = ?actual.as_ref().map(|s| s.short().to_string()),
            "ref update rejected, branch moved"
        );
        SyncError::ConcurrentModification {
            branch: target.branch.to_string(),
            expected: tip.commit_sha.clone(),
            actual,
        }
    }

    async fn create_backup(&self, target: &RepoTarget, tip: &BranchTip) -> SyncResult<BranchName> {
        let name = backup_branch_name(
            &self.inner.config.backup_prefix,
            &target.branch,
            self.inner.gate.clock().now(),
        )
        .map_err(|e| SyncError::InvalidConfig(format!("backup branch name: {}", e)))?;

        let api = &self.inner.api;
        self.inner
            .gate
            .execute("create_ref", || api.create_ref(&target.repo, &name, &tip.commit_sha))
            .await?;
        debug!(backup = %name, commit = %tip.commit_sha.short(), "backup branch created");
        Ok(name)
    }

    /// Create `branch` at the current tip of `from`.
    pub async fn create_branch(&self, from: &RepoTarget, branch: &BranchName) -> SyncResult<BranchTip> {
        let tip = self.resolve_tip(from).await?;
        let api = &self.inner.api;
        self.inner
            .gate
            .execute("create_ref", || api.create_ref(&from.repo, branch, &tip.commit_sha))
            .await?;
        info!(from = %from, branch = %branch, "branch created");
        Ok(BranchTip {
            branch: branch.clone(),
            ..tip
        })
    }

    /// Open a pull request from `head` into the target branch.
    pub async fn open_pull_request(
        &self,
        target: &RepoTarget,
        head: &BranchName,
        title: &str,
        body: Option<&str>,
    ) -> SyncResult<PullRequest> {
        let request = NewPullRequest {
            title: title.to_string(),
            body: body.map(str::to_string),
            head: head.to_string(),
            base: target.branch.to_string(),
            draft: false,
        };

        let api = &self.inner.api;
        let pull = self
            .inner
            .gate
            .execute("create_pull_request", || {
                api.create_pull_request(&target.repo, &request)
            })
            .await?;
        info!(repo = %target, head = %head, number = pull.number, "pull request opened");
        Ok(pull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    use crate::ratelimit::RetryPolicy;
    use crate::storage::LocalRemote;
    use crate::types::RepoId;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalRemote, CommitPipeline, RepoTarget) {
        let dir = TempDir::new().unwrap();
        let remote = LocalRemote::init(dir.path(), &BranchName::main()).unwrap();
        let gate = Arc::new(RequestGate::new(RetryPolicy::no_retries(), Duration::from_secs(10)));
        let pipeline = CommitPipeline::new(Arc::new(remote.clone()), gate, PipelineConfig::default());
        let target = RepoTarget::new(RepoId::new("local", "portfolio"), BranchName::main());
        (dir, remote, pipeline, target)
    }

    #[test]
    fn test_backup_branch_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let name = backup_branch_name("backup/", &BranchName::main(), at).unwrap();
        assert_eq!(name.as_str(), "backup/main-20240309070501");
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let (_dir, remote, pipeline, target) = setup();
        let before = remote.tip(&target.branch).unwrap();

        let result = pipeline
            .create_commit(
                &target,
                &[FileChange::update("data.json", "{\"a\":1}")],
                "update data",
                &CommitOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.parent_sha, before);
        assert_eq!(result.files_changed, 1);
        assert_eq!(remote.tip(&target.branch).unwrap(), result.commit_sha);

        let content = pipeline.read_file(&target, "data.json").await.unwrap();
        assert_eq!(content.as_deref(), Some(&b"{\"a\":1}"[..]));
        assert!(pipeline.read_file(&target, "missing.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expected_parent_mismatch() {
        let (_dir, remote, pipeline, target) = setup();
        let stale = remote.tip(&target.branch).unwrap();
        let moved = remote
            .write_files(&target.branch, &[("about.md", Some(&b"hi"[..]))], "elsewhere")
            .unwrap();

        let err = pipeline
            .create_commit(
                &target,
                &[FileChange::update("data.json", "{}")],
                "update",
                &CommitOptions::new().expect_parent(stale.clone()),
            )
            .await
            .unwrap_err();

        match err {
            SyncError::ConcurrentModification { expected, actual, .. } => {
                assert_eq!(expected, stale);
                assert_eq!(actual, Some(moved.clone()));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(remote.tip(&target.branch).unwrap(), moved);
    }

    #[tokio::test]
    async fn test_backup_branch_is_created() {
        let (_dir, remote, pipeline, target) = setup();
        let before = remote.tip(&target.branch).unwrap();

        pipeline
            .create_commit(
                &target,
                &[FileChange::create("a.md", "a")],
                "add a",
                &CommitOptions::new().with_backup(true),
            )
            .await
            .unwrap();

        let backups: Vec<_> = remote
            .branch_names()
            .unwrap()
            .into_iter()
            .filter(|name| name.starts_with("backup/main-"))
            .collect();
        assert_eq!(backups.len(), 1);
        let backup = BranchName::new(backups[0].as_str()).unwrap();
        assert_eq!(remote.tip(&backup).unwrap(), before);
    }

    #[tokio::test]
    async fn test_pull_request_from_new_branch() {
        let (_dir, remote, pipeline, target) = setup();
        let feature = BranchName::new("edit/bio").unwrap();

        let tip = pipeline.create_branch(&target, &feature).await.unwrap();
        assert_eq!(tip.branch, feature);

        let feature_target = RepoTarget::new(target.repo.clone(), feature.clone());
        pipeline
            .create_commit(&feature_target, &[FileChange::update("bio.md", "new bio")], "bio", &CommitOptions::new())
            .await
            .unwrap();

        let pull = pipeline
            .open_pull_request(&target, &feature, "Update bio", Some("from the editor"))
            .await
            .unwrap();
        assert_eq!(pull.number, 1);
        assert_eq!(pull.state, "open");
        assert_eq!(remote.pull_requests().len(), 1);
    }
}
