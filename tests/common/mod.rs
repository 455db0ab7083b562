//! Shared fixtures for the integration tests.
//!
//! `ScriptedApi` wraps a `LocalRemote` and lets a test make chosen calls
//! fail, count how often each call was made, or run a side effect right
//! before a call reaches the repository.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use foliosync::clock::Clock;
use foliosync::config::PipelineConfig;
use foliosync::pipeline::CommitPipeline;
use foliosync::ratelimit::{QuotaHeaders, RequestGate, RetryPolicy};
use foliosync::remote::{
    ApiResponse, BlobContent, CommitObject, Comparison, GitDataApi, NewCommit, NewPullRequest,
    NewTreeEntry, PullRequest, RateLimitSignal, RefTarget, RemoteError, RemoteResult, TreeListing,
};
use foliosync::storage::LocalRemote;
use foliosync::types::{BlobSha, BranchName, CommitSha, RepoId, RepoTarget, TreeSha};

type ErrorFactory = Box<dyn Fn() -> RemoteError + Send + Sync>;
type Hook = Box<dyn FnOnce() + Send>;

struct Fault {
    operation: &'static str,
    remaining: u32,
    make: ErrorFactory,
}

/// Fault-injecting, call-counting wrapper around a local repository.
#[derive(Clone)]
pub struct ScriptedApi {
    inner: LocalRemote,
    faults: Arc<Mutex<Vec<Fault>>>,
    hooks: Arc<Mutex<Vec<(&'static str, Hook)>>>,
    calls: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl ScriptedApi {
    pub fn new(inner: LocalRemote) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Vec::new())),
            hooks: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fail the next `times` calls of `operation` with the produced error.
    pub fn fail<F>(&self, operation: &'static str, times: u32, make: F)
    where
        F: Fn() -> RemoteError + Send + Sync + 'static,
    {
        self.faults.lock().push(Fault {
            operation,
            remaining: times,
            make: Box::new(make),
        });
    }

    /// Run `hook` once, just before the next `operation` call.
    pub fn before<F>(&self, operation: &'static str, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.lock().push((operation, Box::new(hook)));
    }

    pub fn calls(&self, operation: &str) -> u32 {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    pub fn reset_counts(&self) {
        self.calls.lock().clear();
    }

    fn enter(&self, operation: &'static str) -> RemoteResult<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let hook = {
            let mut hooks = self.hooks.lock();
            hooks
                .iter()
                .position(|(op, _)| *op == operation)
                .map(|i| hooks.remove(i).1)
        };
        if let Some(hook) = hook {
            hook();
        }

        let mut faults = self.faults.lock();
        if let Some(fault) = faults
            .iter_mut()
            .find(|f| f.operation == operation && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err((fault.make)());
        }
        Ok(())
    }
}

#[async_trait]
impl GitDataApi for ScriptedApi {
    async fn get_ref(&self, target: &RepoTarget) -> RemoteResult<ApiResponse<RefTarget>> {
        self.enter("get_ref")?;
        self.inner.get_ref(target).await
    }

    async fn get_commit(&self, repo: &RepoId, sha: &CommitSha) -> RemoteResult<ApiResponse<CommitObject>> {
        self.enter("get_commit")?;
        self.inner.get_commit(repo, sha).await
    }

    async fn get_tree(
        &self,
        repo: &RepoId,
        sha: &TreeSha,
        recursive: bool,
    ) -> RemoteResult<ApiResponse<TreeListing>> {
        self.enter("get_tree")?;
        self.inner.get_tree(repo, sha, recursive).await
    }

    async fn get_blob(&self, repo: &RepoId, sha: &BlobSha) -> RemoteResult<ApiResponse<BlobContent>> {
        self.enter("get_blob")?;
        self.inner.get_blob(repo, sha).await
    }

    async fn create_blob(&self, repo: &RepoId, content: &[u8]) -> RemoteResult<ApiResponse<BlobSha>> {
        self.enter("create_blob")?;
        self.inner.create_blob(repo, content).await
    }

    async fn create_tree(
        &self,
        repo: &RepoId,
        base_tree: &TreeSha,
        entries: &[NewTreeEntry],
    ) -> RemoteResult<ApiResponse<TreeSha>> {
        self.enter("create_tree")?;
        self.inner.create_tree(repo, base_tree, entries).await
    }

    async fn create_commit(&self, repo: &RepoId, commit: &NewCommit) -> RemoteResult<ApiResponse<CommitSha>> {
        self.enter("create_commit")?;
        self.inner.create_commit(repo, commit).await
    }

    async fn update_ref(
        &self,
        repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
        force: bool,
    ) -> RemoteResult<ApiResponse<RefTarget>> {
        self.enter("update_ref")?;
        self.inner.update_ref(repo, branch, sha, force).await
    }

    async fn create_ref(
        &self,
        repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<RefTarget>> {
        self.enter("create_ref")?;
        self.inner.create_ref(repo, branch, sha).await
    }

    async fn compare(
        &self,
        repo: &RepoId,
        base: &CommitSha,
        head: &CommitSha,
    ) -> RemoteResult<ApiResponse<Comparison>> {
        self.enter("compare")?;
        self.inner.compare(repo, base, head).await
    }

    async fn create_pull_request(
        &self,
        repo: &RepoId,
        request: &NewPullRequest,
    ) -> RemoteResult<ApiResponse<PullRequest>> {
        self.enter("create_pull_request")?;
        self.inner.create_pull_request(repo, request).await
    }
}

pub fn server_error() -> RemoteError {
    RemoteError::status(503, "service unavailable")
}

pub fn unauthorized() -> RemoteError {
    RemoteError::status(401, "Bad credentials")
}

pub fn secondary_limit(retry_after_secs: u64) -> RemoteError {
    RemoteError::Status {
        status: 403,
        message: "You have exceeded a secondary rate limit".into(),
        rate_limit: Some(RateLimitSignal::Secondary {
            retry_after: Some(Duration::from_secs(retry_after_secs)),
        }),
        quota: None,
    }
}

pub fn quota(remaining: u32, reset_at: DateTime<Utc>) -> QuotaHeaders {
    QuotaHeaders {
        limit: 5000,
        remaining,
        reset_at,
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A gate with deterministic backoff and a fixed starting clock.
pub fn gate(policy: RetryPolicy) -> Arc<RequestGate> {
    Arc::new(
        RequestGate::new(policy.without_jitter(), Duration::from_secs(10))
            .with_clock(Clock::starting_at(epoch())),
    )
}

pub fn target() -> RepoTarget {
    RepoTarget::new(RepoId::new("octo", "portfolio"), BranchName::main())
}

/// A local "remote" holding `data.json`, served through a `ScriptedApi`.
pub struct Fixture {
    pub dir: TempDir,
    pub remote: LocalRemote,
    pub api: ScriptedApi,
    pub gate: Arc<RequestGate>,
    pub target: RepoTarget,
}

impl Fixture {
    pub fn new(policy: RetryPolicy) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let remote = LocalRemote::init(dir.path(), &BranchName::main()).expect("init repository");
        remote
            .write_files(
                &BranchName::main(),
                &[
                    ("data.json", Some(&b"{\"title\":\"seed\"}"[..])),
                    ("README.md", Some(&b"# portfolio\n"[..])),
                ],
                "seed content",
            )
            .expect("seed");
        let api = ScriptedApi::new(remote.clone());

        Self {
            dir,
            remote,
            api,
            gate: gate(policy),
            target: target(),
        }
    }

    pub fn pipeline(&self) -> CommitPipeline {
        self.pipeline_with(PipelineConfig::default())
    }

    pub fn pipeline_with(&self, config: PipelineConfig) -> CommitPipeline {
        CommitPipeline::new(Arc::new(self.api.clone()), self.gate.clone(), config)
    }

    pub fn tip(&self) -> CommitSha {
        self.remote.tip(&self.target.branch).expect("tip")
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.remote.file_at(&self.target.branch, path).expect("read file")
    }

    pub fn commits(&self) -> usize {
        self.remote.commit_count(&self.target.branch).expect("commit count")
    }

    /// Commit as another writer, moving the branch under the client.
    pub fn edit_elsewhere(&self, path: &str, content: &[u8]) -> CommitSha {
        self.remote
            .write_files(&self.target.branch, &[(path, Some(content))], "edit from another device")
            .expect("foreign commit")
    }
}
