//! The remote version-control object API.
//!
//! Everything the commit pipeline and the conflict detector need from the
//! hosting service is expressed by [`GitDataApi`]: refs, commits, trees,
//! blobs, compare and pull requests. Callers never use an implementation
//! directly; every call is funneled through a
//! [`RequestGate`](crate::ratelimit::RequestGate).
//!
//! Two implementations ship with the crate:
//!
//! - [`GitHubClient`]: GitHub's REST git-data endpoints over HTTPS.
//! - [`LocalRemote`](crate::storage::LocalRemote): the same contract on a
//!   local git repository, for tests and offline development.

mod error;
mod github;
mod types;

use async_trait::async_trait;

pub use error::{RateLimitSignal, RemoteError, RemoteResult};
pub use github::GitHubClient;
pub use types::{
    ApiResponse, BlobContent, ChangedFile, CommitAuthor, CommitObject, CommitSummary, Comparison,
    EntryKind, FileMode, FileStatus, NewCommit, NewPullRequest, NewTreeEntry, PullRequest,
    RefTarget, TreeEntry, TreeListing,
};

use crate::types::{BlobSha, BranchName, CommitSha, RepoId, RepoTarget, TreeSha};

/// Low-level object operations on a hosted repository.
///
/// Every method returns the quota metadata of its response alongside the
/// body, and failures carry it inside [`RemoteError::Status`].
#[async_trait]
pub trait GitDataApi: Send + Sync {
    /// Read the branch reference of `target`.
    async fn get_ref(&self, target: &RepoTarget) -> RemoteResult<ApiResponse<RefTarget>>;

    async fn get_commit(
        &self,
        repo: &RepoId,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<CommitObject>>;

    async fn get_tree(
        &self,
        repo: &RepoId,
        sha: &TreeSha,
        recursive: bool,
    ) -> RemoteResult<ApiResponse<TreeListing>>;

    async fn get_blob(&self, repo: &RepoId, sha: &BlobSha)
        -> RemoteResult<ApiResponse<BlobContent>>;

    async fn create_blob(&self, repo: &RepoId, content: &[u8])
        -> RemoteResult<ApiResponse<BlobSha>>;

    /// Create a tree from `base_tree` with `entries` applied on top.
    async fn create_tree(
        &self,
        repo: &RepoId,
        base_tree: &TreeSha,
        entries: &[NewTreeEntry],
    ) -> RemoteResult<ApiResponse<TreeSha>>;

    async fn create_commit(
        &self,
        repo: &RepoId,
        commit: &NewCommit,
    ) -> RemoteResult<ApiResponse<CommitSha>>;

    /// Move a branch. Without `force`, anything but a fast-forward fails
    /// with [`RemoteError::NonFastForward`].
    async fn update_ref(
        &self,
        repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
        force: bool,
    ) -> RemoteResult<ApiResponse<RefTarget>>;

    /// Create a new branch pointing at `sha`.
    async fn create_ref(
        &self,
        repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<RefTarget>>;

    async fn compare(
        &self,
        repo: &RepoId,
        base: &CommitSha,
        head: &CommitSha,
    ) -> RemoteResult<ApiResponse<Comparison>>;

    async fn create_pull_request(
        &self,
        repo: &RepoId,
        request: &NewPullRequest,
    ) -> RemoteResult<ApiResponse<PullRequest>>;
}
