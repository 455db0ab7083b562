//!   Local repository backend.
//!
//!  `LocalRemote` wraps a `git2::Repository` with thread-safe access and
//!  answers the remote object API from it. Tests use it as the "server", so
//!  atomicity and fast-forward behaviour are checked against real git objects,
//!  and the CLI uses it for `--local` mode.
//!
//! The repository identifier passed to each call is ignored: one
//! `LocalRemote` is one repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{Oid, Repository};
use parking_lot::Mutex;
use tracing::debug;

use crate::remote::{
    ApiResponse, BlobContent, CommitObject, Comparison, FileMode, GitDataApi, NewCommit,
    NewPullRequest, NewTreeEntry, PullRequest, RefTarget, RemoteError, RemoteResult,
    TreeListing,
};
use crate::storage::blob::{self, parse_oid};
use crate::storage::commit::{self, CommitBuilder};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::tree::{self, TreeMutator};
use crate::types::{BlobSha, BranchName, CommitSha, GitSignature, RepoId, RepoTarget, TreeSha};

/// A git repository on disk, served through [`GitDataApi`].
///
/// Clone this to share across tasks - it uses Arc internally.
#[derive(Clone)]
pub struct LocalRemote {
    inner: Arc<LocalRemoteInner>,
}

struct LocalRemoteInner {
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
    pulls: Mutex<Vec<PullRequest>>,
}

impl LocalRemote {
    fn from_repo(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(LocalRemoteInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature: GitSignature::foliosync(),
                pulls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        Ok(Self::from_repo(repo, path))
    }

    /// Initialize a new repository with an empty initial commit on `branch`.
    pub fn init(path: impl AsRef<Path>, branch: &BranchName) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;
        let remote = Self::from_repo(repo, path);

        remote.with_repo(|repo| {
            let commit_id = commit::create_initial_commit(repo, &remote.inner.signature)?;
            RefManager::init_branch(repo, branch, commit_id)
        })?;

        Ok(remote)
    }

    /// Open or initialize a repository.
    pub fn open_or_init(path: impl AsRef<Path>, branch: &BranchName) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path, branch)
        }
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Execute a function with exclusive access to the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    fn respond<F, T>(&self, f: F) -> RemoteResult<ApiResponse<T>>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        self.with_repo(f).map(ApiResponse::new).map_err(RemoteError::from)
    }

    // ==================== Inspection ====================

    /// Current tip of `branch`.
    pub fn tip(&self, branch: &BranchName) -> StorageResult<CommitSha> {
        self.with_repo(|repo| {
            RefManager::resolve_branch(repo, branch).map(|oid| CommitSha::new(oid.to_string()))
        })
    }

    /// Content of `path` in the tree of `branch`, if present.
    pub fn file_at(&self, branch: &BranchName, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let tree = repo.find_commit(tip)?.tree()?;
            match tree::blob_at_path(&tree, path) {
                Some(oid) => Ok(Some(repo.find_blob(oid)?.content().to_vec())),
                None => Ok(None),
            }
        })
    }

    /// Mode of the blob at `path` in the tree of `branch`, if present.
    pub fn mode_at(&self, branch: &BranchName, path: &str) -> StorageResult<Option<FileMode>> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let tree = repo.find_commit(tip)?.tree()?;
            let mode = match tree.get_path(Path::new(path)) {
                Ok(entry) => FileMode::parse(&format!("{:06o}", entry.filemode())),
                Err(_) => None,
            };
            Ok(mode)
        })
    }

    /// Number of commits reachable from `branch`.
    pub fn commit_count(&self, branch: &BranchName) -> StorageResult<usize> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let mut revwalk = repo.revwalk()?;
            revwalk.push(tip)?;
            Ok(revwalk.count())
        })
    }

    pub fn branch_exists(&self, branch: &BranchName) -> bool {
        let repo = self.inner.repo.lock();
        RefManager::branch_exists(&repo, branch)
    }

    /// Local branch names, sorted.
    pub fn branch_names(&self) -> StorageResult<Vec<String>> {
        self.with_repo(|repo| {
            let mut names = Vec::new();
            for branch in repo.branches(Some(git2::BranchType::Local))? {
                let (branch, _) = branch?;
                if let Some(name) = branch.name()? {
                    names.push(name.to_string());
                }
            }
            names.sort();
            Ok(names)
        })
    }

    /// Pull requests opened against this repository, oldest first.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.inner.pulls.lock().clone()
    }

    /// Commit directly onto `branch`, bypassing the API.
    ///
    /// Stands in for another writer (a second browser tab, a push from a
    /// laptop). `None` content deletes the path.
    pub fn write_files(
        &self,
        branch: &BranchName,
        files: &[(&str, Option<&[u8]>)],
        message: &str,
    ) -> StorageResult<CommitSha> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let base = repo.find_commit(tip)?.tree()?;
            let mut mutator = TreeMutator::from_tree(repo, base);
            for (path, content) in files {
                match content {
                    Some(bytes) => {
                        let oid = repo.blob(bytes)?;
                        mutator.upsert(path, oid, git2::FileMode::Blob)?;
                    }
                    None => mutator.delete(path)?,
                }
            }
            let tree_id = mutator.write()?;
            let oid = CommitBuilder::new(repo)
                .tree(tree_id)
                .parent(tip)
                .message(message)
                .signature(GitSignature::new("someone-else", "other@localhost"))
                .commit()?;
            RefManager::update_branch(repo, branch, oid, false)?;
            Ok(CommitSha::new(oid.to_string()))
        })
    }

    /// Change the mode of an existing file on `branch`, keeping its content.
    pub fn set_mode(&self, branch: &BranchName, path: &str, mode: FileMode) -> StorageResult<CommitSha> {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let base = repo.find_commit(tip)?.tree()?;
            let Some(blob) = tree::blob_at_path(&base, path) else {
                return Err(StorageError::ObjectNotFound(path.to_string()));
            };
            let mut mutator = TreeMutator::from_tree(repo, base);
            mutator.upsert(path, blob, git_mode(mode))?;
            let tree_id = mutator.write()?;
            let oid = CommitBuilder::new(repo)
                .tree(tree_id)
                .parent(tip)
                .message(format!("chmod {} {}", mode.as_str(), path))
                .signature(GitSignature::new("someone-else", "other@localhost"))
                .commit()?;
            RefManager::update_branch(repo, branch, oid, false)?;
            Ok(CommitSha::new(oid.to_string()))
        })
    }
}

fn git_mode(mode: FileMode) -> git2::FileMode {
    match mode {
        FileMode::Regular => git2::FileMode::Blob,
        FileMode::Executable => git2::FileMode::BlobExecutable,
        FileMode::Symlink => git2::FileMode::Link,
    }
}

fn ref_target(branch: &BranchName, oid: Oid) -> RefTarget {
    RefTarget {
        ref_name: branch.as_ref_path(),
        sha: CommitSha::new(oid.to_string()),
    }
}

#[async_trait]
impl GitDataApi for LocalRemote {
    async fn get_ref(&self, target: &RepoTarget) -> RemoteResult<ApiResponse<RefTarget>> {
        self.respond(|repo| {
            let oid = RefManager::resolve_branch(repo, &target.branch)?;
            Ok(ref_target(&target.branch, oid))
        })
    }

    async fn get_commit(
        &self,
        _repo: &RepoId,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<CommitObject>> {
        self.respond(|repo| commit::get_commit(repo, sha))
    }

    async fn get_tree(
        &self,
        _repo: &RepoId,
        sha: &TreeSha,
        recursive: bool,
    ) -> RemoteResult<ApiResponse<TreeListing>> {
        self.respond(|repo| tree::list_tree(repo, sha, recursive))
    }

    async fn get_blob(
        &self,
        _repo: &RepoId,
        sha: &BlobSha,
    ) -> RemoteResult<ApiResponse<BlobContent>> {
        self.respond(|repo| blob::read_blob(repo, sha))
    }

    async fn create_blob(
        &self,
        _repo: &RepoId,
        content: &[u8],
    ) -> RemoteResult<ApiResponse<BlobSha>> {
        self.respond(|repo| blob::write_blob(repo, content))
    }

    async fn create_tree(
        &self,
        _repo: &RepoId,
        base_tree: &TreeSha,
        entries: &[NewTreeEntry],
    ) -> RemoteResult<ApiResponse<TreeSha>> {
        self.respond(|repo| {
            let base_oid = parse_oid(base_tree.as_str())?;
            let base = repo
                .find_tree(base_oid)
                .map_err(|_| StorageError::InvalidRequest(format!("base tree {} does not exist", base_tree)))?;

            let mut mutator = TreeMutator::from_tree(repo, base);
            for entry in entries {
                match &entry.sha {
                    Some(sha) => {
                        let oid = parse_oid(sha.as_str())?;
                        repo.find_blob(oid).map_err(|_| {
                            StorageError::InvalidRequest(format!("blob {} does not exist", sha))
                        })?;
                        mutator.upsert(&entry.path, oid, git_mode(entry.mode))?;
                    }
                    None => mutator.delete(&entry.path)?,
                }
            }

            let oid = mutator.write()?;
            debug!(tree = %oid, entries = entries.len(), "local tree written");
            Ok(TreeSha::new(oid.to_string()))
        })
    }

    async fn create_commit(
        &self,
        _repo: &RepoId,
        new_commit: &NewCommit,
    ) -> RemoteResult<ApiResponse<CommitSha>> {
        self.respond(|repo| {
            let tree_id = parse_oid(new_commit.tree.as_str())?;
            let parents = new_commit
                .parents
                .iter()
                .map(|sha| parse_oid(sha.as_str()))
                .collect::<StorageResult<Vec<_>>>()?;
            let signature = new_commit
                .author
                .clone()
                .unwrap_or_else(|| self.inner.signature.clone());

            let oid = CommitBuilder::new(repo)
                .tree(tree_id)
                .parents(parents)
                .message(new_commit.message.clone())
                .signature(signature)
                .commit()?;
            Ok(CommitSha::new(oid.to_string()))
        })
    }

    async fn update_ref(
        &self,
        _repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
        force: bool,
    ) -> RemoteResult<ApiResponse<RefTarget>> {
        self.respond(|repo| {
            let oid = parse_oid(sha.as_str())?;
            RefManager::update_branch(repo, branch, oid, force)?;
            Ok(ref_target(branch, oid))
        })
    }

    async fn create_ref(
        &self,
        _repo: &RepoId,
        branch: &BranchName,
        sha: &CommitSha,
    ) -> RemoteResult<ApiResponse<RefTarget>> {
        self.respond(|repo| {
            let oid = parse_oid(sha.as_str())?;
            RefManager::create_branch(repo, branch, oid)?;
            Ok(ref_target(branch, oid))
        })
    }

    async fn compare(
        &self,
        _repo: &RepoId,
        base: &CommitSha,
        head: &CommitSha,
    ) -> RemoteResult<ApiResponse<Comparison>> {
        self.respond(|repo| commit::compare(repo, base, head))
    }

    async fn create_pull_request(
        &self,
        _repo: &RepoId,
        request: &NewPullRequest,
    ) -> RemoteResult<ApiResponse<PullRequest>> {
        self.respond(|repo| {
            for name in [&request.head, &request.base] {
                let branch = BranchName::new(name.as_str())
                    .map_err(|e| StorageError::InvalidRequest(format!("{}: {}", name, e)))?;
                if !RefManager::branch_exists(repo, &branch) {
                    return Err(StorageError::InvalidRequest(format!("branch {} does not exist", name)));
                }
            }

            let mut pulls = self.inner.pulls.lock();
            let number = pulls.len() as u64 + 1;
            let pull = PullRequest {
                number,
                html_url: format!("file://{}/pull/{}", self.inner.path.display(), number),
                state: "open".to_string(),
            };
            pulls.push(pull.clone());
            Ok(pull)
        })
    }
}
