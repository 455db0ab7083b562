//!  Commit creation and history comparison
//!
//! commits are the atomic units of change in Git. This module creates them
//! from a tree plus parents and answers the two history questions the sync
//! layer asks: what does a commit point to, and what happened between two
//! commits.

use chrono::{TimeZone, Utc};
use git2::{Delta, DiffOptions, Oid, Repository, Sort};

use crate::remote::{ChangedFile, CommitAuthor, CommitObject, CommitSummary, Comparison, FileStatus};
use crate::storage::blob::parse_oid;
use crate::storage::error::{StorageError, StorageResult};
use crate::types::{CommitSha, GitSignature, TreeSha};

/// convert a git2 commit into the API shape
pub(crate) fn commit_object(commit: &git2::Commit<'_>) -> CommitObject {
    let author = commit.author();
    let date = Utc.timestamp_opt(author.when().seconds(), 0).single();

    CommitObject {
        sha: CommitSha::new(commit.id().to_string()),
        tree: TreeSha::new(commit.tree_id().to_string()),
        parents: commit
            .parent_ids()
            .map(|id| CommitSha::new(id.to_string()))
            .collect(),
        message: commit.message().unwrap_or("").to_string(),
        author: Some(CommitAuthor {
            name: author.name().unwrap_or("Unknown").to_string(),
            email: author.email().unwrap_or("unknown@unknown").to_string(),
            date,
        }),
    }
}

/// Writes a commit object without touching any ref.
///
/// Refs are moved separately through `RefManager`, so a commit written here
/// stays unreachable until a fast-forward check accepts it.
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<Oid>,
    parents: Vec<Oid>,
    message: String,
    signature: GitSignature,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::foliosync(),
        }
    }

    pub fn tree(mut self, tree_id: Oid) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: Oid) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn parents(mut self, parents: Vec<Oid>) -> Self {
        self.parents = parents;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// used as both author and committer
    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn commit(self) -> StorageResult<Oid> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::InvalidRequest("commit requires a tree".to_string()))?;
        let tree = self
            .repo
            .find_tree(tree_id)
            .map_err(|_| StorageError::ObjectNotFound(tree_id.to_string()))?;
        let sig = self.signature.to_git2_signature()?;

        let parents = self
            .parents
            .iter()
            .map(|id| {
                self.repo
                    .find_commit(*id)
                    .map_err(|_| StorageError::CommitNotFound(id.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let parents: Vec<&git2::Commit<'_>> = parents.iter().collect();

        Ok(self
            .repo
            .commit(None, &sig, &sig, &self.message, &tree, &parents)?)
    }
}

/// Look up a commit by sha.
pub fn get_commit(repo: &Repository, sha: &CommitSha) -> StorageResult<CommitObject> {
    let commit = repo
        .find_commit(parse_oid(sha.as_str())?)
        .map_err(|_| StorageError::CommitNotFound(sha.to_string()))?;

    Ok(commit_object(&commit))
}

/// create the initial commit for a new repository
pub fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<Oid> {
    let tree_id = crate::storage::tree::create_initial_tree(repo)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message("Initial commit")
        .signature(signature.clone())
        .commit()
}

/// commits reachable from `include` but not from `exclude`, oldest first
fn commits_between(repo: &Repository, exclude: Oid, include: Oid) -> StorageResult<Vec<Oid>> {
    let mut revwalk = repo.revwalk()?;
    revwalk.push(include)?;
    revwalk.hide(exclude)?;
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
    Ok(revwalk.collect::<Result<Vec<_>, _>>()?)
}

/// compare `base...head` the way the hosted compare endpoint does
///
/// commits are those on head since the merge base; files are diffed from the
/// merge base (or `base` when the histories are unrelated) to head
pub fn compare(repo: &Repository, base: &CommitSha, head: &CommitSha) -> StorageResult<Comparison> {
    let base_oid = parse_oid(base.as_str())?;
    let head_oid = parse_oid(head.as_str())?;
    let base_commit = repo
        .find_commit(base_oid)
        .map_err(|_| StorageError::CommitNotFound(base.to_string()))?;
    let head_commit = repo
        .find_commit(head_oid)
        .map_err(|_| StorageError::CommitNotFound(head.to_string()))?;

    let ahead = commits_between(repo, base_oid, head_oid)?;
    let behind = commits_between(repo, head_oid, base_oid)?;

    let from_commit = match repo.merge_base(base_oid, head_oid) {
        Ok(oid) => repo.find_commit(oid)?,
        Err(e) if e.code() == git2::ErrorCode::NotFound => base_commit,
        Err(e) => return Err(StorageError::Git(e)),
    };

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(
        Some(&from_commit.tree()?),
        Some(&head_commit.tree()?),
        Some(&mut opts),
    )?;

    let files = diff
        .deltas()
        .filter_map(|delta| {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())?
                .to_string_lossy()
                .into_owned();
            let status = match delta.status() {
                Delta::Added => FileStatus::Added,
                Delta::Deleted => FileStatus::Removed,
                Delta::Modified => FileStatus::Modified,
                Delta::Renamed => FileStatus::Renamed,
                _ => FileStatus::Other,
            };
            Some(ChangedFile { path, status })
        })
        .collect();

    let commits = ahead
        .iter()
        .map(|oid| -> StorageResult<CommitSummary> {
            let commit = repo.find_commit(*oid)?;
            Ok(CommitSummary::from(&commit_object(&commit)))
        })
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(Comparison {
        ahead_by: ahead.len() as u32,
        behind_by: behind.len() as u32,
        commits,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::TreeMutator;
    use git2::FileMode;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn sha(oid: Oid) -> CommitSha {
        CommitSha::new(oid.to_string())
    }

    /// commit `files` on top of `parent`
    fn commit_files(repo: &Repository, parent: Oid, files: &[(&str, &str)], message: &str) -> Oid {
        let base = repo.find_commit(parent).unwrap().tree().unwrap();
        let mut mutator = TreeMutator::from_tree(repo, base);
        for (path, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            mutator.upsert(path, blob, FileMode::Blob).unwrap();
        }
        let tree = mutator.write().unwrap();
        CommitBuilder::new(repo)
            .tree(tree)
            .parent(parent)
            .message(message)
            .commit()
            .unwrap()
    }

    #[test]
    fn test_initial_commit() {
        let (_dir, repo) = setup_repo();
        let sig = GitSignature::foliosync();

        let commit_id = create_initial_commit(&repo, &sig).unwrap();
        let info = get_commit(&repo, &sha(commit_id)).unwrap();

        assert_eq!(info.summary(), "Initial commit");
        assert!(info.parents.is_empty()); // initial commit has no parents
    }

    #[test]
    fn test_commit_builder() {
        let (_dir, repo) = setup_repo();
        let initial = create_initial_commit(&repo, &GitSignature::foliosync()).unwrap();

        let second = commit_files(&repo, initial, &[("data.json", "{}")], "Second commit");

        let info = get_commit(&repo, &sha(second)).unwrap();
        assert_eq!(info.parents, vec![sha(initial)]);
        assert_eq!(info.summary(), "Second commit");
        assert_eq!(info.author.unwrap().name, "foliosync");
    }

    #[test]
    fn test_builder_requires_tree() {
        let (_dir, repo) = setup_repo();
        let result = CommitBuilder::new(&repo).message("no tree").commit();
        assert!(matches!(result, Err(StorageError::InvalidRequest(_))));
    }

    #[test]
    fn test_compare_linear_history() {
        let (_dir, repo) = setup_repo();
        let c1 = create_initial_commit(&repo, &GitSignature::foliosync()).unwrap();
        let c2 = commit_files(&repo, c1, &[("data.json", "{\"a\":1}")], "Add data");
        let c3 = commit_files(&repo, c2, &[("about.md", "hi")], "Add about");

        let comparison = compare(&repo, &sha(c1), &sha(c3)).unwrap();
        assert_eq!(comparison.ahead_by, 2);
        assert_eq!(comparison.behind_by, 0);
        assert_eq!(comparison.commits[0].message, "Add data");
        assert_eq!(comparison.commits[1].message, "Add about");

        let mut paths: Vec<_> = comparison.files.iter().map(|f| f.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["about.md", "data.json"]);
        assert!(comparison.files.iter().all(|f| f.status == FileStatus::Added));
    }

    #[test]
    fn test_compare_diverged_history() {
        let (_dir, repo) = setup_repo();
        let base = create_initial_commit(&repo, &GitSignature::foliosync()).unwrap();
        let ours = commit_files(&repo, base, &[("data.json", "ours")], "Ours");
        let theirs = commit_files(&repo, base, &[("about.md", "theirs")], "Theirs");

        let comparison = compare(&repo, &sha(ours), &sha(theirs)).unwrap();
        assert_eq!(comparison.ahead_by, 1);
        assert_eq!(comparison.behind_by, 1);
        // diffed from the merge base, so our own change is not listed
        assert_eq!(comparison.files.len(), 1);
        assert_eq!(comparison.files[0].path, "about.md");
    }

    #[test]
    fn test_compare_unknown_commit() {
        let (_dir, repo) = setup_repo();
        let c1 = create_initial_commit(&repo, &GitSignature::foliosync()).unwrap();
        let missing = CommitSha::new("0123456789012345678901234567890123456789");

        let result = compare(&repo, &sha(c1), &missing);
        assert!(matches!(result, Err(StorageError::CommitNotFound(_))));
    }
}
