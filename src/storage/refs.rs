//!  Branch and reference management.
//!
//!  Git refs are pointers to commits. This module handles:
//! - branch resolution
//! - branch creation (backup branches)
//! - compare-and-swap style branch moves that refuse to discard history

use git2::{Oid, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::types::BranchName;

/// Manages Git references (branches).
pub struct RefManager;

impl RefManager {
    /// Resolve a branch name to its current commit ID.
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> StorageResult<Oid> {
        let reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        let commit = reference
            .peel_to_commit()
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        Ok(commit.id())
    }

    /// Check if a branch exists.
    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    /// Create a new branch pointing to the given commit.
    pub fn create_branch(repo: &Repository, branch: &BranchName, target: Oid) -> StorageResult<()> {
        if Self::branch_exists(repo, branch) {
            return Err(StorageError::BranchAlreadyExists(branch.to_string()));
        }

        let commit = repo
            .find_commit(target)
            .map_err(|_| StorageError::CommitNotFound(target.to_string()))?;
        repo.branch(branch.as_str(), &commit, false)?;

        Ok(())
    }

    /// Move a branch to `target`.
    ///
    /// Without `force` the move must be a fast-forward: `target` has to be
    /// the current tip or one of its descendants.
    pub fn update_branch(
        repo: &Repository,
        branch: &BranchName,
        target: Oid,
        force: bool,
    ) -> StorageResult<()> {
        let mut reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;
        let current = reference
            .peel_to_commit()
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?
            .id();

        repo.find_commit(target)
            .map_err(|_| StorageError::CommitNotFound(target.to_string()))?;

        if !force && current != target && !repo.graph_descendant_of(target, current)? {
            return Err(StorageError::NotFastForward {
                branch: branch.to_string(),
                current: current.to_string(),
                proposed: target.to_string(),
            });
        }

        reference.set_target(target, &format!("update branch to {}", target))?;

        Ok(())
    }

    /// Initialize a branch if it doesn't exist and point HEAD at it.
    ///
    /// This should be called after creating the initial commit.
    pub fn init_branch(repo: &Repository, branch: &BranchName, initial_commit: Oid) -> StorageResult<()> {
        if !Self::branch_exists(repo, branch) {
            Self::create_branch(repo, branch, initial_commit)?;
        }

        repo.set_head(&branch.as_ref_path())?;

        Ok(())
    }
}
