//!  Tree operations.
//!
//! in Git, a tree is a directory. Edits arrive as flat repo-relative paths
//! (`content/posts/a.md`) and have to be applied to every tree on the way
//! down, then written back bottom-up. This module hides that from the rest
//! of the backend.

use std::collections::BTreeMap;
use std::path::Path;

use git2::{FileMode, ObjectType, Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};

use crate::remote::{EntryKind, TreeEntry, TreeListing};
use crate::storage::error::{StorageError, StorageResult};
use crate::types::TreeSha;

/// pending edit for one path: `None` removes it
type Edit = Option<(Oid, i32)>;

/// a mutable tree builder for making changes
///
/// this adds up changes and produces a new tree when its final
/// the original tree is not modified
///
/// # Usage Pattern
///
/// ```ignore
/// let mut mutator = TreeMutator::from_tree(repo, base);
/// mutator.upsert("content/about.md", blob_oid, FileMode::Blob)?;
/// mutator.delete("old/draft.md")?;
/// let new_tree = mutator.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    base: Option<Tree<'repo>>,
    edits: BTreeMap<String, Edit>,
}

impl<'repo> TreeMutator<'repo> {
    /// create a new TreeMutator on top of an existing tree
    pub fn from_tree(repo: &'repo Repository, tree: Tree<'repo>) -> Self {
        Self {
            repo,
            base: Some(tree),
            edits: BTreeMap::new(),
        }
    }

    /// create a new TreeMutator for an empty tree
    pub fn empty(repo: &'repo Repository) -> Self {
        Self {
            repo,
            base: None,
            edits: BTreeMap::new(),
        }
    }

    /// point `path` at a blob, creating intermediate directories
    pub fn upsert(&mut self, path: &str, blob: Oid, mode: FileMode) -> StorageResult<()> {
        check_path(path)?;
        self.edits.insert(path.to_string(), Some((blob, mode.into())));
        Ok(())
    }

    /// remove `path`; writing fails if it does not exist
    pub fn delete(&mut self, path: &str) -> StorageResult<()> {
        check_path(path)?;
        self.edits.insert(path.to_string(), None);
        Ok(())
    }

    /// write all changes and return the new root tree ID
    ///
    /// directories left empty by deletions are dropped, like git does
    pub fn write(self) -> StorageResult<Oid> {
        let edits = self
            .edits
            .iter()
            .map(|(path, edit)| (path.split('/').collect::<Vec<_>>(), *edit))
            .collect();

        match rebuild(self.repo, self.base.as_ref(), edits, "")? {
            Some(oid) => Ok(oid),
            None => Ok(self.repo.treebuilder(None)?.write()?),
        }
    }
}

fn check_path(path: &str) -> StorageResult<()> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s.is_empty()) {
        return Err(StorageError::InvalidRequest(format!("invalid tree path '{}'", path)));
    }
    Ok(())
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// apply `edits` (paths split into segments) to `base`
///
/// returns `None` when the resulting tree is empty
fn rebuild(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    edits: Vec<(Vec<&str>, Edit)>,
    prefix: &str,
) -> StorageResult<Option<Oid>> {
    let mut builder = repo.treebuilder(base)?;
    let mut nested: BTreeMap<&str, Vec<(Vec<&str>, Edit)>> = BTreeMap::new();

    for (segments, edit) in edits {
        match segments.split_first() {
            Some((name, [])) => match edit {
                Some((oid, mode)) => {
                    builder.insert(*name, oid, mode)?;
                }
                None => {
                    if builder.get(*name)?.is_none() {
                        return Err(StorageError::PathNotFound(join(prefix, name)));
                    }
                    builder.remove(*name)?;
                }
            },
            Some((dir, rest)) => nested.entry(*dir).or_default().push((rest.to_vec(), edit)),
            None => return Err(StorageError::InvalidRequest("empty tree path".to_string())),
        }
    }

    for (dir, sub_edits) in nested {
        let path = join(prefix, dir);
        let subtree = match builder.get(dir)? {
            Some(entry) if entry.kind() == Some(ObjectType::Tree) => Some(repo.find_tree(entry.id())?),
            Some(entry) => {
                return Err(StorageError::UnexpectedEntryType {
                    path,
                    expected: "tree (directory)".to_string(),
                    found: format!("{:?}", entry.kind()),
                })
            }
            None => None,
        };

        match rebuild(repo, subtree.as_ref(), sub_edits, &path)? {
            Some(oid) => {
                builder.insert(dir, oid, FileMode::Tree.into())?;
            }
            None => {
                if builder.get(dir)?.is_some() {
                    builder.remove(dir)?;
                }
            }
        }
    }

    if builder.len() == 0 {
        Ok(None)
    } else {
        Ok(Some(builder.write()?))
    }
}

/// helper function to create an initial empty tree
pub fn create_initial_tree(repo: &Repository) -> StorageResult<Oid> {
    TreeMutator::empty(repo).write()
}

/// list a tree, optionally descending into subtrees
///
/// recursive listings include the directory entries themselves, as the
/// hosted API does
pub fn list_tree(repo: &Repository, sha: &TreeSha, recursive: bool) -> StorageResult<TreeListing> {
    let oid = crate::storage::blob::parse_oid(sha.as_str())?;
    let tree = repo
        .find_tree(oid)
        .map_err(|_| StorageError::ObjectNotFound(sha.to_string()))?;

    let mut entries = Vec::new();
    if recursive {
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if let Some(name) = entry.name() {
                entries.push(to_entry(format!("{}{}", root, name), entry));
            }
            TreeWalkResult::Ok
        })?;
    } else {
        for entry in tree.iter() {
            if let Some(name) = entry.name() {
                entries.push(to_entry(name.to_string(), &entry));
            }
        }
    }

    Ok(TreeListing {
        sha: sha.clone(),
        entries,
        truncated: false,
    })
}

fn to_entry(path: String, entry: &git2::TreeEntry<'_>) -> TreeEntry {
    let kind = match entry.kind() {
        Some(ObjectType::Tree) => EntryKind::Tree,
        Some(ObjectType::Commit) => EntryKind::Commit,
        _ => EntryKind::Blob,
    };
    TreeEntry {
        path,
        mode: format!("{:06o}", entry.filemode()),
        kind,
        sha: entry.id().to_string(),
    }
}

/// find the blob at `path`, if any
pub fn blob_at_path(tree: &Tree<'_>, path: &str) -> Option<Oid> {
    let entry = tree.get_path(Path::new(path)).ok()?;
    match entry.kind() {
        Some(ObjectType::Blob) => Some(entry.id()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn paths(repo: &Repository, oid: Oid) -> Vec<String> {
        list_tree(repo, &TreeSha::new(oid.to_string()), true)
            .unwrap()
            .entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::Blob)
            .map(|e| e.path)
            .collect()
    }

    #[test]
    fn test_nested_upsert() {
        let (_dir, repo) = setup_repo();
        let blob = repo.blob(b"hello").unwrap();

        let mut mutator = TreeMutator::empty(&repo);
        mutator.upsert("data.json", blob, FileMode::Blob).unwrap();
        mutator.upsert("content/posts/first.md", blob, FileMode::Blob).unwrap();
        let oid = mutator.write().unwrap();

        let tree = repo.find_tree(oid).unwrap();
        assert_eq!(blob_at_path(&tree, "content/posts/first.md"), Some(blob));
        assert_eq!(paths(&repo, oid), vec!["content/posts/first.md", "data.json"]);
    }

    #[test]
    fn test_edits_keep_untouched_siblings() {
        let (_dir, repo) = setup_repo();
        let a = repo.blob(b"a").unwrap();
        let b = repo.blob(b"b").unwrap();

        let mut mutator = TreeMutator::empty(&repo);
        mutator.upsert("content/a.md", a, FileMode::Blob).unwrap();
        mutator.upsert("content/b.md", a, FileMode::Blob).unwrap();
        let base = repo.find_tree(mutator.write().unwrap()).unwrap();

        let mut mutator = TreeMutator::from_tree(&repo, base);
        mutator.upsert("content/b.md", b, FileMode::Blob).unwrap();
        let tree = repo.find_tree(mutator.write().unwrap()).unwrap();

        assert_eq!(blob_at_path(&tree, "content/a.md"), Some(a));
        assert_eq!(blob_at_path(&tree, "content/b.md"), Some(b));
    }

    #[test]
    fn test_delete_prunes_empty_directories() {
        let (_dir, repo) = setup_repo();
        let blob = repo.blob(b"x").unwrap();

        let mut mutator = TreeMutator::empty(&repo);
        mutator.upsert("keep.md", blob, FileMode::Blob).unwrap();
        mutator.upsert("drafts/only.md", blob, FileMode::Blob).unwrap();
        let base = repo.find_tree(mutator.write().unwrap()).unwrap();

        let mut mutator = TreeMutator::from_tree(&repo, base);
        mutator.delete("drafts/only.md").unwrap();
        let tree = repo.find_tree(mutator.write().unwrap()).unwrap();

        assert!(tree.get_name("drafts").is_none());
        assert!(tree.get_name("keep.md").is_some());
    }

    #[test]
    fn test_delete_missing_path_fails() {
        let (_dir, repo) = setup_repo();
        let base = repo.find_tree(create_initial_tree(&repo).unwrap()).unwrap();

        let mut mutator = TreeMutator::from_tree(&repo, base);
        mutator.delete("nope/missing.md").unwrap();
        assert!(matches!(mutator.write(), Err(StorageError::PathNotFound(_))));
    }

    #[test]
    fn test_file_in_place_of_directory() {
        let (_dir, repo) = setup_repo();
        let blob = repo.blob(b"x").unwrap();

        let mut mutator = TreeMutator::empty(&repo);
        mutator.upsert("content", blob, FileMode::Blob).unwrap();
        let base = repo.find_tree(mutator.write().unwrap()).unwrap();

        let mut mutator = TreeMutator::from_tree(&repo, base);
        mutator.upsert("content/a.md", blob, FileMode::Blob).unwrap();
        assert!(matches!(
            mutator.write(),
            Err(StorageError::UnexpectedEntryType { .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_paths() {
        let (_dir, repo) = setup_repo();
        let blob = repo.blob(b"x").unwrap();
        let mut mutator = TreeMutator::empty(&repo);

        assert!(mutator.upsert("", blob, FileMode::Blob).is_err());
        assert!(mutator.upsert("/abs", blob, FileMode::Blob).is_err());
        assert!(mutator.upsert("a//b", blob, FileMode::Blob).is_err());
    }

    #[test]
    fn test_flat_listing() {
        let (_dir, repo) = setup_repo();
        let blob = repo.blob(b"x").unwrap();

        let mut mutator = TreeMutator::empty(&repo);
        mutator.upsert("a/b.md", blob, FileMode::Blob).unwrap();
        mutator.upsert("c.md", blob, FileMode::Blob).unwrap();
        let oid = mutator.write().unwrap();

        let listing = list_tree(&repo, &TreeSha::new(oid.to_string()), false).unwrap();
        assert_eq!(listing.entries.len(), 2);
        let dir = listing.entries.iter().find(|e| e.path == "a").unwrap();
        assert_eq!(dir.kind, EntryKind::Tree);
        assert_eq!(dir.mode, "040000");
    }
}
