//!  Blob operations.
//!
//! File content is stored verbatim as git blobs. Object ids cross the API
//! boundary as hex strings and are parsed back into `git2::Oid` here.

use git2::{Oid, Repository};

use crate::remote::BlobContent;
use crate::storage::error::{StorageError, StorageResult};
use crate::types::BlobSha;

/// parse a hex object id received through the API
pub(crate) fn parse_oid(sha: &str) -> StorageResult<Oid> {
    Oid::from_str(sha).map_err(|_| StorageError::InvalidRequest(format!("invalid object id '{}'", sha)))
}

/// write raw bytes as a blob
///
/// returns the blob ID (SHA-1 hash of the content)
pub fn write_blob(repo: &Repository, content: &[u8]) -> StorageResult<BlobSha> {
    let oid = repo.blob(content)?;
    Ok(BlobSha::new(oid.to_string()))
}

/// read a blob's content from the repository
pub fn read_blob(repo: &Repository, sha: &BlobSha) -> StorageResult<BlobContent> {
    let blob = repo
        .find_blob(parse_oid(sha.as_str())?)
        .map_err(|_| StorageError::ObjectNotFound(sha.to_string()))?;

    Ok(BlobContent {
        sha: sha.clone(),
        content: blob.content().to_vec(),
    })
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

    #[test]
    fn test_blob_ids_are_content_addressed() {
        let (_dir, repo) = setup_repo();

        let a = write_blob(&repo, b"{\"a\":1}").unwrap();
        let b = write_blob(&repo, b"{\"a\":1}").unwrap();
        assert_eq!(a, b);

        // git's well-known id for empty content
        let empty = write_blob(&repo, b"").unwrap();
        assert_eq!(empty.as_str(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_read_back_binary_content() {
        let (_dir, repo) = setup_repo();
        let bytes = [0u8, 159, 146, 150, 255];

        let sha = write_blob(&repo, &bytes).unwrap();
        let blob = read_blob(&repo, &sha).unwrap();
        assert_eq!(blob.content, bytes);
    }

    #[test]
    fn test_missing_and_malformed_ids() {
        let (_dir, repo) = setup_repo();

        let missing = BlobSha::new("0123456789012345678901234567890123456789");
        assert!(matches!(read_blob(&repo, &missing), Err(StorageError::ObjectNotFound(_))));

        let malformed = BlobSha::new("not-hex");
        assert!(matches!(read_blob(&repo, &malformed), Err(StorageError::InvalidRequest(_))));
    }
}
