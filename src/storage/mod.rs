//! local object store backend
//!
//! this module serves the remote object API from a git repository on disk.
//! The commit pipeline never knows which backend it talks to; tests and the
//! CLI's `--local` mode plug [`LocalRemote`] in where a hosted client would go.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LocalRemote                            │
//! │        (GitDataApi: refs, commits, trees, blobs, compare)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │    blob     │       │    refs     │
//!  │ (path edits)│       │ (contents)  │       │ (branches)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │                     │                     │
//!         └─────────────────────┼─────────────────────┘
//!                               │
//!                               ▼
//!                        ┌─────────────┐
//!                        │   commit    │
//!                        │  (history)  │
//!                        └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use foliosync::storage::LocalRemote;
//! use foliosync::types::BranchName;
//!
//! let remote = LocalRemote::open_or_init("./portfolio", &BranchName::main())?;
//! let tip = remote.tip(&BranchName::main())?;
//! ```

mod blob;
mod commit;
mod error;
mod refs;
mod repository;
mod tree;

pub use error::{StorageError, StorageResult};
pub use repository::LocalRemote;
