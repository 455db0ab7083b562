//! foliosync - reliable saves of portfolio content to a GitHub repository
//!
//! Edits made in a web editor are persisted as commits on a branch of a
//! hosted repository. This crate turns a batch of file edits into one
//! atomic commit through the low-level git object API, paces every call
//! against the credential's rate limit, and runs the debounced autosave loop
//! that notices when the branch was changed somewhere else.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use foliosync::config::SyncConfig;
//! use foliosync::pipeline::{CommitOptions, CommitPipeline, FileChange};
//! use foliosync::ratelimit::RequestGate;
//! use foliosync::remote::GitHubClient;
//! use foliosync::types::{BranchName, RepoId, RepoTarget};
//!
//! # async fn run() -> foliosync::error::SyncResult<()> {
//! let config = SyncConfig::from_env()?;
//! let client = GitHubClient::new(&config.remote).map_err(|e| foliosync::SyncError::from_remote(e, 0))?;
//! let gate = Arc::new(RequestGate::from_config(&config.retry, config.remote.call_timeout));
//! let pipeline = CommitPipeline::new(Arc::new(client), gate, config.pipeline.clone());
//!
//! let target = RepoTarget::new(RepoId::new("octo", "portfolio"), BranchName::main());
//! let result = pipeline
//!     .create_commit(
//!         &target,
//!         &[FileChange::update("data.json", r#"{"a":1}"#)],
//!         "update data",
//!         &CommitOptions::new(),
//!     )
//!     .await?;
//! println!("committed {}", result.commit_sha);
//! # Ok(())
//! # }
//! ```

pub mod autosave;
pub mod clock;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
pub mod remote;
pub mod storage;
pub mod types;

pub use error::{SyncError, SyncResult};
