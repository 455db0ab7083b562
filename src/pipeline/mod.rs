//! Atomic multi-file commits.
//!
//! ```ignore
//! use foliosync::pipeline::{CommitOptions, CommitPipeline, FileChange};
//!
//! let pipeline = CommitPipeline::new(api, gate, PipelineConfig::default());
//! let result = pipeline
//!     .create_commit(&target, &[FileChange::update("data.json", json)], "update data", &CommitOptions::new())
//!     .await?;
//! ```

mod change;
mod commit;

pub use change::{
    validate_batch, ChangeOperation, FileChange, InvalidChange, RepoPath, ValidationError,
    MAX_PATH_BYTES,
};
pub use commit::{backup_branch_name, BranchTip, CommitOptions, CommitPipeline, CommitResult};
