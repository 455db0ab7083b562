//! Autosave loop for the portfolio editor.
//!
//! The UI hands every edit to [`AutoSaveScheduler::schedule_save`]. The
//! scheduler debounces, checks the remote for changes made elsewhere, and
//! commits the latest snapshot through the
//! [`CommitPipeline`](crate::pipeline::CommitPipeline). Progress is reported
//! as [`SaveEvent`]s.
//!
//! ```ignore
//! let scheduler = AutoSaveScheduler::new(target, pipeline, detector, network, config)?;
//! scheduler.seed(loaded, tip);
//! scheduler.start_conflict_polling();
//! scheduler.add_listener(|event| println!("{}", event.kind()));
//! scheduler.schedule_save(edited, false);
//! ```

mod conflict;
mod connectivity;
mod events;
mod scheduler;
mod state;

pub use conflict::{ConflictCheck, ConflictDetector, ConflictKind, ConflictRecord, ConflictReport};
pub use connectivity::{Connectivity, NetworkStatus};
pub use events::{EventBus, ListenerId, SaveEvent, SaveFailure};
pub use scheduler::{AutoSaveScheduler, ConflictResolution, SaveStatus};
pub use state::SaveState;
