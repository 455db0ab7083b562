//! Save states and the transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the scheduler is in its save cycle.
///
/// ```text
/// Idle -> Pending -> Saving -> Saved -> Idle
///                      |-> Retrying(n) -> Saving
///                      |-> Conflict
///                      '-> Error
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "attempt", rename_all = "lowercase")]
pub enum SaveState {
    #[default]
    Idle,
    /// an edit is waiting for the debounce timer
    Pending,
    Saving,
    /// the last cycle failed transiently; another is scheduled
    Retrying(u32),
    /// the remote branch moved; waiting for a resolution
    Conflict,
    /// the last save failed and will not be retried without a trigger
    Error,
    Saved,
}

impl SaveState {
    pub fn name(&self) -> &'static str {
        match self {
            SaveState::Idle => "idle",
            SaveState::Pending => "pending",
            SaveState::Saving => "saving",
            SaveState::Retrying(_) => "retrying",
            SaveState::Conflict => "conflict",
            SaveState::Error => "error",
            SaveState::Saved => "saved",
        }
    }

    /// A save cycle is running or about to run again on its own.
    pub fn is_busy(&self) -> bool {
        matches!(self, SaveState::Saving | SaveState::Retrying(_))
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SaveState) -> bool {
        use SaveState::*;

        match (*self, next) {
            (Idle, Pending | Conflict) => true,
            (Pending, Pending | Saving | Idle | Conflict) => true,
            (Saving, Saved | Retrying(_) | Conflict | Error | Idle) => true,
            (Retrying(_), Saving | Idle | Conflict) => true,
            (Saved, Idle | Pending) => true,
            (Conflict, Pending | Idle) => true,
            (Error, Pending | Idle | Conflict) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveState::Retrying(attempt) => write!(f, "retrying({})", attempt),
            other => f.write_str(other.name()),
        }
    }
}
