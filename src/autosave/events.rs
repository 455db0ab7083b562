//! Scheduler notifications.
//!
//! Events go out two ways: a broadcast channel for async subscribers, and
//! plain callbacks for UI glue. Callbacks run one after another on the
//! emitting task; a callback that panics is logged and skipped, the rest
//! still see the event.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::error;

use crate::autosave::conflict::ConflictReport;
use crate::autosave::state::SaveState;
use crate::error::SyncError;
use crate::pipeline::CommitResult;

const CHANNEL_CAPACITY: usize = 64;

/// Why the last save failed, in a form the UI can show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveFailure {
    pub reason: String,
    pub retryable: bool,
    pub offline: bool,
    pub requires_reauth: bool,
    pub attempts: Option<u32>,
}

impl From<&SyncError> for SaveFailure {
    fn from(error: &SyncError) -> Self {
        Self {
            reason: error.user_reason(),
            retryable: error.is_retryable(),
            offline: error.is_offline(),
            requires_reauth: error.requires_reauth(),
            attempts: error.attempts(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SaveEvent {
    StatusChange { from: SaveState, to: SaveState },
    Save(CommitResult),
    Conflict(ConflictReport),
    Error(SaveFailure),
}

impl SaveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SaveEvent::StatusChange { .. } => "statusChange",
            SaveEvent::Save(_) => "save",
            SaveEvent::Conflict(_) => "conflict",
            SaveEvent::Error(_) => "error",
        }
    }
}

/// Handle for removing a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SaveEvent) + Send + Sync>;

pub struct EventBus {
    sender: broadcast::Sender<SaveEvent>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// A receiver for every event emitted from now on.
    ///
    /// Slow receivers lose the oldest events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.sender.subscribe()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SaveEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: SaveEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event.clone());

        // snapshot so a callback may add or remove listeners
        let listeners: Vec<(ListenerId, Listener)> = self.listeners.lock().clone();
        for (id, listener) in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                error!(
                    listener = id.0,
                    event = event.kind(),
                    panic = %panic_message(payload.as_ref()),
                    "event listener panicked"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn status(to: SaveState) -> SaveEvent {
        SaveEvent::StatusChange {
            from: SaveState::Idle,
            to,
        }
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.add_listener(|_| panic!("listener bug"));
        let counter = seen.clone();
        bus.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(status(SaveState::Pending));
        bus.emit(status(SaveState::Saving));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_listener() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(status(SaveState::Pending));
        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        bus.emit(status(SaveState::Saving));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(status(SaveState::Pending));
        bus.emit(SaveEvent::Error(SaveFailure::from(&SyncError::Offline)));

        assert_eq!(rx.recv().await.unwrap().kind(), "statusChange");
        match rx.recv().await.unwrap() {
            SaveEvent::Error(failure) => {
                assert!(failure.offline);
                assert!(!failure.retryable);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(status(SaveState::Pending));
    }
}
