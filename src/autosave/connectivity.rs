//! Network reachability as seen by the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Answers "is there a network right now?".
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// A switch flipped by whoever observes the network (the UI shell, a
/// platform callback, a test).
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<AtomicBool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
