//! Connectivity capability queried from the host.

use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the host currently reports network connectivity.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// A flag the host flips on online/offline signals. Starts online.
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
