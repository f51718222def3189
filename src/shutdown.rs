use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::sync::lock;

#[derive(Debug, Default)]
struct Signal {
    requested: AtomicBool,
    gate: Mutex<()>,
    wake: Condvar,
}

/// Cloneable trigger for the server's ordered shutdown.
///
/// Safe to fire from a signal handler thread; [`ShutdownHandle::wait`] returns on
/// every clone once any of them has been fired.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    signal: Arc<Signal>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let _gate = lock(&self.signal.gate);
        self.signal.requested.store(true, Ordering::SeqCst);
        self.signal.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.signal.requested.load(Ordering::SeqCst)
    }

    pub fn wait(&self) {
        let mut gate = lock(&self.signal.gate);
        while !self.is_requested() {
            gate = self
                .signal
                .wake
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Waits up to `timeout`; returns whether shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let gate = lock(&self.signal.gate);
        let _ = self
            .signal
            .wake
            .wait_timeout_while(gate, timeout, |_| !self.is_requested())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.is_requested()
    }
}
