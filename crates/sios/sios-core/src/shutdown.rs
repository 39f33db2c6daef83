use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared by the pumps, the OSC server
/// threads and any module-private loops. Every loop checks it at the
/// top of each iteration; nothing is preempted.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    halted: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// The raw flag, for wiring into signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.halted.clone()
    }
}
