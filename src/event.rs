use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag between a controller and a receive loop.
///
/// Clones share the same flag. The loop only looks at it between readiness
/// waits, so a set takes effect within one wait timeout.
#[derive(Debug, Clone, Default)]
pub struct StopEvent {
    flag: Arc<AtomicBool>,
}

impl StopEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
