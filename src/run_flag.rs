//! Process-scoped stop flag.
//!
//! Signal handlers flip it once; every crawler loop re-checks it at
//! iteration boundaries and drains gracefully. Cheap to clone, backed
//! by an atomic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared run flag. `should_run()` stays true until `stop()` is called.
#[derive(Clone)]
pub struct RunFlag {
    inner: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn should_run(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.inner.store(false, Ordering::Relaxed);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        let flag = RunFlag::new();
        assert!(flag.should_run());
    }

    #[test]
    fn test_stop_is_visible_to_clones() {
        let flag = RunFlag::new();
        let observer = flag.clone();
        flag.stop();
        assert!(!observer.should_run());
    }
}
