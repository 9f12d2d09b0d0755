//! Shared helpers for the stress scenario tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncx::ScenarioConfig;

/// Aborts the test process if dropped too late
///
/// A deadlocked primitive would otherwise hang the whole test run.
pub struct TestTimeoutGuard {
    cancelled: Arc<AtomicBool>,
}

impl Drop for TestTimeoutGuard {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

pub fn test_timeout_guard(duration: Duration) -> TestTimeoutGuard {
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_clone = Arc::clone(&cancelled);
    std::thread::spawn(move || {
        std::thread::sleep(duration);
        if !cancelled_clone.load(Ordering::SeqCst) {
            eprintln!("Test timeout exceeded ({}s). Aborting.", duration.as_secs());
            std::process::abort();
        }
    });
    TestTimeoutGuard { cancelled }
}

/// Small load that still forces callers to overlap
pub fn quick_config() -> ScenarioConfig {
    ScenarioConfig {
        callers: 16,
        keys: 3,
        capacity: 4,
        work: Duration::from_millis(5),
        rounds: 2,
        fail_close_every: 0,
        flaky_dials: false,
    }
}
