//! Test assertion helpers.
//!
//! Polling assertions for state changed by background threads (the log
//! server, live-restore migration, the checkpoint server).

use std::{
    thread,
    time::{Duration, Instant},
};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Returns `true` if the condition held before the timeout.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
/// use std::time::Duration;
/// use cellar_test_utils::assert_eventually;
///
/// let flag = Arc::new(AtomicBool::new(false));
/// let setter = flag.clone();
/// std::thread::spawn(move || {
///     std::thread::sleep(Duration::from_millis(20));
///     setter.store(true, Ordering::SeqCst);
/// });
///
/// assert!(assert_eventually(Duration::from_secs(2), || flag.load(Ordering::SeqCst)));
/// ```
pub fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(DEFAULT_POLL_INTERVAL);
    }

    // Final check after timeout
    condition()
}
