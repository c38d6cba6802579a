#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing event loops.

use std::fmt;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long [`with_watchdog()`] lets a test run.
///
/// Miri is dramatically slower for thread synchronization, so it gets a longer timeout to avoid
/// false positives while still catching real hangs.
#[must_use]
pub fn default_watchdog_timeout() -> Duration {
    if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    }
}

/// Runs a test with a timeout to prevent infinite hangs.
///
/// If the test takes longer than [`default_watchdog_timeout()`], this panics instead of letting
/// the CI run hang on a loop that never terminates.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly. This allows mutation testing to properly detect
/// hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode), and re-raises
/// any panic of the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    with_watchdog_timeout(default_watchdog_timeout(), test_fn)
}

/// Like [`with_watchdog()`] but with an explicit timeout, for tests that legitimately run long
/// (e.g. periodic tasks with real delays).
///
/// # Panics
///
/// Panics if the test exceeds `timeout` (when not in mutation testing mode), and re-raises any
/// panic of the test itself.
pub fn with_watchdog_timeout<F, R>(timeout: Duration, test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has timed out and nobody cares anymore.
        drop(tx.send(result));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Polls `condition` until it returns `true` or `timeout` elapses.
///
/// Returns the last result of `condition`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now().checked_add(timeout);

    loop {
        if condition() {
            return true;
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return condition();
        }

        thread::sleep(Duration::from_millis(1));
    }
}

/// A thread-safe, cloneable log of entries in the order they were recorded.
///
/// Used to assert the order in which callbacks, tasks and continuations ran, possibly on other
/// threads.
///
/// # Example
///
/// ```rust
/// use testing::CallLog;
///
/// let log = CallLog::new();
/// let recorder = log.clone();
///
/// std::thread::spawn(move || recorder.record("from thread"))
///     .join()
///     .unwrap();
/// log.record("from main");
///
/// assert_eq!(log.entries(), vec!["from thread", "from main"]);
/// ```
pub struct CallLog<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T> CallLog<T> {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Appends an entry.
    pub fn record(&self, entry: T) {
        self.entries.lock().push(entry);
    }

    /// Number of entries recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> CallLog<T> {
    /// A snapshot of the entries recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<T> {
        self.entries.lock().clone()
    }
}

impl<T> Clone for CallLog<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for CallLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for CallLog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallLog")
            .field("entries", &*self.entries.lock())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    #[should_panic]
    fn watchdog_propagates_test_panic() {
        with_watchdog(|| panic!("inner failure"));
    }

    #[test]
    fn wait_until_sees_condition() {
        let calls = AtomicUsize::new(0);

        assert!(wait_until(Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::Relaxed) >= 3
        }));
    }

    #[test]
    fn wait_until_gives_up() {
        assert!(!wait_until(Duration::from_millis(5), || false));
    }

    #[test]
    fn call_log_keeps_order() {
        let log = CallLog::new();

        for index in 0..4 {
            log.clone().record(index);
        }

        assert_eq!(log.len(), 4);
        assert_eq!(log.entries(), vec![0, 1, 2, 3]);
    }
}
