//! Cooperative cancellation for capture, processing and supervision threads.
//!
//! A `CancelToken` replaces the polled `running` flag: every clone observes the same
//! state, and `sleep` wakes up immediately when the token is cancelled so that retry
//! and rate-limit delays never hold up `stop()`.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
    wake: Receiver<()>,
}

struct Shared {
    cancelled: AtomicBool,
    // Never sent on. Dropping it disconnects every `wake` receiver at once.
    trigger: Mutex<Option<Sender<()>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, wake) = bounded(0);
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
            }),
            wake,
        }
    }

    /// Cancel the token. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns `true` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        if duration.is_zero() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

/// Wait for `handle` up to `timeout`; detach it if it is still running.
///
/// A detached thread is not waited on again. It exits at its next cancellation check.
pub fn join_within<T>(handle: JoinHandle<T>, timeout: Duration, what: &str) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{}: did not stop within {:?}, detaching", what, timeout);
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            log::error!("{}: thread panicked", what);
            None
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_runs_full_duration_when_not_cancelled() {
        let token = CancelToken::new();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn cancel_wakes_sleeping_clone() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = sleeper.sleep(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.sleep(Duration::from_secs(1)));
    }

    #[test]
    fn join_within_detaches_slow_threads() {
        let done = std::thread::spawn(|| 7);
        assert_eq!(join_within(done, Duration::from_secs(5), "quick"), Some(7));

        let token = CancelToken::new();
        let sleeper = token.clone();
        let slow = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        let started = Instant::now();
        assert_eq!(join_within(slow, Duration::from_millis(50), "slow"), None);
        assert!(started.elapsed() < Duration::from_secs(5));
        token.cancel();
    }
}
