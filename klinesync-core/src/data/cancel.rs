//! Shared cancellation token.
//!
//! Cancelling wakes every thread parked in [`CancelToken::sleep`], so retry
//! backoff and rate-limit waits end as soon as a run deadline passes.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every clone of this token and wake all sleepers.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|p| p.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    /// Clear the flag for every clone, so a long-lived owner can start a
    /// new run after a cancelled one.
    pub fn reset(&self) {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` if the
    /// token was cancelled before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|p| p.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
        false
    }
}
