//! Bounded retry with exponential backoff.
//!
//! A [`RetryPolicy`] wraps one fallible call. Whether a failure is retried is
//! decided by a classifier (by default the error's own
//! [`ErrorClassification`]); permanent failures abort without consuming the
//! remaining attempts. Backoff sleeps go through a [`CancelToken`] so a run
//! deadline interrupts them.

use super::cancel::CancelToken;
use super::provider::{ErrorClassification, ProviderError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Abort,
}

/// Terminal failure of a retried call.
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("aborted without retry: {0}")]
    Aborted(E),

    #[error("cancelled during retry")]
    Cancelled { last: Option<E> },
}

impl<E: std::fmt::Display> RetryError<E> {
    /// The underlying cause, if the call ran at least once.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Aborted(last) => Some(last),
            RetryError::Cancelled { last } => last,
        }
    }
}

impl From<RetryError<ProviderError>> for ProviderError {
    fn from(e: RetryError<ProviderError>) -> Self {
        e.into_last().unwrap_or(ProviderError::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the zero-based `attempt`: `min(base * factor^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }

    /// Retry transient failures as classified by the error itself.
    pub fn run<T, E, F>(&self, cancel: &CancelToken, op: F) -> Result<T, RetryError<E>>
    where
        E: ErrorClassification + std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with(
            cancel,
            |e: &E| {
                if e.is_transient() {
                    RetryDecision::Retry
                } else {
                    RetryDecision::Abort
                }
            },
            op,
        )
    }

    /// Retry with a caller-supplied classifier. `op` receives the zero-based
    /// attempt number.
    pub fn run_with<T, E, F, C>(
        &self,
        cancel: &CancelToken,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> RetryDecision,
    {
        let attempts = self.max_retries.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { last });
            }
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if classify(&e) == RetryDecision::Abort {
                        return Err(RetryError::Aborted(e));
                    }
                    if attempt + 1 < attempts {
                        let delay = self.delay_for(attempt);
                        debug!(attempt = attempt + 1, ?delay, error = %e, "retrying");
                        if !cancel.sleep(delay) {
                            return Err(RetryError::Cancelled { last: Some(e) });
                        }
                    }
                    last = Some(e);
                }
            }
        }
        match last {
            Some(last) => Err(RetryError::Exhausted { attempts, last }),
            None => Err(RetryError::Cancelled { last: None }),
        }
    }
}
