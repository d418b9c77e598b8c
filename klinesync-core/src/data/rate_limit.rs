//! Process-wide request spacing for HTTP providers.
//!
//! One [`RequestLimiter`] is constructed per upstream and shared by every
//! worker, so the configured spacing holds across the whole pool.

use super::cancel::CancelToken;
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::time::Duration;
use tracing::trace;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct RequestLimiter {
    limiter: Option<Limiter>,
    clock: DefaultClock,
}

impl RequestLimiter {
    /// At most one request per `interval`. A zero interval disables limiting.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            limiter: Quota::with_period(interval).map(RateLimiter::direct),
            clock: DefaultClock::default(),
        }
    }

    pub fn unlimited() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    /// Block until a request may be sent. Returns `false` if cancelled while
    /// waiting.
    pub fn acquire(&self, cancel: &CancelToken) -> bool {
        let Some(limiter) = &self.limiter else {
            return !cancel.is_cancelled();
        };
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match limiter.check() {
                Ok(()) => return true,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    trace!(?wait, "rate limited");
                    if !cancel.sleep(wait) {
                        return false;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}
