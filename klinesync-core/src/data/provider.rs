//! Provider trait, tagged fetch outcome and structured error types.
//!
//! Every upstream (TDX socket, Eastmoney HTTP, session gateway) implements
//! [`BarProvider`]. Soft failures are explicit: callers branch on
//! [`Outcome`] instead of catching errors.

use crate::domain::{BarRecord, FetchWindow, SymbolDescriptor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// How a failure should be handled by retry and fallback logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network hiccup, timeout, throttling: retry with backoff.
    Transient,
    /// Malformed response, rejected request: do not retry.
    Permanent,
    /// Socket byte stream lost framing: drop the connection, do not retry on it.
    Desync,
    /// Login session gone: re-establish it, then retry.
    SessionExpired,
}

/// Errors that can classify themselves for retry decisions.
pub trait ErrorClassification {
    fn category(&self) -> ErrorCategory;

    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::SessionExpired
        )
    }

    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Structured provider failure.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("response format changed: {0}")]
    ResponseFormat(String),

    #[error("protocol desync: {0}")]
    Desync(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("login rejected: {0}")]
    Login(String),

    #[error("upstream error {code}: {message}")]
    Upstream { code: String, message: String },

    #[error("hard stop: circuit breaker open for another {remaining_secs}s")]
    CircuitOpen { remaining_secs: u64 },

    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("cancelled")]
    Cancelled,
}

impl ErrorClassification for ProviderError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Network(_)
            | ProviderError::Timeout(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Upstream { .. } => ErrorCategory::Transient,
            ProviderError::Http { status, .. } if *status >= 500 => ErrorCategory::Transient,
            ProviderError::Desync(_) => ErrorCategory::Desync,
            ProviderError::SessionExpired(_) => ErrorCategory::SessionExpired,
            ProviderError::Http { .. }
            | ProviderError::ResponseFormat(_)
            | ProviderError::Login(_)
            | ProviderError::CircuitOpen { .. }
            | ProviderError::NotConfigured(_)
            | ProviderError::Cancelled => ErrorCategory::Permanent,
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ProviderError::Timeout(e.to_string()),
            _ => ProviderError::Network(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProviderError::ResponseFormat(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Result of one provider call.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Non-empty data.
    Data(T),
    /// Valid response with nothing in it. Not an error.
    Empty,
    /// Connection, protocol or format failure.
    Failed(ProviderError),
}

impl<T> Outcome<T> {
    pub fn is_data(&self) -> bool {
        matches!(self, Outcome::Data(_))
    }

    /// Short tag for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Data(_) => "data",
            Outcome::Empty => "empty",
            Outcome::Failed(_) => "failed",
        }
    }
}

impl<T> Outcome<Vec<T>> {
    /// Tag a successful call by whether it carried rows.
    pub fn from_rows(rows: Vec<T>) -> Self {
        if rows.is_empty() {
            Outcome::Empty
        } else {
            Outcome::Data(rows)
        }
    }

    /// Tag a call result; `Ok` with no rows is `Empty`.
    pub fn from_result(result: Result<Vec<T>, ProviderError>) -> Self {
        match result {
            Ok(rows) => Self::from_rows(rows),
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Request counters kept by every adapter.
#[derive(Debug, Default)]
pub struct ProviderStats {
    requests: AtomicU64,
    failures: AtomicU64,
    latency_micros: AtomicU64,
}

impl ProviderStats {
    pub fn record(&self, elapsed: Duration, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Copy the counters out under `provider`'s name.
    pub fn snapshot(&self, provider: &str) -> ProviderStatsSnapshot {
        ProviderStatsSnapshot {
            provider: provider.to_string(),
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatsSnapshot {
    pub provider: String,
    pub requests: u64,
    pub failures: u64,
    pub total_latency: Duration,
}

impl ProviderStatsSnapshot {
    /// Average latency per request, zero before the first request.
    pub fn mean_latency(&self) -> Duration {
        if self.requests == 0 {
            return Duration::ZERO;
        }
        let micros = self.total_latency.as_micros() / u128::from(self.requests);
        Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }
}

/// A single upstream source of symbol lists and daily bars.
///
/// Implementations own their connection lifecycle and classify their own
/// failures. `list_symbols` is allowed to fail soft: adapters map errors to
/// `Failed` and log, they never panic.
pub trait BarProvider: Send + Sync {
    /// Short stable name used in config and logs.
    fn name(&self) -> &str;

    /// Current A-share universe.
    fn list_symbols(&self) -> Outcome<Vec<SymbolDescriptor>>;

    /// Daily bars for one symbol inside `window` (inclusive).
    fn fetch_bars(&self, symbol: &SymbolDescriptor, window: &FetchWindow)
        -> Outcome<Vec<BarRecord>>;

    /// Drop and later re-create every live connection. No-op for stateless
    /// adapters.
    fn reset_connections(&self) {}

    fn stats(&self) -> ProviderStatsSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ProviderError::Network("x".into()).is_transient());
        assert!(ProviderError::Http { status: 503, detail: String::new() }.is_transient());
        assert!(ProviderError::Http { status: 404, detail: String::new() }.is_permanent());
        assert!(ProviderError::ResponseFormat("x".into()).is_permanent());
        assert_eq!(ProviderError::Desync("x".into()).category(), ErrorCategory::Desync);
        assert!(ProviderError::Desync("x".into()).is_permanent());
        assert!(ProviderError::SessionExpired("x".into()).is_transient());
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        let e: ProviderError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(e, ProviderError::Timeout(_)));
    }

    #[test]
    fn outcome_from_rows() {
        assert!(matches!(Outcome::<Vec<u8>>::from_rows(vec![]), Outcome::Empty));
        assert!(Outcome::from_rows(vec![1]).is_data());
        let failed = Outcome::<Vec<u8>>::from_result(Err(ProviderError::Cancelled));
        assert_eq!(failed.label(), "failed");
    }

    #[test]
    fn stats_mean_latency() {
        let stats = ProviderStats::default();
        stats.record(Duration::from_millis(10), true);
        stats.record(Duration::from_millis(30), false);
        let snap = stats.snapshot("tdx");
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.mean_latency(), Duration::from_millis(20));
    }

    #[test]
    fn mean_latency_survives_huge_request_counts() {
        let snap = ProviderStatsSnapshot {
            requests: 1 << 32,
            ..ProviderStats::default().snapshot("tdx")
        };
        assert_eq!(snap.mean_latency(), Duration::ZERO);
        let snap = ProviderStatsSnapshot {
            requests: 1 << 32,
            total_latency: Duration::from_micros(3 << 32),
            ..snap
        };
        assert_eq!(snap.mean_latency(), Duration::from_micros(3));
    }
}
