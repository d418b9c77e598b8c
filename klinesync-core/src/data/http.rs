//! Shared blocking HTTP plumbing for the JSON providers.
//!
//! Status handling follows one table: 403 trips the circuit breaker, 429 and
//! 5xx count towards tripping it and are retried, other non-2xx responses are
//! permanent. Bodies that do not deserialize are permanent format errors.

use super::cancel::CancelToken;
use super::circuit_breaker::CircuitBreaker;
use super::provider::ProviderError;
use super::rate_limit::RequestLimiter;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Blocking client with connect and request timeouts.
pub fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("http client: {e}")))
}

/// Guards shared by every request to one upstream.
#[derive(Clone)]
pub struct HttpGuards {
    pub limiter: Arc<RequestLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub cancel: CancelToken,
}

impl HttpGuards {
    /// Send one request through the breaker and limiter and decode the JSON
    /// reply.
    pub fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        if !self.breaker.is_allowed() {
            return Err(ProviderError::CircuitOpen {
                remaining_secs: self.breaker.remaining_cooldown().as_secs(),
            });
        }
        if !self.limiter.acquire(&self.cancel) {
            return Err(ProviderError::Cancelled);
        }

        let resp = request.send()?;
        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            self.breaker.trip();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                detail: "forbidden".into(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.breaker.record_failure();
            return Err(ProviderError::RateLimited {
                status: status.as_u16(),
            });
        }
        if status.is_server_error() {
            self.breaker.record_failure();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                detail: status.canonical_reason().unwrap_or("server error").into(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                detail: status.canonical_reason().unwrap_or("unexpected status").into(),
            });
        }

        let body = resp.text()?;
        self.breaker.record_success();
        serde_json::from_str(&body).map_err(|e| ProviderError::ResponseFormat(e.to_string()))
    }
}
