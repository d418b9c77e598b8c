//! Session-gateway provider (baostock-compatible JSON API).
//!
//! Every query needs a session obtained from `login`. A reply with error code
//! `10001001` means the gateway dropped the session: it is forgotten, and the
//! retry loop logs in again before the next attempt. Other non-zero codes
//! are treated as transient upstream failures.

use super::cancel::CancelToken;
use super::circuit_breaker::CircuitBreaker;
use super::http::{build_client, HttpGuards};
use super::provider::{
    BarProvider, Outcome, ProviderError, ProviderStats, ProviderStatsSnapshot,
};
use super::rate_limit::RequestLimiter;
use super::retry::RetryPolicy;
use crate::config::SessionConfig;
use crate::domain::{coerce_f64, normalize_date_text, BarRecord, FetchWindow, Market, SymbolDescriptor};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Gateway `error_code` values.
pub const SUCCESS_CODE: &str = "0";
pub const SESSION_EXPIRED_CODE: &str = "10001001";

const BAR_FIELDS: &str = "date,open,high,low,close,volume,amount";
const UNADJUSTED: &str = "3";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    user_id: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    error_code: String,
    #[serde(default)]
    error_msg: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<String>>,
}

impl GatewayReply {
    /// Column index of `name`, falling back to `default` when the gateway
    /// omits the field list.
    fn column(&self, name: &str, default: usize) -> Result<usize, ProviderError> {
        if self.fields.is_empty() {
            return Ok(default);
        }
        self.fields
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| ProviderError::ResponseFormat(format!("reply has no '{name}' field")))
    }
}

/// Session gateway provider. Logs in lazily and again when the session expires.
pub struct SessionProvider {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    session: Mutex<Option<String>>,
    guards: HttpGuards,
    retry: RetryPolicy,
    stats: ProviderStats,
}

impl SessionProvider {
    pub fn new(
        config: &SessionConfig,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout())?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            session: Mutex::new(None),
            guards: HttpGuards {
                limiter: Arc::new(RequestLimiter::unlimited()),
                breaker,
                cancel,
            },
            retry,
            stats: ProviderStats::default(),
        })
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<String>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current session token, logging in first if there is none.
    fn ensure_session(&self) -> Result<String, ProviderError> {
        let mut session = self.lock_session();
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        let reply: GatewayReply = self.guards.send_json(
            self.client
                .post(format!("{}/login", self.base_url))
                .json(&LoginRequest {
                    user_id: &self.user,
                    password: &self.password,
                }),
        )?;
        if reply.error_code != SUCCESS_CODE {
            warn!(code = %reply.error_code, msg = %reply.error_msg, "session login rejected");
            return Err(ProviderError::Login(reply.error_msg));
        }
        let token = reply
            .session
            .ok_or_else(|| ProviderError::ResponseFormat("login reply without session".into()))?;
        info!("session gateway login ok");
        *session = Some(token.clone());
        Ok(token)
    }

    fn forget_session(&self, token: &str) {
        let mut session = self.lock_session();
        if session.as_deref() == Some(token) {
            *session = None;
        }
    }

    fn query(&self, endpoint: &str, params: &[(&str, String)]) -> Result<GatewayReply, ProviderError> {
        let url = format!("{}/{endpoint}", self.base_url);
        self.retry
            .run(&self.guards.cancel, |attempt| {
                let token = self.ensure_session()?;
                let reply: GatewayReply = self.guards.send_json(
                    self.client
                        .get(&url)
                        .query(&[("session", token.as_str())])
                        .query(params),
                )?;
                match reply.error_code.as_str() {
                    SUCCESS_CODE => Ok(reply),
                    SESSION_EXPIRED_CODE => {
                        debug!(attempt, endpoint, "session expired, re-login on retry");
                        self.forget_session(&token);
                        Err(ProviderError::SessionExpired(reply.error_msg))
                    }
                    _ => Err(ProviderError::Upstream {
                        code: reply.error_code,
                        message: reply.error_msg,
                    }),
                }
            })
            .map_err(ProviderError::from)
    }

    fn fetch_list(&self) -> Result<Vec<SymbolDescriptor>, ProviderError> {
        let reply = self.query("query_stock_basic", &[])?;
        let (code_ix, name_ix) = (reply.column("code", 0)?, reply.column("code_name", 1)?);
        let (type_ix, status_ix) = (reply.column("type", 4)?, reply.column("status", 5)?);

        let mut out = Vec::new();
        for row in &reply.rows {
            let field = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
            // type 1 = stock, status 1 = listed
            if field(type_ix) != "1" || field(status_ix) != "1" {
                continue;
            }
            let Some((prefix, code)) = field(code_ix).split_once('.') else {
                continue;
            };
            let market = match prefix {
                "sh" => Market::Shanghai,
                "sz" => Market::Shenzhen,
                _ => continue,
            };
            if Market::classify_a_share(code) == Some(market) {
                out.push(SymbolDescriptor::new(code, market, field(name_ix)));
            }
        }
        Ok(out)
    }

    fn fetch_history(
        &self,
        symbol: &SymbolDescriptor,
        window: &FetchWindow,
    ) -> Result<Vec<BarRecord>, ProviderError> {
        let market = symbol.market();
        let params = [
            ("code", format!("{}.{}", market.session_prefix(), symbol.code)),
            ("fields", BAR_FIELDS.to_string()),
            ("start_date", window.start().format("%Y-%m-%d").to_string()),
            ("end_date", window.end().format("%Y-%m-%d").to_string()),
            ("frequency", "d".to_string()),
            ("adjustflag", UNADJUSTED.to_string()),
        ];
        let reply = self.query("query_history_k_data_plus", &params)?;
        let ix = [
            reply.column("date", 0)?,
            reply.column("open", 1)?,
            reply.column("high", 2)?,
            reply.column("low", 3)?,
            reply.column("close", 4)?,
            reply.column("volume", 5)?,
            reply.column("amount", 6)?,
        ];

        let mut rows = Vec::with_capacity(reply.rows.len());
        for row in &reply.rows {
            let field = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
            let bar = BarRecord {
                symbol: symbol.symbol.clone(),
                name: symbol.name.clone(),
                date: normalize_date_text(field(ix[0])),
                open: coerce_f64(field(ix[1])),
                high: coerce_f64(field(ix[2])),
                low: coerce_f64(field(ix[3])),
                close: coerce_f64(field(ix[4])),
                volume: coerce_f64(field(ix[5])),
                amount: coerce_f64(field(ix[6])),
            };
            // incomplete price rows are suspended days
            if bar.date.is_empty() || !bar.has_all_prices() {
                continue;
            }
            rows.push(bar);
        }
        Ok(rows)
    }
}

impl BarProvider for SessionProvider {
    fn name(&self) -> &str {
        "session"
    }

    fn list_symbols(&self) -> Outcome<Vec<SymbolDescriptor>> {
        let started = Instant::now();
        let result = self.fetch_list();
        self.stats.record(started.elapsed(), result.is_ok());
        if let Ok(list) = &result {
            info!(count = list.len(), "session symbol list");
        }
        Outcome::from_result(result)
    }

    fn fetch_bars(
        &self,
        symbol: &SymbolDescriptor,
        window: &FetchWindow,
    ) -> Outcome<Vec<BarRecord>> {
        let started = Instant::now();
        let result = self.fetch_history(symbol, window);
        self.stats.record(started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            debug!(symbol = %symbol, error = %e, "session fetch failed");
        }
        Outcome::from_result(result)
    }

    fn stats(&self) -> ProviderStatsSnapshot {
        self.stats.snapshot(self.name())
    }
}
