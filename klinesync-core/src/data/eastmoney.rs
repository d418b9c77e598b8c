//! Eastmoney HTTP provider.
//!
//! Daily klines come from the `stock/kline/get` endpoint as comma-separated
//! strings; the A-share universe from the paged `clist/get` endpoint. Every
//! request passes the shared limiter and circuit breaker, and is retried
//! through the shared [`RetryPolicy`]. A reply whose shape we do not
//! recognise is permanent.

use super::cancel::CancelToken;
use super::circuit_breaker::CircuitBreaker;
use super::http::{build_client, HttpGuards};
use super::provider::{
    BarProvider, Outcome, ProviderError, ProviderStats, ProviderStatsSnapshot,
};
use super::rate_limit::RequestLimiter;
use super::retry::RetryPolicy;
use crate::config::EastmoneyConfig;
use crate::domain::{coerce_f64, normalize_date_text, BarRecord, FetchWindow, Market, SymbolDescriptor};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const LIST_PAGE_SIZE: usize = 100;
const MAX_LIST_PAGES: usize = 200;
const A_SHARE_BOARDS: &str = "m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23";

#[derive(Debug, Deserialize)]
struct KlineResponse {
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    name: Option<String>,
    klines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    total: usize,
    diff: Vec<ListRow>,
}

#[derive(Debug, Deserialize)]
struct ListRow {
    f12: String,
    f13: u16,
    #[serde(default)]
    f14: String,
}

/// Eastmoney push2his kline and A-share list endpoints.
pub struct EastmoneyProvider {
    client: Client,
    kline_url: String,
    list_url: String,
    guards: HttpGuards,
    retry: RetryPolicy,
    stats: ProviderStats,
}

impl EastmoneyProvider {
    /// `limiter` and `breaker` are shared with every other user of this upstream.
    pub fn new(
        config: &EastmoneyConfig,
        limiter: Arc<RequestLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout())?,
            kline_url: config.kline_url.clone(),
            list_url: config.list_url.clone(),
            guards: HttpGuards {
                limiter,
                breaker,
                cancel,
            },
            retry,
            stats: ProviderStats::default(),
        })
    }

    fn secid(symbol: &SymbolDescriptor) -> String {
        format!("{}.{}", symbol.market().wire_id(), symbol.code)
    }

    /// `date,open,close,high,low,volume,amount[,...]`
    fn parse_kline(symbol: &SymbolDescriptor, name: &str, line: &str) -> Result<BarRecord, ProviderError> {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 7 {
            return Err(ProviderError::ResponseFormat(format!(
                "kline '{line}' has {} fields, expected at least 7",
                fields.len()
            )));
        }
        Ok(BarRecord {
            symbol: symbol.symbol.clone(),
            name: name.to_string(),
            date: normalize_date_text(fields[0]),
            open: coerce_f64(fields[1]),
            close: coerce_f64(fields[2]),
            high: coerce_f64(fields[3]),
            low: coerce_f64(fields[4]),
            volume: coerce_f64(fields[5]),
            amount: coerce_f64(fields[6]),
        })
    }

    fn fetch_klines(
        &self,
        symbol: &SymbolDescriptor,
        window: &FetchWindow,
    ) -> Result<Vec<BarRecord>, ProviderError> {
        let query = [
            ("secid", Self::secid(symbol)),
            ("fields1", "f1,f2,f3,f4,f5,f6".to_string()),
            ("fields2", "f51,f52,f53,f54,f55,f56,f57".to_string()),
            ("klt", "101".to_string()),
            ("fqt", "0".to_string()),
            ("beg", window.start_str()),
            ("end", window.end_str()),
        ];
        let resp: KlineResponse = self
            .retry
            .run(&self.guards.cancel, |_| {
                self.guards
                    .send_json(self.client.get(&self.kline_url).query(&query))
            })
            .map_err(ProviderError::from)?;

        let Some(data) = resp.data else {
            return Ok(Vec::new());
        };
        let name = if symbol.name.is_empty() {
            data.name.unwrap_or_default()
        } else {
            symbol.name.clone()
        };
        let mut rows = data
            .klines
            .iter()
            .map(|line| Self::parse_kline(symbol, &name, line))
            .collect::<Result<Vec<_>, _>>()?;
        rows.retain(|r| window.contains_str(&r.date));
        Ok(rows)
    }

    fn fetch_list(&self) -> Result<Vec<SymbolDescriptor>, ProviderError> {
        let mut out = Vec::new();
        let mut seen = 0usize;
        for page in 1..=MAX_LIST_PAGES {
            let query = [
                ("pn", page.to_string()),
                ("pz", LIST_PAGE_SIZE.to_string()),
                ("po", "1".to_string()),
                ("np", "1".to_string()),
                ("fltt", "2".to_string()),
                ("invt", "2".to_string()),
                ("fid", "f12".to_string()),
                ("fs", A_SHARE_BOARDS.to_string()),
                ("fields", "f12,f13,f14".to_string()),
            ];
            let resp: ListResponse = self
                .retry
                .run(&self.guards.cancel, |_| {
                    self.guards.send_json(self.client.get(&self.list_url).query(&query))
                })
                .map_err(ProviderError::from)?;

            let Some(data) = resp.data else { break };
            if data.diff.is_empty() {
                break;
            }
            seen += data.diff.len();
            for row in data.diff {
                let market = match row.f13 {
                    1 => Market::Shanghai,
                    0 => Market::Shenzhen,
                    _ => continue,
                };
                if Market::classify_a_share(&row.f12) == Some(market) {
                    out.push(SymbolDescriptor::new(&row.f12, market, row.f14));
                }
            }
            if seen >= data.total {
                break;
            }
        }
        Ok(out)
    }
}

impl BarProvider for EastmoneyProvider {
    fn name(&self) -> &str {
        "eastmoney"
    }

    fn list_symbols(&self) -> Outcome<Vec<SymbolDescriptor>> {
        let started = Instant::now();
        let result = self.fetch_list();
        self.stats.record(started.elapsed(), result.is_ok());
        if let Ok(list) = &result {
            info!(count = list.len(), "eastmoney symbol list");
        }
        Outcome::from_result(result)
    }

    fn fetch_bars(
        &self,
        symbol: &SymbolDescriptor,
        window: &FetchWindow,
    ) -> Outcome<Vec<BarRecord>> {
        let started = Instant::now();
        let result = self.fetch_klines(symbol, window);
        self.stats.record(started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            debug!(symbol = %symbol, error = %e, "eastmoney fetch failed");
        }
        Outcome::from_result(result)
    }

    fn stats(&self) -> ProviderStatsSnapshot {
        self.stats.snapshot(self.name())
    }
}
