//! TDX provider with per-worker connection slots.
//!
//! Connections are never shared between concurrent callers. Each rayon worker
//! owns slot `thread_index + 1`; threads outside a pool share slot 0. A slot's
//! connection is created lazily and dropped on any I/O or framing error, so
//! the next call on that worker reconnects.
//!
//! `reset_connections` bumps a generation counter: idle connections are
//! closed at once, busy ones are discarded by their owner on next use.

use super::codec::{TdxBar, SECURITY_PAGE_SIZE};
use super::connection::TdxConnection;
use crate::config::TdxConfig;
use crate::data::cancel::CancelToken;
use crate::data::provider::{
    BarProvider, ErrorClassification, Outcome, ProviderError, ProviderStats,
    ProviderStatsSnapshot,
};
use crate::data::retry::RetryPolicy;
use crate::domain::{BarRecord, FetchWindow, Market, SymbolDescriptor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on security-list pages per market.
const MAX_LIST_PAGES: u16 = 30;

struct Slot {
    generation: u64,
    conn: TdxConnection,
}

/// Socket provider with one lazily opened connection per pool worker.
pub struct TdxProvider {
    servers: Vec<String>,
    timeout: Duration,
    lookback_bars: u16,
    slots: Vec<Mutex<Option<Slot>>>,
    generation: AtomicU64,
    retry: RetryPolicy,
    cancel: CancelToken,
    stats: ProviderStats,
}

impl TdxProvider {
    /// `workers` is the size of the fetch pool; one extra slot serves
    /// callers outside it.
    pub fn new(config: &TdxConfig, workers: usize, retry: RetryPolicy, cancel: CancelToken) -> Self {
        let slots = (0..=workers.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            servers: config.servers.clone(),
            timeout: config.timeout(),
            lookback_bars: config.lookback_bars,
            slots,
            generation: AtomicU64::new(0),
            retry,
            cancel,
            stats: ProviderStats::default(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Slot>> {
        let index = rayon::current_thread_index().map_or(0, |i| i + 1) % self.slots.len();
        self.slots[index].lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `op` on this worker's connection, creating it if needed. Any error
    /// discards the connection.
    fn with_connection<T>(
        &self,
        op: impl Fn(&mut TdxConnection) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut slot = self.slot();
        let generation = self.generation.load(Ordering::Acquire);
        if slot.as_ref().is_some_and(|s| s.generation != generation) {
            if let Some(stale) = slot.take() {
                stale.conn.close();
            }
        }

        self.retry
            .run(&self.cancel, |attempt| {
                if slot.is_none() {
                    let conn = TdxConnection::connect(&self.servers, self.timeout)?;
                    *slot = Some(Slot { generation, conn });
                }
                let Some(active) = slot.as_mut() else {
                    return Err(ProviderError::Network("connection slot empty".into()));
                };
                match op(&mut active.conn) {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        debug!(server = active.conn.server(), attempt, error = %e, "dropping tdx connection");
                        if let Some(broken) = slot.take() {
                            broken.conn.close();
                        }
                        Err(e)
                    }
                }
            })
            .map_err(ProviderError::from)
    }

    fn to_record(symbol: &SymbolDescriptor, bar: TdxBar) -> BarRecord {
        BarRecord {
            symbol: symbol.symbol.clone(),
            name: symbol.name.clone(),
            date: bar.date,
            open: Some(bar.open),
            high: Some(bar.high),
            low: Some(bar.low),
            close: Some(bar.close),
            volume: Some(bar.volume),
            amount: Some(bar.amount),
        }
    }

    fn list_market(&self, market: Market) -> Result<Vec<SymbolDescriptor>, ProviderError> {
        let mut out = Vec::new();
        for page in 0..MAX_LIST_PAGES {
            let start = page * SECURITY_PAGE_SIZE as u16;
            let entries =
                self.with_connection(|conn| Ok(conn.security_page(market.wire_id(), start)?))?;
            let full_page = entries.len() >= SECURITY_PAGE_SIZE;
            out.extend(
                entries
                    .into_iter()
                    .filter(|s| Market::classify_a_share(&s.code) == Some(market))
                    .map(|s| SymbolDescriptor::new(&s.code, market, s.name)),
            );
            if !full_page {
                break;
            }
        }
        Ok(out)
    }
}

impl BarProvider for TdxProvider {
    fn name(&self) -> &str {
        "tdx"
    }

    fn list_symbols(&self) -> Outcome<Vec<SymbolDescriptor>> {
        let started = Instant::now();
        let mut symbols = Vec::new();
        let mut last_error = None;
        for market in [Market::Shenzhen, Market::Shanghai] {
            match self.list_market(market) {
                Ok(list) => symbols.extend(list),
                Err(e) => {
                    warn!(market = ?market, error = %e, "tdx security list failed");
                    last_error = Some(e);
                }
            }
        }
        self.stats.record(started.elapsed(), last_error.is_none());
        info!(count = symbols.len(), "tdx symbol list");
        match (symbols.is_empty(), last_error) {
            (true, Some(e)) => Outcome::Failed(e),
            _ => Outcome::from_rows(symbols),
        }
    }

    fn fetch_bars(
        &self,
        symbol: &SymbolDescriptor,
        window: &FetchWindow,
    ) -> Outcome<Vec<BarRecord>> {
        let started = Instant::now();
        let market = symbol.market().wire_id();
        let result = self.with_connection(|conn| {
            Ok(conn.daily_bars(market, &symbol.code, self.lookback_bars)?)
        });
        self.stats.record(started.elapsed(), result.is_ok());

        match result {
            Ok(bars) => {
                let rows: Vec<BarRecord> = bars
                    .into_iter()
                    .filter(|b| window.contains_str(&b.date))
                    .map(|b| Self::to_record(symbol, b))
                    .collect();
                Outcome::from_rows(rows)
            }
            Err(e) => {
                debug!(symbol = %symbol, category = ?e.category(), error = %e, "tdx fetch failed");
                Outcome::Failed(e)
            }
        }
    }

    fn reset_connections(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut closed = 0;
        for slot in &self.slots {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(s) = guard.take() {
                    s.conn.close();
                    closed += 1;
                }
            }
        }
        info!(generation, closed, "tdx connections reset");
    }

    fn stats(&self) -> ProviderStatsSnapshot {
        self.stats.snapshot(self.name())
    }
}
