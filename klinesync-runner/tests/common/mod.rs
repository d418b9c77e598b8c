#![allow(dead_code)]

use klinesync_core::config::HarvestConfig;
use klinesync_core::data::frame::bars_to_frame;
use klinesync_core::data::provider::{BarProvider, ProviderStatsSnapshot};
use klinesync_core::data::{CancelToken, CompositeFetcher, Outcome, StorageGateway};
use klinesync_core::domain::{BarRecord, FetchWindow, SymbolDescriptor};
use klinesync_runner::Harvester;
use polars::prelude::DataFrame;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn bar(symbol: &str, date: &str, close: f64) -> BarRecord {
    BarRecord {
        symbol: symbol.into(),
        name: "N".into(),
        date: date.into(),
        open: Some(close),
        high: Some(close + 0.2),
        low: Some(close - 0.2),
        close: Some(close),
        volume: Some(1000.0),
        amount: Some(close * 1000.0),
    }
}

pub fn frame(bars: &[BarRecord]) -> DataFrame {
    bars_to_frame(bars).unwrap()
}

/// Serves bars from a fixed table and filters them to the requested window.
pub struct TableProvider {
    pub listed: Vec<SymbolDescriptor>,
    pub bars: Vec<BarRecord>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub windows: Mutex<Vec<FetchWindow>>,
    /// Cancelled on every bar fetch when set, standing in for a deadline
    /// that passes mid-run.
    pub cancel_on_fetch: Mutex<Option<CancelToken>>,
}

impl TableProvider {
    pub fn new(listed: &[&str], bars: Vec<BarRecord>) -> Arc<Self> {
        Arc::new(Self {
            listed: listed
                .iter()
                .map(|s| SymbolDescriptor::from_symbol(s).unwrap())
                .collect(),
            bars,
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
            cancel_on_fetch: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst) + self.fetch_calls.load(Ordering::SeqCst)
    }
}

impl BarProvider for TableProvider {
    fn name(&self) -> &str {
        "table"
    }

    fn list_symbols(&self) -> Outcome<Vec<SymbolDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Outcome::from_rows(self.listed.clone())
    }

    fn fetch_bars(&self, symbol: &SymbolDescriptor, window: &FetchWindow) -> Outcome<Vec<BarRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.windows.lock().unwrap().push(*window);
        if let Some(token) = self.cancel_on_fetch.lock().unwrap().as_ref() {
            token.cancel();
        }
        Outcome::from_rows(
            self.bars
                .iter()
                .filter(|b| b.symbol == symbol.symbol && window.contains_str(&b.date))
                .cloned()
                .collect(),
        )
    }

    fn stats(&self) -> ProviderStatsSnapshot {
        ProviderStatsSnapshot {
            provider: "table".into(),
            requests: self.fetch_calls.load(Ordering::SeqCst) as u64,
            failures: 0,
            total_latency: Duration::ZERO,
        }
    }
}

pub fn storage(dir: &Path) -> StorageGateway {
    StorageGateway::new(dir.join("daily.parquet"), dir.join("backups"), 5)
}

pub fn harvester(dir: &Path, provider: &Arc<TableProvider>) -> Harvester {
    let mut config = HarvestConfig::default();
    config.schedule.max_workers = 2;
    config.schedule.desync_reset_pause_ms = 0;
    config.dataset.start_date = "20240102".into();
    let p: Arc<dyn BarProvider> = provider.clone();
    let fetcher = CompositeFetcher::new(vec![p.clone()], vec![p]);
    Harvester::new(config, fetcher, storage(dir), CancelToken::new())
}
