//! Ordered fallback across providers.
//!
//! Symbol lists: the first provider returning a non-empty list wins; when
//! none does the result is an empty list, never an error. Bars: providers
//! are tried in order until one returns rows. Failures along the way are
//! kept so the orchestrator can react to a protocol desync.

use super::provider::{
    BarProvider, ErrorCategory, ErrorClassification, Outcome, ProviderError,
    ProviderStatsSnapshot,
};
use crate::domain::{BarRecord, FetchWindow, SymbolDescriptor};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

/// Result of a fallback fetch for one symbol.
#[derive(Debug)]
pub struct CompositeFetch {
    pub outcome: Outcome<Vec<BarRecord>>,
    /// Provider that produced `Data`, if any.
    pub source: Option<String>,
    pub failures: Vec<ProviderFailure>,
}

impl CompositeFetch {
    /// True if any provider in the chain reported a protocol desync.
    pub fn saw_desync(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.error.category() == ErrorCategory::Desync)
    }
}

/// Ordered provider chains for symbol lists and for bars.
pub struct CompositeFetcher {
    list_chain: Vec<Arc<dyn BarProvider>>,
    bars_chain: Vec<Arc<dyn BarProvider>>,
}

impl CompositeFetcher {
    /// Providers are tried in the order given.
    pub fn new(list_chain: Vec<Arc<dyn BarProvider>>, bars_chain: Vec<Arc<dyn BarProvider>>) -> Self {
        Self {
            list_chain,
            bars_chain,
        }
    }

    /// First non-empty list in chain order, or an empty list when every source
    /// failed or came back empty.
    pub fn list_symbols(&self) -> Vec<SymbolDescriptor> {
        for provider in &self.list_chain {
            match provider.list_symbols() {
                Outcome::Data(list) => return list,
                Outcome::Empty => {
                    warn!(provider = provider.name(), "empty symbol list, trying next source")
                }
                Outcome::Failed(e) => {
                    warn!(provider = provider.name(), error = %e, "symbol list failed, trying next source")
                }
            }
        }
        error!("no symbol list available from any source");
        Vec::new()
    }

    /// Bars from the first provider that returns data. Failures along the way
    /// are kept on the result.
    pub fn fetch_bars(&self, symbol: &SymbolDescriptor, window: &FetchWindow) -> CompositeFetch {
        let mut failures = Vec::new();
        let mut saw_empty = false;
        for provider in &self.bars_chain {
            match provider.fetch_bars(symbol, window) {
                Outcome::Data(rows) => {
                    return CompositeFetch {
                        outcome: Outcome::Data(rows),
                        source: Some(provider.name().to_string()),
                        failures,
                    }
                }
                Outcome::Empty => {
                    debug!(symbol = %symbol, provider = provider.name(), "no rows in window");
                    saw_empty = true;
                }
                Outcome::Failed(e) => {
                    debug!(symbol = %symbol, provider = provider.name(), error = %e, "falling back");
                    failures.push(ProviderFailure {
                        provider: provider.name().to_string(),
                        error: e,
                    });
                }
            }
        }

        let outcome = match failures.last() {
            Some(last) if !saw_empty => Outcome::Failed(last.error.clone()),
            _ => Outcome::Empty,
        };
        CompositeFetch {
            outcome,
            source: None,
            failures,
        }
    }

    /// Tear down live connections on every bar provider.
    pub fn reset_connections(&self) {
        for provider in self.providers() {
            provider.reset_connections();
        }
    }

    /// One snapshot per distinct provider.
    pub fn stats(&self) -> Vec<ProviderStatsSnapshot> {
        self.providers().into_iter().map(|p| p.stats()).collect()
    }

    /// Distinct providers across both chains, bars chain order first.
    fn providers(&self) -> Vec<&Arc<dyn BarProvider>> {
        let mut out: Vec<&Arc<dyn BarProvider>> = Vec::new();
        for p in self.bars_chain.iter().chain(self.list_chain.iter()) {
            if !out.iter().any(|q| q.name() == p.name()) {
                out.push(p);
            }
        }
        out
    }
}
