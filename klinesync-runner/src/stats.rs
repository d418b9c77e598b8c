//! Per-run counters.

use klinesync_core::data::{CompositeFetch, Outcome, ProviderStatsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    /// Symbols submitted to the pool.
    pub total: usize,
    pub fetched: usize,
    pub empty: usize,
    pub failed: usize,
    /// Tasks cancelled by the run deadline before they started.
    pub skipped: usize,
    pub rows: usize,
    pub desync_resets: usize,
    pub timed_out: bool,
    /// Symbols served per provider.
    pub by_source: BTreeMap<String, usize>,
    #[serde(skip)]
    pub providers: Vec<ProviderStatsSnapshot>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Count one finished symbol.
    pub fn record(&mut self, fetch: &CompositeFetch) {
        match &fetch.outcome {
            Outcome::Data(rows) => {
                self.fetched += 1;
                self.rows += rows.len();
                if let Some(source) = &fetch.source {
                    *self.by_source.entry(source.clone()).or_default() += 1;
                }
            }
            Outcome::Empty => self.empty += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    /// Symbols that finished, whatever the outcome. Skipped ones are not counted.
    pub fn completed(&self) -> usize {
        self.fetched + self.empty + self.failed
    }

    /// Percentage of all symbols that answered with data or an empty result.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.fetched + self.empty) as f64 / self.total as f64 * 100.0
        }
    }

    /// One summary line, plus a line per provider.
    pub fn log_summary(&self, operation: &str) {
        info!(
            operation,
            total = self.total,
            fetched = self.fetched,
            empty = self.empty,
            failed = self.failed,
            skipped = self.skipped,
            rows = self.rows,
            desync_resets = self.desync_resets,
            timed_out = self.timed_out,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "fetch summary"
        );
        for (source, count) in &self.by_source {
            info!(provider = %source, symbols = count, "served by provider");
        }
        for p in &self.providers {
            info!(
                provider = %p.provider,
                requests = p.requests,
                failures = p.failures,
                mean_latency_ms = p.mean_latency().as_millis() as u64,
                "provider stats"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klinesync_core::data::{ProviderError, ProviderFailure};
    use klinesync_core::domain::BarRecord;

    fn bar() -> BarRecord {
        BarRecord {
            symbol: "000001.SZ".into(),
            name: String::new(),
            date: "20240108".into(),
            open: Some(1.0),
            high: Some(1.0),
            low: Some(1.0),
            close: Some(1.0),
            volume: Some(1.0),
            amount: Some(1.0),
        }
    }

    #[test]
    fn record_counts_each_outcome() {
        let mut stats = RunStats::new(4);
        stats.record(&CompositeFetch {
            outcome: Outcome::Data(vec![bar(), bar()]),
            source: Some("tdx".into()),
            failures: Vec::new(),
        });
        stats.record(&CompositeFetch {
            outcome: Outcome::Empty,
            source: None,
            failures: Vec::new(),
        });
        stats.record(&CompositeFetch {
            outcome: Outcome::Failed(ProviderError::Timeout("t".into())),
            source: None,
            failures: vec![ProviderFailure {
                provider: "tdx".into(),
                error: ProviderError::Timeout("t".into()),
            }],
        });
        assert_eq!((stats.fetched, stats.empty, stats.failed, stats.rows), (1, 1, 1, 2));
        assert_eq!(stats.completed(), 3);
        assert_eq!(stats.by_source.get("tdx"), Some(&1));
        assert!((stats.success_rate() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn success_rate_of_empty_run_is_zero() {
        assert_eq!(RunStats::new(0).success_rate(), 0.0);
    }
}
