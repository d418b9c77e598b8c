//! Bar record: one trading day for one symbol.

use serde::{Deserialize, Serialize};

/// Daily OHLCV bar as produced by a provider adapter.
///
/// `date` is always an 8-digit `YYYYMMDD` string. Numeric fields are
/// optional: an upstream value that cannot be parsed is kept as missing
/// rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub symbol: String,
    pub name: String,
    pub date: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
}

impl BarRecord {
    /// True when open, high, low and close all parsed.
    pub fn has_all_prices(&self) -> bool {
        self.open.is_some() && self.high.is_some() && self.low.is_some() && self.close.is_some()
    }
}

/// Lenient numeric coercion used by every adapter: blanks and garbage become
/// missing values.
pub fn coerce_f64(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}
