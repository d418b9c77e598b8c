//! Advisory checks over a fetched batch.
//!
//! Validation never mutates or drops rows; it only reports. A batch is valid
//! when there are no findings.

use super::frame::{
    date_values, f64_values, CLOSE, DATE, HIGH, LOW, OPEN, PRICE_COLUMNS, REQUIRED_COLUMNS,
    SYMBOL, VOLUME,
};
use polars::prelude::*;

/// Prices above this are almost certainly unit or parsing errors.
pub const PRICE_CEILING: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub findings: Vec<String>,
}

impl ValidationReport {
    fn from_findings(findings: Vec<String>) -> Self {
        Self {
            is_valid: findings.is_empty(),
            findings,
        }
    }
}

fn count(values: &[Option<f64>], pred: impl Fn(f64) -> bool) -> usize {
    values.iter().flatten().filter(|v| pred(**v)).count()
}

/// Check a fetched batch. Findings are advisory and never block a merge.
pub fn validate(df: &DataFrame) -> ValidationReport {
    if df.height() == 0 {
        return ValidationReport::from_findings(vec!["dataset is empty".into()]);
    }

    let mut findings = Vec::new();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| df.column(c).is_err())
        .collect();
    if !missing.is_empty() {
        findings.push(format!("missing required columns: {}", missing.join(", ")));
    }

    if let Ok(column) = df.column(DATE) {
        match date_values(column) {
            Ok(days) => {
                let invalid = days.iter().filter(|d| d.is_none()).count();
                if invalid > 0 {
                    findings.push(format!("date has {invalid} invalid values"));
                }
            }
            Err(e) => findings.push(format!("date column unreadable: {e}")),
        }
    }

    for name in [OPEN, HIGH, LOW, CLOSE, VOLUME] {
        if df.column(name).is_err() {
            continue;
        }
        let values = match f64_values(df, name) {
            Ok(v) => v,
            Err(e) => {
                findings.push(format!("{name} column unreadable: {e}"));
                continue;
            }
        };
        let negative = count(&values, |v| v < 0.0);
        if negative > 0 {
            findings.push(format!("{name} has {negative} negative values"));
        }
        if PRICE_COLUMNS.contains(&name) {
            let zero = count(&values, |v| v == 0.0);
            if zero > 0 {
                findings.push(format!("{name} has {zero} zero prices"));
            }
            let high = count(&values, |v| v > PRICE_CEILING);
            if high > 0 {
                findings.push(format!("{name} has {high} prices above {PRICE_CEILING}"));
            }
        }
    }

    if PRICE_COLUMNS.iter().all(|c| df.column(c).is_ok()) {
        if let (Ok(o), Ok(h), Ok(l), Ok(c)) = (
            f64_values(df, OPEN),
            f64_values(df, HIGH),
            f64_values(df, LOW),
            f64_values(df, CLOSE),
        ) {
            let mut high_below = 0;
            let mut low_above = 0;
            for i in 0..df.height() {
                if let (Some(o), Some(h), Some(l), Some(c)) = (o[i], h[i], l[i], c[i]) {
                    if h < o && h < l && h < c {
                        high_below += 1;
                    }
                    if l > o && l > h && l > c {
                        low_above += 1;
                    }
                }
            }
            if high_below > 0 {
                findings.push(format!("high below open, low and close in {high_below} rows"));
            }
            if low_above > 0 {
                findings.push(format!("low above open, high and close in {low_above} rows"));
            }
        }
    }

    if let Ok(column) = df.column(SYMBOL) {
        let invalid = match column.str() {
            Ok(ca) => ca
                .into_iter()
                .filter(|s| s.map_or(true, |s| s.trim().is_empty()))
                .count(),
            Err(_) => df.height(),
        };
        if invalid > 0 {
            findings.push(format!("symbol has {invalid} missing values"));
        }
    }

    ValidationReport::from_findings(findings)
}
