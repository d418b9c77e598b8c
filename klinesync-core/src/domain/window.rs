//! Fetch window: inclusive `[start, end]` date range.

use super::calendar::{format_yyyymmdd, parse_yyyymmdd, DateError};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },

    #[error(transparent)]
    Date(#[from] DateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl FetchWindow {
    /// Fails when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// From two `YYYYMMDD` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, WindowError> {
        Self::new(parse_yyyymmdd(start)?, parse_yyyymmdd(end)?)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn start_str(&self) -> String {
        format_yyyymmdd(self.start)
    }

    pub fn end_str(&self) -> String {
        format_yyyymmdd(self.end)
    }

    /// Inclusive on both ends.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Like [`contains`](Self::contains) for a raw `YYYYMMDD` string;
    /// unparsable dates are outside every window.
    pub fn contains_str(&self, date: &str) -> bool {
        parse_yyyymmdd(date).map(|d| self.contains(d)).unwrap_or(false)
    }
}

impl std::fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start_str(), self.end_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_window_rejected() {
        assert!(matches!(
            FetchWindow::parse("20240110", "20240108"),
            Err(WindowError::Inverted { .. })
        ));
        assert!(FetchWindow::parse("20240108", "20240108").is_ok());
    }

    #[test]
    fn contains_is_inclusive() {
        let w = FetchWindow::parse("20240108", "20240110").unwrap();
        assert!(w.contains_str("20240108"));
        assert!(w.contains_str("20240110"));
        assert!(!w.contains_str("20240105"));
        assert!(!w.contains_str("garbage"));
        assert_eq!(w.to_string(), "20240108..20240110");
    }
}
