//! Trading-day arithmetic over `YYYYMMDD` calendar dates.
//!
//! Only weekends are treated as non-trading days. Exchange holidays are not
//! modelled; a holiday calendar can be supplied through [`TradingCalendar`].

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateError {
    #[error("'{0}' is not an 8-digit YYYYMMDD date")]
    Format(String),

    #[error("'{0}' is not a real calendar date")]
    Calendar(String),
}

/// Parse a strict 8-digit `YYYYMMDD` string into a calendar date.
pub fn parse_yyyymmdd(s: &str) -> Result<NaiveDate, DateError> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DateError::Format(s.to_string()));
    }
    NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|_| DateError::Calendar(s.to_string()))
}

pub fn format_yyyymmdd(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Strip the separators upstreams put into dates (`2024-01-05`, `2024/01/05`,
/// `2024.01.05`). Does not validate.
pub fn normalize_date_text(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | '/' | '.'))
        .collect()
}

/// Which calendar dates the exchange is open.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;

    /// First trading day strictly after `date`.
    fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_trading_day(d) {
            d += Duration::days(1);
        }
        d
    }

    /// `date` itself if it is a trading day, otherwise the closest earlier one.
    fn on_or_before(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date;
        while !self.is_trading_day(d) {
            d -= Duration::days(1);
        }
        d
    }
}

/// Monday through Friday.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeekdayCalendar;

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// The most recent weekday on or before `date`.
pub fn previous_weekday(date: NaiveDate) -> NaiveDate {
    WeekdayCalendar.on_or_before(date)
}

/// Default end of a fetch window given the local exchange time.
///
/// Today once the market has closed, yesterday before that, then moved back
/// onto a trading day.
pub fn default_end_date(
    now: NaiveDateTime,
    market_close: NaiveTime,
    calendar: &dyn TradingCalendar,
) -> NaiveDate {
    let day = if now.time() >= market_close {
        now.date()
    } else {
        now.date() - Duration::days(1)
    };
    calendar.on_or_before(day)
}
