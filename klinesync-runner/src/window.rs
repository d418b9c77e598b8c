//! Fetch window planning.
//!
//! Incremental runs continue from the trading day after the newest stored
//! bar. Full runs cover the configured range.

use chrono::NaiveDate;
use klinesync_core::domain::{FetchWindow, TradingCalendar, WindowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowPlan {
    /// Stored data already reaches the requested end.
    UpToDate { last: NaiveDate },
    Fetch { window: FetchWindow, mode: FetchMode },
}

/// Decide what to fetch.
///
/// `existing_last` is the newest date in the stored dataset, if any.
/// `full_start` is the first date of a full refresh.
pub fn plan_window(
    existing_last: Option<NaiveDate>,
    full_start: NaiveDate,
    end: NaiveDate,
    full_refresh: bool,
    calendar: &dyn TradingCalendar,
) -> Result<WindowPlan, WindowError> {
    match existing_last {
        Some(last) if !full_refresh => {
            if end <= last {
                return Ok(WindowPlan::UpToDate { last });
            }
            let start = calendar.next_trading_day(last);
            // e.g. last bar on Friday, end on the weekend
            if start > end {
                return Ok(WindowPlan::UpToDate { last });
            }
            Ok(WindowPlan::Fetch {
                window: FetchWindow::new(start, end)?,
                mode: FetchMode::Incremental,
            })
        }
        _ => Ok(WindowPlan::Fetch {
            window: FetchWindow::new(full_start, end)?,
            mode: FetchMode::Full,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, Weekday};
    use klinesync_core::domain::WeekdayCalendar;
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn friday_continues_on_monday() {
        let plan = plan_window(Some(d(2024, 1, 5)), d(2015, 1, 1), d(2024, 1, 10), false, &WeekdayCalendar)
            .unwrap();
        let WindowPlan::Fetch { window, mode } = plan else {
            panic!("expected fetch");
        };
        assert_eq!(mode, FetchMode::Incremental);
        assert_eq!(window.start(), d(2024, 1, 8));
        assert_eq!(window.end(), d(2024, 1, 10));
    }

    #[test]
    fn end_at_or_before_last_is_up_to_date() {
        for end in [d(2024, 1, 5), d(2024, 1, 3)] {
            let plan =
                plan_window(Some(d(2024, 1, 5)), d(2015, 1, 1), end, false, &WeekdayCalendar).unwrap();
            assert_eq!(plan, WindowPlan::UpToDate { last: d(2024, 1, 5) });
        }
    }

    #[test]
    fn weekend_end_after_friday_is_up_to_date() {
        let plan = plan_window(Some(d(2024, 1, 5)), d(2015, 1, 1), d(2024, 1, 7), false, &WeekdayCalendar)
            .unwrap();
        assert_eq!(plan, WindowPlan::UpToDate { last: d(2024, 1, 5) });
    }

    #[test]
    fn no_existing_data_is_full_range() {
        let plan = plan_window(None, d(2015, 1, 1), d(2024, 1, 10), false, &WeekdayCalendar).unwrap();
        let WindowPlan::Fetch { window, mode } = plan else {
            panic!("expected fetch");
        };
        assert_eq!(mode, FetchMode::Full);
        assert_eq!(window.start(), d(2015, 1, 1));
    }

    #[test]
    fn full_refresh_ignores_existing() {
        let plan = plan_window(Some(d(2024, 1, 5)), d(2020, 1, 1), d(2024, 1, 5), true, &WeekdayCalendar)
            .unwrap();
        assert!(matches!(plan, WindowPlan::Fetch { mode: FetchMode::Full, .. }));
    }

    #[test]
    fn full_range_with_start_after_end_is_rejected() {
        assert!(plan_window(None, d(2024, 2, 1), d(2024, 1, 10), false, &WeekdayCalendar).is_err());
    }

    proptest! {
        #[test]
        fn incremental_start_is_next_weekday(offset in 0i64..3000, span in 1i64..30) {
            let last = d(2015, 1, 1) + Duration::days(offset);
            let end = last + Duration::days(span);
            match plan_window(Some(last), d(2015, 1, 1), end, false, &WeekdayCalendar).unwrap() {
                WindowPlan::Fetch { window, .. } => {
                    prop_assert!(window.start() > last);
                    prop_assert!(!matches!(window.start().weekday(), Weekday::Sat | Weekday::Sun));
                    prop_assert!((window.start() - last).num_days() <= 3);
                }
                WindowPlan::UpToDate { .. } => {
                    // only possible when every day in (last, end] is a weekend
                    prop_assert!(span <= 2);
                }
            }
        }
    }
}
