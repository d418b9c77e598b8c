//! Dataset frame codec.
//!
//! The persisted dataset is a polars [`DataFrame`] with one row per
//! `(symbol, date)`. Freshly fetched batches carry `date` as an 8-digit
//! string; an existing file may use a `Date`, `Datetime` or integer column
//! instead, and [`conform_dates`] converts between them.

use crate::domain::{format_yyyymmdd, normalize_date_text, parse_yyyymmdd, BarRecord};
use chrono::{DateTime, Duration, NaiveDate};
use polars::prelude::*;
use std::collections::BTreeSet;
use thiserror::Error;

/// Dataset column names.
pub const SYMBOL: &str = "symbol";
pub const NAME: &str = "name";
pub const DATE: &str = "date";
pub const OPEN: &str = "open";
pub const HIGH: &str = "high";
pub const LOW: &str = "low";
pub const CLOSE: &str = "close";
pub const VOLUME: &str = "volume";
pub const AMOUNT: &str = "amount";

/// Columns a fetched batch must carry.
pub const REQUIRED_COLUMNS: [&str; 7] = [SYMBOL, DATE, OPEN, HIGH, LOW, CLOSE, VOLUME];
pub const PRICE_COLUMNS: [&str; 4] = [OPEN, HIGH, LOW, CLOSE];
pub const NUMERIC_COLUMNS: [&str; 6] = [OPEN, HIGH, LOW, CLOSE, VOLUME, AMOUNT];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("polars: {0}")]
    Polars(#[from] PolarsError),

    #[error("missing column '{0}'")]
    MissingColumn(String),

    #[error("unsupported date column type {0}")]
    UnsupportedDateType(String),
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Build a frame from adapter output. Column order is fixed.
pub fn bars_to_frame(bars: &[BarRecord]) -> Result<DataFrame, FrameError> {
    let symbols: Vec<&str> = bars.iter().map(|b| b.symbol.as_str()).collect();
    let names: Vec<&str> = bars.iter().map(|b| b.name.as_str()).collect();
    let dates: Vec<&str> = bars.iter().map(|b| b.date.as_str()).collect();
    let opens: Vec<Option<f64>> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<Option<f64>> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<Option<f64>> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<Option<f64>> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<Option<f64>> = bars.iter().map(|b| b.volume).collect();
    let amounts: Vec<Option<f64>> = bars.iter().map(|b| b.amount).collect();

    Ok(DataFrame::new(vec![
        Column::new(SYMBOL.into(), symbols),
        Column::new(NAME.into(), names),
        Column::new(DATE.into(), dates),
        Column::new(OPEN.into(), opens),
        Column::new(HIGH.into(), highs),
        Column::new(LOW.into(), lows),
        Column::new(CLOSE.into(), closes),
        Column::new(VOLUME.into(), volumes),
        Column::new(AMOUNT.into(), amounts),
    ])?)
}

/// Cast every present price/volume column to `Float64`; values that do not
/// parse become null.
pub fn coerce_numeric(df: DataFrame) -> Result<DataFrame, FrameError> {
    let present: Vec<Expr> = NUMERIC_COLUMNS
        .iter()
        .filter(|c| df.column(c).is_ok())
        .map(|c| col(*c).cast(DataType::Float64))
        .collect();
    if present.is_empty() {
        return Ok(df);
    }
    Ok(df.lazy().with_columns(present).collect()?)
}

/// Interpret a date cell of any supported representation.
fn date_from_text(raw: &str) -> Option<NaiveDate> {
    let head = raw.split([' ', 'T']).next().unwrap_or("");
    parse_yyyymmdd(&normalize_date_text(head)).ok()
}

fn date_from_int(v: i64) -> Option<NaiveDate> {
    if !(0..=99_991_231).contains(&v) {
        return None;
    }
    parse_yyyymmdd(&format!("{v:08}")).ok()
}

/// Decode the date column into calendar dates; unparsable cells are `None`.
pub fn date_values(column: &Column) -> Result<Vec<Option<NaiveDate>>, FrameError> {
    let out = match column.dtype() {
        DataType::String => column
            .str()?
            .into_iter()
            .map(|v| v.and_then(date_from_text))
            .collect(),
        DataType::Date => column
            .cast(&DataType::Int32)?
            .i32()?
            .into_iter()
            .map(|v| v.map(|days| epoch() + Duration::days(i64::from(days))))
            .collect(),
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            column
                .cast(&DataType::Int64)?
                .i64()?
                .into_iter()
                .map(|v| {
                    v.and_then(|raw| match unit {
                        TimeUnit::Nanoseconds => Some(DateTime::from_timestamp_nanos(raw)),
                        TimeUnit::Microseconds => DateTime::from_timestamp_micros(raw),
                        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(raw),
                    })
                    .map(|dt| dt.date_naive())
                })
                .collect()
        }
        dt if dt.is_integer() => column
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|v| v.and_then(date_from_int))
            .collect(),
        other => return Err(FrameError::UnsupportedDateType(other.to_string())),
    };
    Ok(out)
}

/// Re-encode a date column to `target`, the representation of an existing
/// dataset.
pub fn conform_dates(column: &Column, target: &DataType) -> Result<Column, FrameError> {
    if column.dtype() == target {
        return Ok(column.clone());
    }
    let days = date_values(column)?;
    let name = column.name().clone();
    let out = match target {
        DataType::String => Column::new(
            name,
            days.iter().map(|d| d.map(format_yyyymmdd)).collect::<Vec<_>>(),
        ),
        DataType::Date => Column::new(
            name,
            days.iter()
                .map(|d| d.map(|d| (d - epoch()).num_days() as i32))
                .collect::<Vec<_>>(),
        )
        .cast(&DataType::Date)?,
        DataType::Datetime(unit, _) => {
            let per_day: i64 = match unit {
                TimeUnit::Nanoseconds => 86_400_000_000_000,
                TimeUnit::Microseconds => 86_400_000_000,
                TimeUnit::Milliseconds => 86_400_000,
            };
            Column::new(
                name,
                days.iter()
                    .map(|d| d.map(|d| (d - epoch()).num_days() * per_day))
                    .collect::<Vec<_>>(),
            )
            .cast(target)?
        }
        dt if dt.is_integer() => Column::new(
            name,
            days.iter()
                .map(|d| d.and_then(|d| format_yyyymmdd(d).parse::<i64>().ok()))
                .collect::<Vec<_>>(),
        )
        .cast(target)?,
        other => return Err(FrameError::UnsupportedDateType(other.to_string())),
    };
    Ok(out)
}

/// Earliest and latest parseable date, or `None` for an empty frame.
pub fn date_bounds(df: &DataFrame) -> Result<Option<(NaiveDate, NaiveDate)>, FrameError> {
    let column = df
        .column(DATE)
        .map_err(|_| FrameError::MissingColumn(DATE.into()))?;
    let days = date_values(column)?;
    let mut valid = days.into_iter().flatten();
    let Some(first) = valid.next() else {
        return Ok(None);
    };
    Ok(Some(valid.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)))))
}

/// Sorted non-blank symbols.
pub fn distinct_symbols(df: &DataFrame) -> Result<Vec<String>, FrameError> {
    let column = df
        .column(SYMBOL)
        .map_err(|_| FrameError::MissingColumn(SYMBOL.into()))?;
    let set: BTreeSet<String> = column
        .str()?
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect();
    Ok(set.into_iter().collect())
}

/// Column as `f64` values, casting if needed.
pub fn f64_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, FrameError> {
    let column = df
        .column(name)
        .map_err(|_| FrameError::MissingColumn(name.into()))?;
    let cast = column.cast(&DataType::Float64)?;
    Ok(cast.f64()?.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, date: &str, close: Option<f64>) -> BarRecord {
        BarRecord {
            symbol: symbol.into(),
            name: "N".into(),
            date: date.into(),
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close,
            volume: Some(10.0),
            amount: None,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn bars_to_frame_keeps_nulls() {
        let df = bars_to_frame(&[bar("000001.SZ", "20240105", None), bar("600000.SH", "20240108", Some(3.0))]).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 9);
        let close = df.column(CLOSE).unwrap().f64().unwrap();
        assert_eq!(close.get(0), None);
        assert_eq!(close.get(1), Some(3.0));
    }

    #[test]
    fn coerce_numeric_turns_garbage_into_null() {
        let df = df!(
            "symbol" => &["000001.SZ", "000001.SZ"],
            "close" => &["10.5", "abc"],
        )
        .unwrap();
        let df = coerce_numeric(df).unwrap();
        let close = df.column(CLOSE).unwrap().f64().unwrap();
        assert_eq!(close.get(0), Some(10.5));
        assert_eq!(close.get(1), None);
    }

    #[test]
    fn date_values_from_each_representation() {
        let strings = Column::new("date".into(), &["20240105", "2024-01-08", "bogus"]);
        assert_eq!(
            date_values(&strings).unwrap(),
            vec![Some(d(2024, 1, 5)), Some(d(2024, 1, 8)), None]
        );

        let ints = Column::new("date".into(), &[20240105i64, 20241399]);
        assert_eq!(date_values(&ints).unwrap(), vec![Some(d(2024, 1, 5)), None]);

        let days = (d(2024, 1, 5) - epoch()).num_days() as i32;
        let dates = Column::new("date".into(), &[days]).cast(&DataType::Date).unwrap();
        assert_eq!(date_values(&dates).unwrap(), vec![Some(d(2024, 1, 5))]);
    }

    #[test]
    fn conform_to_date_and_datetime() {
        let strings = Column::new("date".into(), &["20240105", "junk"]);

        let as_date = conform_dates(&strings, &DataType::Date).unwrap();
        assert_eq!(as_date.dtype(), &DataType::Date);
        assert_eq!(date_values(&as_date).unwrap(), vec![Some(d(2024, 1, 5)), None]);

        let target = DataType::Datetime(TimeUnit::Nanoseconds, None);
        let as_dt = conform_dates(&strings, &target).unwrap();
        assert_eq!(as_dt.dtype(), &target);
        assert_eq!(date_values(&as_dt).unwrap()[0], Some(d(2024, 1, 5)));

        let as_int = conform_dates(&strings, &DataType::Int64).unwrap();
        assert_eq!(as_int.i64().unwrap().get(0), Some(20240105));

        let back = conform_dates(&as_date, &DataType::String).unwrap();
        assert_eq!(back.str().unwrap().get(0), Some("20240105"));
    }

    #[test]
    fn bounds_and_symbols() {
        let df = bars_to_frame(&[
            bar("600000.SH", "20240108", Some(1.0)),
            bar("000001.SZ", "20240103", Some(1.0)),
            bar("000001.SZ", "20240110", Some(1.0)),
        ])
        .unwrap();
        assert_eq!(date_bounds(&df).unwrap(), Some((d(2024, 1, 3), d(2024, 1, 10))));
        assert_eq!(distinct_symbols(&df).unwrap(), vec!["000001.SZ", "600000.SH"]);
        assert_eq!(date_bounds(&bars_to_frame(&[]).unwrap()).unwrap(), None);
    }
}
