//! End-to-end harvest runs against a table-backed provider and a temp dir.

mod common;

use chrono::NaiveDate;
use common::{bar, frame, harvester, storage, TableProvider};
use klinesync_core::data::frame::{date_values, DATE, SYMBOL};
use klinesync_core::domain::BarRecord;
use klinesync_runner::{FetchMode, NoOpReason, RunError, RunOutcome, RunRequest, UniverseSource};
use polars::prelude::*;

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
}

fn request_until(end: &str) -> RunRequest {
    RunRequest {
        end: Some(d(end)),
        ..RunRequest::default()
    }
}

fn seed(dir: &std::path::Path, bars: &[BarRecord]) {
    let mut df = frame(bars);
    storage(dir).save(&mut df).unwrap();
}

fn dates_for(df: &DataFrame, symbol: &str) -> Vec<NaiveDate> {
    let mask = df.column(SYMBOL).unwrap().str().unwrap().equal(symbol);
    let rows = df.filter(&mask).unwrap();
    date_values(rows.column(DATE).unwrap())
        .unwrap()
        .into_iter()
        .flatten()
        .collect()
}

#[test]
fn incremental_run_appends_new_trading_days() {
    let dir = tempfile::tempdir().unwrap();
    seed(
        dir.path(),
        &[
            bar("000001.SZ", "20240103", 9.0),
            bar("000001.SZ", "20240104", 9.1),
            bar("000001.SZ", "20240105", 9.2),
        ],
    );
    let provider = TableProvider::new(
        &["000001.SZ"],
        vec![
            bar("000001.SZ", "20240105", 99.0),
            bar("000001.SZ", "20240108", 9.3),
            bar("000001.SZ", "20240109", 9.4),
            bar("000001.SZ", "20240110", 9.5),
        ],
    );

    let report = harvester(dir.path(), &provider).run(&request_until("20240110")).unwrap();
    let RunOutcome::Merged { window, mode, rows_fetched, rows_total, save } = report.outcome else {
        panic!("expected merge");
    };
    assert_eq!(mode, FetchMode::Incremental);
    assert_eq!(window.start(), d("20240108"));
    assert_eq!(rows_fetched, 3);
    assert_eq!(rows_total, 6);
    assert!(save.backup.is_some());
    assert_eq!(report.universe, Some(UniverseSource::Providers));
    assert!(report.validation.unwrap().is_valid);

    let stored = storage(dir.path()).load().unwrap().unwrap();
    let dates = dates_for(&stored, "000001.SZ");
    assert_eq!(
        dates,
        ["20240103", "20240104", "20240105", "20240108", "20240109", "20240110"].map(d)
    );
    assert!(dates.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn end_before_stored_max_is_noop_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), &[bar("000001.SZ", "20240105", 9.2)]);
    let provider = TableProvider::new(&["000001.SZ"], vec![bar("000001.SZ", "20240108", 9.3)]);

    let report = harvester(dir.path(), &provider).run(&request_until("20240105")).unwrap();
    assert!(matches!(
        report.outcome,
        RunOutcome::NoOp(NoOpReason::UpToDate { last }) if last == d("20240105")
    ));
    assert_eq!(provider.calls(), 0);
}

#[test]
fn empty_symbol_list_falls_back_to_stored_symbols() {
    let dir = tempfile::tempdir().unwrap();
    seed(
        dir.path(),
        &[bar("000001.SZ", "20240105", 9.2), bar("600000.SH", "20240105", 7.0)],
    );
    let provider = TableProvider::new(
        &[],
        vec![bar("000001.SZ", "20240108", 9.3), bar("600000.SH", "20240108", 7.1)],
    );

    let report = harvester(dir.path(), &provider).run(&request_until("20240108")).unwrap();
    assert_eq!(report.universe, Some(UniverseSource::ExistingDataset));
    assert_eq!(report.stats.fetched, 2);
    let RunOutcome::Merged { rows_total, .. } = report.outcome else {
        panic!("expected merge");
    };
    assert_eq!(rows_total, 4);
}

#[test]
fn no_universe_and_no_dataset_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::new(&[], Vec::new());
    let err = harvester(dir.path(), &provider)
        .run(&request_until("20240108"))
        .unwrap_err();
    assert!(matches!(err, RunError::NoUniverse));
    assert_eq!(provider.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(!dir.path().join("daily.parquet").exists());
}

#[test]
fn first_run_fetches_full_range_and_writes_sorted_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let provider = TableProvider::new(
        &["600000.SH", "000001.SZ"],
        vec![
            bar("600000.SH", "20240103", 7.0),
            bar("600000.SH", "20240102", 6.9),
            bar("000001.SZ", "20240103", 9.0),
        ],
    );

    let report = harvester(dir.path(), &provider).run(&request_until("20240103")).unwrap();
    let RunOutcome::Merged { mode, window, save, .. } = report.outcome else {
        panic!("expected merge");
    };
    assert_eq!(mode, FetchMode::Full);
    assert_eq!(window.start(), d("20240102"));
    assert!(save.backup.is_none());

    let stored = storage(dir.path()).load().unwrap().unwrap();
    let symbols: Vec<&str> = stored.column(SYMBOL).unwrap().str().unwrap().into_no_null_iter().collect();
    assert_eq!(symbols, vec!["000001.SZ", "600000.SH", "600000.SH"]);
    assert_eq!(dates_for(&stored, "600000.SH"), vec![d("20240102"), d("20240103")]);
}

#[test]
fn nothing_fetched_leaves_dataset_untouched() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), &[bar("000001.SZ", "20240105", 9.2)]);
    let before = std::fs::read(dir.path().join("daily.parquet")).unwrap();
    let provider = TableProvider::new(&["000001.SZ"], Vec::new());

    let report = harvester(dir.path(), &provider).run(&request_until("20240110")).unwrap();
    assert!(matches!(report.outcome, RunOutcome::NoOp(NoOpReason::NoNewRows)));
    assert_eq!(report.stats.empty, 1);
    assert_eq!(std::fs::read(dir.path().join("daily.parquet")).unwrap(), before);
}

#[test]
fn column_mismatch_spools_batch_and_keeps_primary() {
    let dir = tempfile::tempdir().unwrap();
    let mut narrow = frame(&[bar("000001.SZ", "20240105", 9.2)])
        .drop("amount")
        .unwrap();
    storage(dir.path()).save(&mut narrow).unwrap();
    let primary = dir.path().join("daily.parquet");
    let before = std::fs::read(&primary).unwrap();

    let provider = TableProvider::new(&["000001.SZ"], vec![bar("000001.SZ", "20240108", 9.3)]);
    let err = harvester(dir.path(), &provider)
        .run(&request_until("20240108"))
        .unwrap_err();

    let RunError::Merge(failure) = err else {
        panic!("expected merge failure");
    };
    let spooled = failure.spooled.expect("batch spooled");
    assert!(spooled.exists());
    assert_eq!(spooled, dir.path().join("daily_new_only.parquet"));
    assert_eq!(std::fs::read(&primary).unwrap(), before);
}

#[test]
fn earlier_cancellation_does_not_skip_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), &[bar("000001.SZ", "20240105", 9.2)]);
    let provider = TableProvider::new(&["000001.SZ"], vec![bar("000001.SZ", "20240108", 9.3)]);
    let h = harvester(dir.path(), &provider);

    h.cancel_token().cancel();
    let report = h.run(&request_until("20240108")).unwrap();
    assert_eq!(report.stats.skipped, 0);
    assert_eq!(report.stats.fetched, 1);
    assert!(matches!(report.outcome, RunOutcome::Merged { rows_total: 2, .. }));
    assert!(!h.cancel_token().is_cancelled());
}

#[test]
fn cancellation_without_rows_fails_instead_of_noop() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), &[bar("000001.SZ", "20240105", 9.2)]);
    let primary = dir.path().join("daily.parquet");
    let before = std::fs::read(&primary).unwrap();
    let provider = TableProvider::new(&["000001.SZ", "600000.SH"], Vec::new());
    let h = harvester(dir.path(), &provider);

    *provider.cancel_on_fetch.lock().unwrap() = Some(h.cancel_token());
    let err = h.run(&request_until("20240110")).unwrap_err();
    let (completed, skipped) = match err {
        RunError::Interrupted { completed, skipped } => (completed, skipped),
        other => panic!("expected interrupted run, got {other}"),
    };
    assert!(completed >= 1);
    assert_eq!(completed + skipped, 2);
    assert_eq!(std::fs::read(&primary).unwrap(), before);

    // same harvester, no cancellation: genuinely nothing new
    *provider.cancel_on_fetch.lock().unwrap() = None;
    let report = h.run(&request_until("20240110")).unwrap();
    assert!(matches!(report.outcome, RunOutcome::NoOp(NoOpReason::NoNewRows)));
    assert_eq!(report.stats.empty, 2);
}
