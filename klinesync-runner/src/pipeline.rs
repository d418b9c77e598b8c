//! One harvest run: window, universe, fan-out, consolidate, validate,
//! merge, persist.

use crate::fanout::FanOut;
use crate::setup::{build_fetcher, build_storage};
use crate::stats::RunStats;
use crate::universe::{resolve_universe, UniverseSource};
use crate::window::{plan_window, FetchMode, WindowPlan};
use chrono::NaiveDate;
use klinesync_core::config::{ConfigError, HarvestConfig};
use klinesync_core::data::frame::{bars_to_frame, coerce_numeric, date_bounds, FrameError};
use klinesync_core::data::{
    merge_or_spool, validate, CancelToken, CompositeFetcher, MergeFailure, ProviderError,
    SaveReport, StorageError, StorageGateway, ValidationReport,
};
use klinesync_core::domain::{default_end_date, FetchWindow, TradingCalendar, WeekdayCalendar, WindowError};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("provider setup: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("fetch window: {0}")]
    Window(#[from] WindowError),

    #[error("no symbol universe: every list source failed and no dataset is stored")]
    NoUniverse,

    #[error("merge aborted, stored dataset untouched: {0}")]
    Merge(#[from] MergeFailure),

    #[error("worker pool: {0}")]
    Pool(String),

    /// Cancelled (by the run deadline or the caller) before any rows arrived.
    #[error("run interrupted before any rows arrived: {completed} symbols answered, {skipped} skipped")]
    Interrupted { completed: usize, skipped: usize },
}

/// Overrides for one run. Unset fields come from configuration.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub full_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpReason {
    /// Stored data already covers the requested end date.
    UpToDate { last: NaiveDate },
    /// Every symbol came back empty or failed.
    NoNewRows,
}

#[derive(Debug)]
pub enum RunOutcome {
    NoOp(NoOpReason),
    Merged {
        window: FetchWindow,
        mode: FetchMode,
        rows_fetched: usize,
        rows_total: usize,
        save: SaveReport,
    },
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stats: RunStats,
    pub validation: Option<ValidationReport>,
    pub universe: Option<UniverseSource>,
}

impl RunReport {
    fn no_op(reason: NoOpReason, stats: RunStats) -> Self {
        Self {
            outcome: RunOutcome::NoOp(reason),
            stats,
            validation: None,
            universe: None,
        }
    }
}

/// Runs harvests against one dataset with one set of providers.
pub struct Harvester {
    config: HarvestConfig,
    fetcher: CompositeFetcher,
    storage: StorageGateway,
    calendar: Box<dyn TradingCalendar>,
    cancel: CancelToken,
}

impl Harvester {
    /// Build providers and storage from `config`.
    pub fn from_config(config: HarvestConfig) -> Result<Self, RunError> {
        config.validate()?;
        let cancel = CancelToken::new();
        let fetcher = build_fetcher(&config, &cancel)?;
        let storage = build_storage(&config);
        Ok(Self::new(config, fetcher, storage, cancel))
    }

    /// `cancel` must be the token the fetcher's providers were built with.
    pub fn new(
        config: HarvestConfig,
        fetcher: CompositeFetcher,
        storage: StorageGateway,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            fetcher,
            storage,
            calendar: Box::new(WeekdayCalendar),
            cancel,
        }
    }

    /// Replace the weekend-only calendar.
    pub fn with_calendar(mut self, calendar: Box<dyn TradingCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn storage(&self) -> &StorageGateway {
        &self.storage
    }

    /// Token shared with every provider. Cancelling it stops the current
    /// run; each new run starts with it cleared.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn resolve_end(&self, request: &RunRequest) -> Result<NaiveDate, RunError> {
        if let Some(end) = request.end {
            return Ok(end);
        }
        let schedule = &self.config.schedule;
        Ok(default_end_date(
            schedule.exchange_now()?,
            schedule.market_close_time()?,
            self.calendar.as_ref(),
        ))
    }

    /// Fetch everything missing up to the end date and merge it into the
    /// stored dataset. Per-symbol failures are logged and counted; merge and
    /// storage failures abort the run with the stored dataset intact.
    pub fn run(&self, request: &RunRequest) -> Result<RunReport, RunError> {
        let started = Instant::now();
        self.cancel.reset();

        let existing = self.storage.load()?;
        let existing_last = match &existing {
            Some(df) => date_bounds(df)?.map(|(_, last)| last),
            None => None,
        };
        let full_start = match request.start {
            Some(start) => start,
            None => self.config.start_date()?,
        };
        let end = self.resolve_end(request)?;

        let (window, mode) = match plan_window(
            existing_last,
            full_start,
            end,
            request.full_refresh,
            self.calendar.as_ref(),
        )? {
            WindowPlan::UpToDate { last } => {
                info!(last = %last, end = %end, "dataset is up to date, nothing to fetch");
                return Ok(RunReport::no_op(NoOpReason::UpToDate { last }, RunStats::default()));
            }
            WindowPlan::Fetch { window, mode } => (window, mode),
        };
        info!(window = %window, mode = ?mode, "fetch window");

        let universe = resolve_universe(&self.fetcher, existing.as_ref())?.ok_or_else(|| {
            error!("no symbol universe available, aborting run");
            RunError::NoUniverse
        })?;

        let schedule = &self.config.schedule;
        let fanout = FanOut::new(
            schedule.max_workers,
            schedule.run_timeout(),
            schedule.desync_reset_pause(),
        );
        let fetched = fanout.run(&self.fetcher, &universe.symbols, &window, &self.cancel)?;
        let mut stats = fetched.stats;
        stats.elapsed = started.elapsed();
        stats.log_summary("daily kline fetch");

        if fetched.rows.is_empty() && self.cancel.is_cancelled() {
            error!(
                completed = stats.completed(),
                skipped = stats.skipped,
                timed_out = stats.timed_out,
                "run cancelled before any rows arrived, dataset left as is"
            );
            return Err(RunError::Interrupted {
                completed: stats.completed(),
                skipped: stats.skipped,
            });
        }
        if fetched.rows.is_empty() {
            warn!(window = %window, "no rows fetched, dataset left as is");
            let mut report = RunReport::no_op(NoOpReason::NoNewRows, stats);
            report.universe = Some(universe.source);
            return Ok(report);
        }

        let incoming = coerce_numeric(bars_to_frame(&fetched.rows)?)?;
        let rows_fetched = incoming.height();

        let validation = validate(&incoming);
        if validation.is_valid {
            info!(rows = rows_fetched, "fetched batch passed validation");
        } else {
            for finding in &validation.findings {
                warn!(finding = %finding, "validation finding");
            }
        }

        let mut merged = merge_or_spool(&self.storage, existing.as_ref(), incoming)?;
        let rows_total = merged.height();
        let save = self.storage.save(&mut merged)?;
        info!(
            rows_fetched,
            rows_total,
            backup = ?save.backup,
            elapsed = format!("{:.1}s", started.elapsed().as_secs_f64()),
            "run complete"
        );

        Ok(RunReport {
            outcome: RunOutcome::Merged {
                window,
                mode,
                rows_fetched,
                rows_total,
                save,
            },
            stats,
            validation: Some(validation),
            universe: Some(universe.source),
        })
    }
}
