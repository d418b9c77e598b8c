//! Bounded parallel fetch of every symbol in the universe.
//!
//! Tasks run on a dedicated rayon pool and report over a channel, so results
//! are consumed in completion order. The collector owns the run deadline:
//! when it passes, the shared cancel token is tripped, queued tasks report
//! as skipped, retry sleeps wake up, and whatever already completed is kept.

use crate::pipeline::RunError;
use crate::stats::RunStats;
use klinesync_core::data::{CancelToken, CompositeFetch, CompositeFetcher, Outcome};
use klinesync_core::domain::{BarRecord, FetchWindow, SymbolDescriptor};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROGRESS_EVERY: usize = 100;

enum TaskReport {
    Done { symbol: String, fetch: CompositeFetch },
    Skipped,
}

#[derive(Debug)]
pub struct FanOutResult {
    pub rows: Vec<BarRecord>,
    pub stats: RunStats,
}

#[derive(Debug, Clone)]
pub struct FanOut {
    workers: usize,
    deadline: Option<Duration>,
    desync_pause: Duration,
}

impl FanOut {
    /// At least one worker. `deadline` is measured from the start of `run`.
    pub fn new(workers: usize, deadline: Option<Duration>, desync_pause: Duration) -> Self {
        Self {
            workers: workers.max(1),
            deadline,
            desync_pause,
        }
    }

    /// Fetch every symbol and collect rows in completion order.
    pub fn run(
        &self,
        fetcher: &CompositeFetcher,
        symbols: &[SymbolDescriptor],
        window: &FetchWindow,
        cancel: &CancelToken,
    ) -> Result<FanOutResult, RunError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("klinesync-fetch-{i}"))
            .build()
            .map_err(|e| RunError::Pool(e.to_string()))?;

        let started = Instant::now();
        let deadline = self.deadline.map(|d| started + d);
        let mut stats = RunStats::new(symbols.len());
        let mut rows = Vec::new();
        let mut desync_reset = false;

        info!(symbols = symbols.len(), workers = self.workers, window = %window, "fetch started");

        let (tx, rx) = mpsc::channel::<TaskReport>();
        std::thread::scope(|scope| {
            let pool = &pool;
            scope.spawn(move || {
                pool.scope(|s| {
                    for symbol in symbols {
                        let tx = tx.clone();
                        s.spawn(move |_| {
                            let report = if cancel.is_cancelled() {
                                TaskReport::Skipped
                            } else {
                                TaskReport::Done {
                                    symbol: symbol.symbol.clone(),
                                    fetch: fetcher.fetch_bars(symbol, window),
                                }
                            };
                            let _ = tx.send(report);
                        });
                    }
                });
            });

            loop {
                let received = match deadline {
                    Some(at) if !cancel.is_cancelled() => {
                        rx.recv_timeout(at.saturating_duration_since(Instant::now()))
                    }
                    _ => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                let report = match received {
                    Ok(report) => report,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            completed = stats.completed(),
                            total = stats.total,
                            "run deadline reached, cancelling outstanding fetches"
                        );
                        stats.timed_out = true;
                        cancel.cancel();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                match report {
                    TaskReport::Skipped => stats.skipped += 1,
                    TaskReport::Done { symbol, fetch } => {
                        stats.record(&fetch);
                        for failure in &fetch.failures {
                            debug!(symbol = %symbol, provider = %failure.provider, error = %failure.error, "provider failed");
                        }
                        let saw_desync = fetch.saw_desync();
                        match fetch.outcome {
                            Outcome::Data(batch) => rows.extend(batch),
                            Outcome::Empty => debug!(symbol = %symbol, "no bars in window"),
                            Outcome::Failed(e) => {
                                warn!(symbol = %symbol, error = %e, "all providers failed, skipping symbol")
                            }
                        }
                        if saw_desync && !desync_reset {
                            desync_reset = true;
                            stats.desync_resets += 1;
                            warn!(symbol = %symbol, "protocol desync, resetting socket connections");
                            fetcher.reset_connections();
                            cancel.sleep(self.desync_pause);
                        }
                    }
                }

                let done = stats.completed() + stats.skipped;
                if done % PROGRESS_EVERY == 0 {
                    info!(done, total = stats.total, rows = rows.len(), "fetch progress");
                }
            }
        });

        stats.elapsed = started.elapsed();
        stats.providers = fetcher.stats();
        Ok(FanOutResult { rows, stats })
    }
}
