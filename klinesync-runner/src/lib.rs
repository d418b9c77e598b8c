//! klinesync runner: drives one acquisition run on top of `klinesync-core`.
//!
//! - Window planning (incremental continuation or full refresh)
//! - Symbol universe from providers, falling back to the stored dataset
//! - Bounded rayon fan-out with a run deadline and a one-time desync reset
//! - Consolidation, advisory validation, merge and backed-up save

pub mod fanout;
pub mod pipeline;
pub mod setup;
pub mod stats;
pub mod universe;
pub mod window;

pub use fanout::{FanOut, FanOutResult};
pub use pipeline::{Harvester, NoOpReason, RunError, RunOutcome, RunReport, RunRequest};
pub use setup::{build_fetcher, build_storage};
pub use stats::RunStats;
pub use universe::{resolve_universe, Universe, UniverseSource};
pub use window::{plan_window, FetchMode, WindowPlan};
