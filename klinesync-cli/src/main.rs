//! klinesync CLI: daily kline acquisition and dataset maintenance.
//!
//! Commands:
//! - `fetch`: run one incremental (or `--full`) acquisition and merge
//! - `status`: row/symbol counts, date bounds and backups of the dataset
//! - `backups`: list backups, newest first
//! - `restore`: copy the newest (or a named) backup over the dataset
//! - `config`: print the effective configuration as TOML

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use klinesync_core::config::HarvestConfig;
use klinesync_core::domain::{normalize_date_text, parse_yyyymmdd};
use klinesync_runner::{build_storage, Harvester, NoOpReason, RunOutcome, RunReport, RunRequest};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "klinesync.toml";

#[derive(Parser)]
#[command(name = "klinesync", about = "Resilient A-share daily kline acquisition")]
struct Cli {
    /// Config file. Defaults to ./klinesync.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level for klinesync targets, overridden by RUST_LOG.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new bars and merge them into the dataset.
    Fetch {
        /// Start of a full refresh (YYYYMMDD). Defaults to dataset.start_date.
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYYMMDD). Defaults to the last closed trading day.
        #[arg(long)]
        end: Option<String>,

        /// Refetch the whole range instead of continuing from the stored data.
        #[arg(long, default_value_t = false)]
        full: bool,

        /// Worker pool size.
        #[arg(long)]
        workers: Option<usize>,

        /// Dataset path.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the run statistics as JSON on stdout.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Describe the stored dataset and its backups.
    Status,
    /// List backups, newest first.
    Backups,
    /// Restore the dataset from a backup.
    Restore {
        /// Backup file. Defaults to the newest.
        #[arg(long)]
        backup: Option<PathBuf>,
    },
    /// Print the effective configuration.
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch {
            start,
            end,
            full,
            workers,
            output,
            json,
        } => run_fetch(config, start, end, full, workers, output, json),
        Commands::Status => run_status(&config),
        Commands::Backups => run_backups(&config),
        Commands::Restore { backup } => run_restore(&config, backup),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("klinesync={level},klinesync_core={level},klinesync_runner={level}").into()
    });
    let json = matches!(format, LogFormat::Json);
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<HarvestConfig> {
    match path {
        Some(path) => HarvestConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => HarvestConfig::from_file(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("loading config {DEFAULT_CONFIG}")),
        None => {
            tracing::debug!("no config file, using defaults");
            Ok(HarvestConfig::default())
        }
    }
}

fn parse_date_arg(flag: &str, value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|raw| {
            parse_yyyymmdd(&normalize_date_text(&raw))
                .with_context(|| format!("--{flag} '{raw}' is not a YYYYMMDD date"))
        })
        .transpose()
}

fn run_fetch(
    mut config: HarvestConfig,
    start: Option<String>,
    end: Option<String>,
    full: bool,
    workers: Option<usize>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    if let Some(workers) = workers {
        config.schedule.max_workers = workers;
    }
    if let Some(output) = output {
        config.dataset.path = output;
    }
    let request = RunRequest {
        start: parse_date_arg("start", start)?,
        end: parse_date_arg("end", end)?,
        full_refresh: full,
    };

    let harvester = Harvester::from_config(config).context("building harvester")?;
    match harvester.run(&request) {
        Ok(report) => {
            print_report(&report);
            if json {
                println!("{}", serde_json::to_string_pretty(&report.stats)?);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            eprintln!("Run failed: {e}");
            std::process::exit(1);
        }
    }
}

fn print_report(report: &RunReport) {
    match &report.outcome {
        RunOutcome::NoOp(NoOpReason::UpToDate { last }) => {
            println!("Up to date: dataset already ends on {last}");
        }
        RunOutcome::NoOp(NoOpReason::NoNewRows) => {
            println!(
                "No new rows: {} symbols empty, {} failed",
                report.stats.empty, report.stats.failed
            );
        }
        RunOutcome::Merged {
            window,
            mode,
            rows_fetched,
            rows_total,
            save,
        } => {
            println!("Merged {rows_fetched} rows ({mode:?}, {window}); dataset now {rows_total} rows");
            println!(
                "Symbols: {} fetched, {} empty, {} failed, {} skipped",
                report.stats.fetched, report.stats.empty, report.stats.failed, report.stats.skipped
            );
            if let Some(backup) = &save.backup {
                println!("Backup: {}", backup.display());
            }
            if report.stats.timed_out {
                println!("Run deadline reached; merged what completed");
            }
        }
    }
    if let Some(validation) = report.validation.as_ref().filter(|v| !v.is_valid) {
        println!("Validation findings:");
        for finding in &validation.findings {
            println!("  - {finding}");
        }
    }
}

fn run_status(config: &HarvestConfig) -> Result<()> {
    let storage = build_storage(config);
    match storage.describe().context("reading dataset")? {
        None => println!("No dataset at {}", storage.primary().display()),
        Some(summary) => {
            let range = match (summary.first_date, summary.last_date) {
                (Some(first), Some(last)) => format!("{first} to {last}"),
                _ => "(no valid dates)".into(),
            };
            println!("Dataset: {}", summary.path.display());
            println!("Rows: {}", summary.rows);
            println!("Symbols: {}", summary.symbols);
            println!("Dates: {range}");
            println!("Size: {}", format_size(summary.bytes));
            println!("BLAKE3: {}", summary.digest);
        }
    }
    println!();
    run_backups(config)
}

fn run_backups(config: &HarvestConfig) -> Result<()> {
    let storage = build_storage(config);
    let backups = storage.list_backups().context("listing backups")?;
    if backups.is_empty() {
        println!("No backups in {}", storage.backup_dir().display());
        return Ok(());
    }
    println!("{:<24} {:>10}  {}", "Taken", "Size", "Path");
    println!("{}", "-".repeat(60));
    for b in &backups {
        println!(
            "{:<24} {:>10}  {}",
            b.taken_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            format_size(b.bytes),
            b.path.display()
        );
    }
    Ok(())
}

fn run_restore(config: &HarvestConfig, backup: Option<PathBuf>) -> Result<()> {
    let storage = build_storage(config);
    let restored = match backup {
        Some(path) => {
            storage
                .restore(&path)
                .with_context(|| format!("restoring {}", path.display()))?;
            path
        }
        None => storage.restore_latest().context("restoring newest backup")?,
    };
    println!(
        "Restored {} from {}",
        storage.primary().display(),
        restored.display()
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_fetch_flags() {
        let cli = Cli::try_parse_from([
            "klinesync", "--log-format", "json", "fetch", "--end", "2024-01-10", "--full", "--workers", "4",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        let Commands::Fetch { end, full, workers, .. } = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(parse_date_arg("end", end).unwrap(), NaiveDate::from_ymd_opt(2024, 1, 10));
        assert!(full);
        assert_eq!(workers, Some(4));
    }

    #[test]
    fn bad_date_arg_is_an_error() {
        assert!(parse_date_arg("start", Some("2024-13-01".into())).is_err());
        assert_eq!(parse_date_arg("start", None).unwrap(), None);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
