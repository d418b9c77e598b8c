//! Harvest configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration.

use crate::data::retry::RetryPolicy;
use crate::domain::{parse_yyyymmdd, DateError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Provider names accepted in `[providers]` orders.
pub const PROVIDER_NAMES: [&str; 3] = ["tdx", "session", "eastmoney"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid start_date: {0}")]
    StartDate(#[from] DateError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub dataset: DatasetConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub tdx: TdxConfig,
    pub eastmoney: EastmoneyConfig,
    pub session: SessionConfig,
    pub providers: ProviderOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub path: PathBuf,
    /// Defaults to `backups/` next to `path`.
    pub backup_dir: Option<PathBuf>,
    pub backup_retention: usize,
    /// First date of a full refresh, `YYYYMMDD`.
    pub start_date: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/stock_daily_latest.parquet"),
            backup_dir: None,
            backup_retention: 5,
            start_date: "20150101".into(),
        }
    }
}

impl DatasetConfig {
    /// Configured backup directory, or `backups/` next to the dataset.
    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("backups"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub max_workers: usize,
    /// Whole-run deadline in seconds; 0 disables it.
    pub run_timeout_secs: u64,
    /// Exchange close, `HH:MM`, in `timezone`.
    pub market_close: String,
    pub timezone: String,
    pub desync_reset_pause_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            run_timeout_secs: 3600,
            market_close: "15:00".into(),
            timezone: "Asia/Shanghai".into(),
            desync_reset_pause_ms: 500,
        }
    }
}

impl ScheduleConfig {
    /// `None` when the deadline is disabled (0).
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn desync_reset_pause(&self) -> Duration {
        Duration::from_millis(self.desync_reset_pause_ms)
    }

    pub fn market_close_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.market_close, "%H:%M")
            .map_err(|e| ConfigError::Invalid(format!("market_close '{}': {e}", self.market_close)))
    }

    /// Exchange timezone.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::Invalid(format!("timezone '{}': {e}", self.timezone)))
    }

    /// Current wall-clock time at the exchange.
    pub fn exchange_now(&self) -> Result<NaiveDateTime, ConfigError> {
        Ok(Utc::now().with_timezone(&self.tz()?).naive_local())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TdxConfig {
    pub enabled: bool,
    /// `host:port`, tried in order.
    pub servers: Vec<String>,
    pub timeout_secs: u64,
    /// Most recent bars requested per symbol; the window is applied locally.
    pub lookback_bars: u16,
}

impl Default for TdxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: vec![
                "119.147.212.81:7709".into(),
                "14.215.128.18:7709".into(),
                "59.173.18.140:7709".into(),
                "180.153.18.170:7709".into(),
            ],
            timeout_secs: 10,
            lookback_bars: 400,
        }
    }
}

impl TdxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EastmoneyConfig {
    pub enabled: bool,
    pub kline_url: String,
    pub list_url: String,
    pub timeout_secs: u64,
    /// Minimum spacing between requests across all workers.
    pub min_interval_ms: u64,
    pub breaker_cooldown_secs: u64,
}

impl Default for EastmoneyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kline_url: "https://push2his.eastmoney.com/api/qt/stock/kline/get".into(),
            list_url: "https://push2.eastmoney.com/api/qt/clist/get".into(),
            timeout_secs: 15,
            min_interval_ms: 200,
            breaker_cooldown_secs: 1800,
        }
    }
}

impl EastmoneyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:8700".into(),
            user: "anonymous".into(),
            password: "123456".into(),
            timeout_secs: 15,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOrder {
    pub bars_order: Vec<String>,
    pub list_order: Vec<String>,
}

impl Default for ProviderOrder {
    fn default() -> Self {
        Self {
            bars_order: vec!["tdx".into(), "session".into(), "eastmoney".into()],
            list_order: vec!["session".into(), "tdx".into(), "eastmoney".into()],
        }
    }
}

impl HarvestConfig {
    /// Load and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text. Missing sections take their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// First date of a full fetch.
    pub fn start_date(&self) -> Result<NaiveDate, ConfigError> {
        Ok(parse_yyyymmdd(&self.dataset.start_date)?)
    }

    /// Whether the named provider is switched on. Unknown names are not.
    pub fn is_enabled(&self, provider: &str) -> bool {
        match provider {
            "tdx" => self.tdx.enabled,
            "session" => self.session.enabled,
            "eastmoney" => self.eastmoney.enabled,
            _ => false,
        }
    }

    /// Reject configurations a run could not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.max_workers == 0 {
            return Err(ConfigError::Invalid("schedule.max_workers must be at least 1".into()));
        }
        self.schedule.tz()?;
        self.schedule.market_close_time()?;
        self.start_date()?;
        if self.dataset.backup_retention == 0 {
            return Err(ConfigError::Invalid("dataset.backup_retention must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
            return Err(ConfigError::Invalid("retry.backoff_factor must be >= 1".into()));
        }
        for (label, order) in [
            ("bars_order", &self.providers.bars_order),
            ("list_order", &self.providers.list_order),
        ] {
            if order.is_empty() {
                return Err(ConfigError::Invalid(format!("providers.{label} is empty")));
            }
            if let Some(unknown) = order.iter().find(|p| !PROVIDER_NAMES.contains(&p.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{label}: unknown provider '{unknown}'"
                )));
            }
            if !order.iter().any(|p| self.is_enabled(p)) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{label}: no enabled provider"
                )));
            }
        }
        if self.tdx.enabled && self.tdx.servers.is_empty() {
            return Err(ConfigError::Invalid("tdx.servers is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config = HarvestConfig::from_toml("").unwrap();
        assert_eq!(config, HarvestConfig::default());
        assert_eq!(config.schedule.max_workers, 8);
        assert_eq!(config.dataset.backup_dir(), PathBuf::from("data/backups"));
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = HarvestConfig::from_toml(
            r#"
            [schedule]
            max_workers = 2
            run_timeout_secs = 0

            [dataset]
            path = "/tmp/k.parquet"
            "#,
        )
        .unwrap();
        assert_eq!(config.schedule.max_workers, 2);
        assert_eq!(config.schedule.run_timeout(), None);
        assert_eq!(config.schedule.timezone, "Asia/Shanghai");
        assert_eq!(config.dataset.backup_dir(), PathBuf::from("/tmp/backups"));
        assert_eq!(config.dataset.backup_retention, 5);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            "[schedule]\nmax_workers = 0",
            "[schedule]\ntimezone = \"Mars/Olympus\"",
            "[schedule]\nmarket_close = \"3pm\"",
            "[dataset]\nstart_date = \"2015-01-01\"",
            "[providers]\nbars_order = []",
            "[providers]\nlist_order = [\"yahoo\"]",
            "[tdx]\nservers = []",
        ];
        for case in cases {
            assert!(HarvestConfig::from_toml(case).is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = HarvestConfig::default().to_toml().unwrap();
        assert_eq!(HarvestConfig::from_toml(&text).unwrap(), HarvestConfig::default());
    }

    #[test]
    fn schedule_parses_close_and_zone() {
        let s = ScheduleConfig::default();
        assert_eq!(s.market_close_time().unwrap(), NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        assert_eq!(s.tz().unwrap(), chrono_tz::Asia::Shanghai);
        assert!(s.exchange_now().is_ok());
    }
}
