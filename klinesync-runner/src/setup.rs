//! Build providers, fallback chains and storage from configuration.

use crate::pipeline::RunError;
use klinesync_core::config::{ConfigError, HarvestConfig};
use klinesync_core::data::provider::BarProvider;
use klinesync_core::data::{
    CancelToken, CircuitBreaker, CompositeFetcher, EastmoneyProvider, RequestLimiter,
    SessionProvider, StorageGateway, TdxProvider,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Consecutive 429/5xx responses before a breaker opens.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;

const SESSION_BREAKER_COOLDOWN: Duration = Duration::from_secs(300);

/// Instantiate every enabled provider once and arrange them into the list
/// and bars chains. A provider in both chains is the same instance.
pub fn build_fetcher(config: &HarvestConfig, cancel: &CancelToken) -> Result<CompositeFetcher, RunError> {
    let retry = config.retry.policy();
    let mut providers: BTreeMap<&str, Arc<dyn BarProvider>> = BTreeMap::new();

    if config.tdx.enabled {
        let tdx = TdxProvider::new(&config.tdx, config.schedule.max_workers, retry.clone(), cancel.clone());
        providers.insert("tdx", Arc::new(tdx));
    }
    if config.eastmoney.enabled {
        let limiter = Arc::new(RequestLimiter::with_interval(config.eastmoney.min_interval()));
        let breaker = Arc::new(CircuitBreaker::new(
            "eastmoney",
            config.eastmoney.breaker_cooldown(),
            BREAKER_FAILURE_THRESHOLD,
        ));
        let eastmoney =
            EastmoneyProvider::new(&config.eastmoney, limiter, breaker, retry.clone(), cancel.clone())?;
        providers.insert("eastmoney", Arc::new(eastmoney));
    }
    if config.session.enabled {
        let breaker = Arc::new(CircuitBreaker::new(
            "session",
            SESSION_BREAKER_COOLDOWN,
            BREAKER_FAILURE_THRESHOLD,
        ));
        let session = SessionProvider::new(&config.session, breaker, retry.clone(), cancel.clone())?;
        providers.insert("session", Arc::new(session));
    }

    let chain = |label: &str, order: &[String]| -> Result<Vec<Arc<dyn BarProvider>>, RunError> {
        let out: Vec<Arc<dyn BarProvider>> = order
            .iter()
            .filter_map(|name| providers.get(name.as_str()).cloned())
            .collect();
        if out.is_empty() {
            return Err(RunError::Config(ConfigError::Invalid(format!(
                "providers.{label}: no enabled provider"
            ))));
        }
        Ok(out)
    };
    let list_chain = chain("list_order", &config.providers.list_order)?;
    let bars_chain = chain("bars_order", &config.providers.bars_order)?;

    info!(
        list = ?list_chain.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
        bars = ?bars_chain.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
        "provider chains"
    );
    Ok(CompositeFetcher::new(list_chain, bars_chain))
}

pub fn build_storage(config: &HarvestConfig) -> StorageGateway {
    StorageGateway::new(
        &config.dataset.path,
        config.dataset.backup_dir(),
        config.dataset.backup_retention,
    )
}
