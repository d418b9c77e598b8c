//! Symbol universe resolution with fallback to the stored dataset.

use klinesync_core::data::frame::{distinct_symbols, FrameError, NAME, SYMBOL};
use klinesync_core::data::CompositeFetcher;
use klinesync_core::domain::SymbolDescriptor;
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniverseSource {
    Providers,
    ExistingDataset,
}

#[derive(Debug, Clone)]
pub struct Universe {
    pub symbols: Vec<SymbolDescriptor>,
    pub source: UniverseSource,
}

/// Symbols to fetch this run, or `None` when neither the providers nor the
/// stored dataset yield any.
pub fn resolve_universe(
    fetcher: &CompositeFetcher,
    existing: Option<&DataFrame>,
) -> Result<Option<Universe>, FrameError> {
    let listed = dedup(fetcher.list_symbols());
    if !listed.is_empty() {
        info!(count = listed.len(), "symbol universe from providers");
        return Ok(Some(Universe {
            symbols: listed,
            source: UniverseSource::Providers,
        }));
    }

    let Some(df) = existing else {
        return Ok(None);
    };
    let stored = symbols_from_dataset(df)?;
    if stored.is_empty() {
        return Ok(None);
    }
    warn!(
        count = stored.len(),
        "no provider returned a symbol list, using symbols already stored"
    );
    Ok(Some(Universe {
        symbols: stored,
        source: UniverseSource::ExistingDataset,
    }))
}

fn dedup(symbols: Vec<SymbolDescriptor>) -> Vec<SymbolDescriptor> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter(|s| seen.insert(s.symbol.clone()))
        .collect()
}

/// Distinct symbols of a stored dataset, with the last stored name when a
/// name column exists.
pub fn symbols_from_dataset(df: &DataFrame) -> Result<Vec<SymbolDescriptor>, FrameError> {
    let names = stored_names(df)?;
    let mut out = Vec::new();
    for symbol in distinct_symbols(df)? {
        match SymbolDescriptor::from_symbol(&symbol) {
            Ok(mut descriptor) => {
                if let Some(name) = names.get(&symbol) {
                    descriptor.name = name.clone();
                }
                out.push(descriptor);
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "skipping stored symbol"),
        }
    }
    Ok(out)
}

fn stored_names(df: &DataFrame) -> Result<HashMap<String, String>, FrameError> {
    let (Ok(symbols), Ok(names)) = (df.column(SYMBOL), df.column(NAME)) else {
        return Ok(HashMap::new());
    };
    let names = names.cast(&DataType::String)?;
    Ok(symbols
        .str()?
        .into_iter()
        .zip(names.str()?.into_iter())
        .filter_map(|(s, n)| match (s, n) {
            (Some(s), Some(n)) if !n.is_empty() => Some((s.to_string(), n.to_string())),
            _ => None,
        })
        .collect())
}
