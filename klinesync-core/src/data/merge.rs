//! Incremental merge of a fetched batch into the existing dataset.
//!
//! Incoming rows win over existing rows with the same `(date, symbol)`, and
//! the result is sorted by `(symbol, date)`. An incoming column the existing
//! dataset does not have aborts the merge: the caller must not overwrite.

use super::frame::{conform_dates, FrameError, DATE, SYMBOL};
use super::storage::{StorageError, StorageGateway};
use polars::prelude::*;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("incoming columns missing from existing dataset: {}", .0.join(", "))]
    ColumnMismatch(Vec<String>),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("merge failed: {0}")]
    Polars(#[from] PolarsError),
}

/// A merge that could not complete. The incoming batch was spooled to
/// `spooled` when that succeeded.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct MergeFailure {
    #[source]
    pub source: MergeError,
    pub spooled: Option<PathBuf>,
    pub spool_error: Option<StorageError>,
}

/// Drop duplicate `(date, symbol)` keys keeping the last, then sort by
/// `(symbol, date)`.
pub fn canonicalize(df: DataFrame) -> Result<DataFrame, PolarsError> {
    df.lazy()
        .unique_stable(
            Some(vec![DATE.into(), SYMBOL.into()]),
            UniqueKeepStrategy::Last,
        )
        .sort(
            [SYMBOL, DATE],
            SortMultipleOptions::default()
                .with_order_descending_multi([false, false])
                .with_maintain_order(true),
        )
        .collect()
}

/// Reshape `incoming` onto `existing`'s schema: same column order and
/// dtypes, nulls for columns the batch lacks.
fn align(existing: &DataFrame, incoming: &DataFrame) -> Result<DataFrame, MergeError> {
    let height = incoming.height();
    let mut columns = Vec::with_capacity(existing.width());
    for target in existing.get_columns() {
        let name = target.name();
        let dtype = target.dtype();
        let column = match incoming.column(name) {
            Ok(src) if name.as_str() == DATE => conform_dates(src, dtype)?,
            Ok(src) if src.dtype() == dtype => src.clone(),
            Ok(src) => src.cast(dtype)?,
            Err(_) => Column::full_null(name.clone(), height, dtype),
        };
        columns.push(column);
    }
    Ok(DataFrame::new(columns)?)
}

/// Merge `incoming` into `existing`.
pub fn merge(existing: Option<&DataFrame>, incoming: DataFrame) -> Result<DataFrame, MergeError> {
    let existing = match existing {
        Some(df) if df.height() > 0 => df,
        _ => return Ok(canonicalize(incoming)?),
    };

    let unknown: Vec<String> = incoming
        .get_column_names()
        .into_iter()
        .filter(|n| existing.column(n.as_str()).is_err())
        .map(|n| n.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(MergeError::ColumnMismatch(unknown));
    }

    let aligned = align(existing, &incoming)?;
    let combined = existing.vstack(&aligned)?;
    Ok(canonicalize(combined)?)
}

/// [`merge`], spooling the incoming batch for manual recovery on any failure.
pub fn merge_or_spool(
    storage: &StorageGateway,
    existing: Option<&DataFrame>,
    incoming: DataFrame,
) -> Result<DataFrame, MergeFailure> {
    let backup = incoming.clone();
    match merge(existing, incoming) {
        Ok(merged) => {
            info!(rows = merged.height(), "merged dataset");
            Ok(merged)
        }
        Err(source) => {
            error!(error = %source, "merge failed, existing dataset left untouched");
            let (spooled, spool_error) = match storage.spool(&backup) {
                Ok(path) => {
                    error!(path = %path.display(), rows = backup.height(), "incoming batch spooled");
                    (Some(path), None)
                }
                Err(e) => {
                    error!(error = %e, "could not spool incoming batch");
                    (None, Some(e))
                }
            };
            Err(MergeFailure {
                source,
                spooled,
                spool_error,
            })
        }
    }
}
