//! Storage gateway: whole-file parquet persistence with backup discipline.
//!
//! `save` copies the current file into the backup directory, writes the new
//! version, then prunes old backups. If the write fails the newest backup is
//! copied back so the primary file is never left partial or missing. A
//! failed restore is reported as [`StorageError::RestoreFailed`].
//!
//! Backups are named `{stem}_{YYYYmmdd_HHMMSS_mmm}{ext}`; the recovery spool
//! is `{stem}_new_only.parquet` next to the primary file.

use super::frame::{date_bounds, distinct_symbols, FrameError};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

const BACKUP_STAMP: &str = "%Y%m%d_%H%M%S_%3f";
const BACKUP_STAMP_LEN: usize = 19;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parquet {action} {}: {source}", path.display())]
    Parquet {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: PolarsError,
    },

    #[error("write to {} failed ({reason}); restored from {}", path.display(), restored_from.display())]
    WriteFailedRestored {
        path: PathBuf,
        reason: String,
        restored_from: PathBuf,
    },

    #[error("write to {} failed ({reason}); no backup existed", path.display())]
    WriteFailed { path: PathBuf, reason: String },

    #[error("DATA LOSS POSSIBLE: write to {} failed ({write_error}) and restore from {} failed ({restore_error})", path.display(), backup.display())]
    RestoreFailed {
        path: PathBuf,
        backup: PathBuf,
        write_error: String,
        restore_error: String,
    },

    #[error("no backups in {}", .0.display())]
    NoBackup(PathBuf),

    #[error("restored file digest {actual} does not match backup {expected}")]
    DigestMismatch { expected: String, actual: String },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StorageError + 'a {
    move |source| StorageError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Writes a frame to a path. Swappable so tests can simulate failing disks.
pub trait FrameSink: Send + Sync {
    fn write(&self, df: &mut DataFrame, path: &Path) -> Result<(), StorageError>;
}

/// Parquet writer with tmp-then-rename.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetSink;

impl FrameSink for ParquetSink {
    fn write(&self, df: &mut DataFrame, path: &Path) -> Result<(), StorageError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let file = fs::File::create(&tmp).map_err(io_err("create", &tmp))?;
        if let Err(source) = ParquetWriter::new(file).finish(df) {
            let _ = fs::remove_file(&tmp);
            return Err(StorageError::Parquet {
                action: "write",
                path: tmp,
                source,
            });
        }
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err("rename", path)(e)
        })
    }
}

/// Read a whole parquet file.
pub fn read_parquet(path: &Path) -> Result<DataFrame, StorageError> {
    let file = fs::File::open(path).map_err(io_err("open", path))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|source| StorageError::Parquet {
            action: "read",
            path: path.to_path_buf(),
            source,
        })
}

/// blake3 digest of a file's bytes.
pub fn file_digest(path: &Path) -> Result<String, StorageError> {
    let bytes = fs::read(path).map_err(io_err("read", path))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Digest of `path`, which must equal `expected`.
pub fn verify_digest(path: &Path, expected: &str) -> Result<String, StorageError> {
    let actual = file_digest(path)?;
    if actual != expected {
        return Err(StorageError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}

/// One timestamped copy of the primary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub taken_at: NaiveDateTime,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SaveReport {
    pub rows: usize,
    pub backup: Option<PathBuf>,
    pub pruned: usize,
}

/// What `status` prints about the persisted dataset.
#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub symbols: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub bytes: u64,
    pub digest: String,
}

/// Owns the primary dataset file, its backup directory and the spool file.
pub struct StorageGateway {
    primary: PathBuf,
    backup_dir: PathBuf,
    retention: usize,
    sink: Box<dyn FrameSink>,
}

impl StorageGateway {
    /// Gateway writing parquet to `primary`, keeping at most `retention`
    /// backups (at least one) in `backup_dir`.
    pub fn new(primary: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self::with_sink(primary, backup_dir, retention, Box::new(ParquetSink))
    }

    /// Like [`StorageGateway::new`] with a custom writer.
    pub fn with_sink(
        primary: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        retention: usize,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            primary: primary.into(),
            backup_dir: backup_dir.into(),
            retention: retention.max(1),
            sink,
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn stem(&self) -> String {
        self.primary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".into())
    }

    fn extension(&self) -> String {
        self.primary
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }

    /// Where an unmergeable batch is written.
    pub fn spool_path(&self) -> PathBuf {
        self.primary
            .with_file_name(format!("{}_new_only.parquet", self.stem()))
    }

    /// Read the persisted dataset. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<DataFrame>, StorageError> {
        if !self.primary.exists() {
            return Ok(None);
        }
        read_parquet(&self.primary).map(Some)
    }

    /// Persist `df` as the new primary file.
    pub fn save(&self, df: &mut DataFrame) -> Result<SaveReport, StorageError> {
        if let Some(parent) = self.primary.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err("create dir", parent))?;
        }
        let backup = self.backup_if_exists()?;

        if let Err(e) = self.sink.write(df, &self.primary) {
            let reason = e.to_string();
            error!(path = %self.primary.display(), error = %reason, "dataset write failed");
            return Err(match backup {
                Some(backup) => match self.copy_into_primary(&backup) {
                    Ok(()) => {
                        warn!(backup = %backup.display(), "primary restored from backup");
                        StorageError::WriteFailedRestored {
                            path: self.primary.clone(),
                            reason,
                            restored_from: backup,
                        }
                    }
                    Err(restore) => {
                        error!(
                            path = %self.primary.display(),
                            backup = %backup.display(),
                            error = %restore,
                            "RESTORE FAILED: dataset may be lost"
                        );
                        StorageError::RestoreFailed {
                            path: self.primary.clone(),
                            backup,
                            write_error: reason,
                            restore_error: restore.to_string(),
                        }
                    }
                },
                None => {
                    let _ = fs::remove_file(&self.primary);
                    StorageError::WriteFailed {
                        path: self.primary.clone(),
                        reason,
                    }
                }
            });
        }

        info!(rows = df.height(), path = %self.primary.display(), "dataset saved");
        let pruned = self.prune();
        Ok(SaveReport {
            rows: df.height(),
            backup,
            pruned,
        })
    }

    fn backup_if_exists(&self) -> Result<Option<PathBuf>, StorageError> {
        if !self.primary.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backup_dir).map_err(io_err("create dir", &self.backup_dir))?;

        let stamp = chrono::Local::now().format(BACKUP_STAMP).to_string();
        let (stem, ext) = (self.stem(), self.extension());
        let mut target = self.backup_dir.join(format!("{stem}_{stamp}{ext}"));
        let mut n = 1;
        while target.exists() {
            target = self.backup_dir.join(format!("{stem}_{stamp}_{n}{ext}"));
            n += 1;
        }
        fs::copy(&self.primary, &target).map_err(io_err("backup", &target))?;
        info!(backup = %target.display(), "backup taken");
        Ok(Some(target))
    }

    /// Delete backups beyond the retention count, oldest first. Failures are
    /// logged, not returned.
    fn prune(&self) -> usize {
        let backups = match self.list_backups() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "cannot list backups for pruning");
                return 0;
            }
        };
        let mut pruned = 0;
        for old in backups.iter().skip(self.retention) {
            match fs::remove_file(&old.path) {
                Ok(()) => pruned += 1,
                Err(e) => warn!(path = %old.path.display(), error = %e, "cannot prune backup"),
            }
        }
        pruned
    }

    /// Backups of the primary file, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>, StorageError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", self.stem());
        let ext = self.extension();
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.backup_dir).map_err(io_err("read dir", &self.backup_dir))? {
            let entry = entry.map_err(io_err("read dir", &self.backup_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(middle) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(ext.as_str()))
            else {
                continue;
            };
            let Some(stamp) = middle.get(..BACKUP_STAMP_LEN) else {
                continue;
            };
            let Ok(taken_at) = NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP) else {
                continue;
            };
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(BackupEntry {
                path: entry.path(),
                taken_at,
                bytes,
            });
        }
        out.sort_by(|a, b| b.path.file_name().cmp(&a.path.file_name()));
        Ok(out)
    }

    fn copy_into_primary(&self, backup: &Path) -> Result<(), StorageError> {
        let mut tmp = self.primary.as_os_str().to_owned();
        tmp.push(".restore");
        let tmp = PathBuf::from(tmp);
        fs::copy(backup, &tmp).map_err(io_err("copy", &tmp))?;
        fs::rename(&tmp, &self.primary).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err("rename", &self.primary)(e)
        })
    }

    /// Replace the primary file with `backup` and verify the bytes match.
    /// A backup that does not read back as a dataset is refused and the
    /// primary file is left alone.
    pub fn restore(&self, backup: &Path) -> Result<String, StorageError> {
        read_parquet(backup).map_err(|e| match e {
            StorageError::Parquet { path, source, .. } => StorageError::Parquet {
                action: "verify backup",
                path,
                source,
            },
            other => other,
        })?;
        let expected = file_digest(backup)?;
        self.copy_into_primary(backup)?;
        let actual = verify_digest(&self.primary, &expected)?;
        info!(backup = %backup.display(), digest = %actual, "dataset restored");
        Ok(actual)
    }

    /// Restore the newest backup and return its path.
    pub fn restore_latest(&self) -> Result<PathBuf, StorageError> {
        let latest = self
            .list_backups()?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NoBackup(self.backup_dir.clone()))?;
        self.restore(&latest.path)?;
        Ok(latest.path)
    }

    /// Write a batch that could not be merged next to the primary file.
    pub fn spool(&self, df: &DataFrame) -> Result<PathBuf, StorageError> {
        let path = self.spool_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err("create dir", parent))?;
        }
        ParquetSink.write(&mut df.clone(), &path)?;
        Ok(path)
    }

    /// Summary of the stored dataset, `None` if there is no file yet.
    pub fn describe(&self) -> Result<Option<DatasetSummary>, StorageError> {
        let Some(df) = self.load()? else {
            return Ok(None);
        };
        let bounds = date_bounds(&df)?;
        let bytes = fs::metadata(&self.primary)
            .map_err(io_err("stat", &self.primary))?
            .len();
        Ok(Some(DatasetSummary {
            path: self.primary.clone(),
            rows: df.height(),
            symbols: distinct_symbols(&df)?.len(),
            first_date: bounds.map(|b| b.0),
            last_date: bounds.map(|b| b.1),
            bytes,
            digest: file_digest(&self.primary)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::bars_to_frame;
    use crate::domain::BarRecord;

    struct FailingSink;

    impl FrameSink for FailingSink {
        fn write(&self, _: &mut DataFrame, path: &Path) -> Result<(), StorageError> {
            // leave a truncated file behind like a crashed writer would
            fs::write(path, b"PAR1 partial").map_err(io_err("write", path))?;
            Err(StorageError::Io {
                action: "write",
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            })
        }
    }

    /// Fails the write and removes every backup, so the restore fails too.
    struct BackupEatingSink {
        backups: PathBuf,
    }

    impl FrameSink for BackupEatingSink {
        fn write(&self, _: &mut DataFrame, path: &Path) -> Result<(), StorageError> {
            fs::remove_dir_all(&self.backups).map_err(io_err("remove", &self.backups))?;
            Err(StorageError::Io {
                action: "write",
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            })
        }
    }

    fn frame(n: usize) -> DataFrame {
        let bars: Vec<BarRecord> = (0..n)
            .map(|i| BarRecord {
                symbol: "000001.SZ".into(),
                name: String::new(),
                date: format!("202401{:02}", i + 1),
                open: Some(1.0),
                high: Some(1.0),
                low: Some(1.0),
                close: Some(1.0),
                volume: Some(1.0),
                amount: Some(1.0),
            })
            .collect();
        bars_to_frame(&bars).unwrap()
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 3);
        assert!(gw.load().unwrap().is_none());
        assert!(gw.describe().unwrap().is_none());
        assert!(gw.list_backups().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_and_backup_on_second_save() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 3);

        let first = gw.save(&mut frame(2)).unwrap();
        assert!(first.backup.is_none());
        let second = gw.save(&mut frame(3)).unwrap();
        assert!(second.backup.is_some());

        assert_eq!(gw.load().unwrap().unwrap().height(), 3);
        assert_eq!(gw.list_backups().unwrap().len(), 1);
        let summary = gw.describe().unwrap().unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.symbols, 1);
    }

    #[test]
    fn failed_write_restores_byte_identical_primary() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("d.parquet");
        let backups = dir.path().join("backups");
        StorageGateway::new(&primary, &backups, 3).save(&mut frame(2)).unwrap();
        let before = fs::read(&primary).unwrap();

        let failing = StorageGateway::with_sink(&primary, &backups, 3, Box::new(FailingSink));
        let err = failing.save(&mut frame(5)).unwrap_err();
        assert!(matches!(err, StorageError::WriteFailedRestored { .. }), "{err}");
        assert_eq!(fs::read(&primary).unwrap(), before);
    }

    #[test]
    fn failed_write_and_failed_restore_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("d.parquet");
        let backups = dir.path().join("backups");
        StorageGateway::new(&primary, &backups, 3).save(&mut frame(2)).unwrap();

        let sink = BackupEatingSink {
            backups: backups.clone(),
        };
        let gw = StorageGateway::with_sink(&primary, &backups, 3, Box::new(sink));
        match gw.save(&mut frame(5)) {
            Err(StorageError::RestoreFailed { path, backup, .. }) => {
                assert_eq!(path, primary);
                assert!(backup.starts_with(&backups));
            }
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
    }

    #[test]
    fn tampered_backup_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 3);
        gw.save(&mut frame(2)).unwrap();
        gw.save(&mut frame(4)).unwrap();
        let before = fs::read(gw.primary()).unwrap();

        let latest = gw.list_backups().unwrap().remove(0);
        fs::write(&latest.path, b"PAR1 not a dataset").unwrap();
        assert!(matches!(
            gw.restore(&latest.path),
            Err(StorageError::Parquet { action: "verify backup", .. })
        ));
        assert_eq!(fs::read(gw.primary()).unwrap(), before);
    }

    #[test]
    fn digest_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, b"original").unwrap();
        fs::write(&b, b"tampered").unwrap();
        let expected = file_digest(&a).unwrap();
        assert_eq!(verify_digest(&a, &expected).unwrap(), expected);
        match verify_digest(&b, &expected) {
            Err(StorageError::DigestMismatch { expected: e, actual }) => {
                assert_eq!(e, expected);
                assert_ne!(actual, expected);
            }
            other => panic!("expected DigestMismatch, got {other:?}"),
        }
    }

    #[test]
    fn failed_first_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("d.parquet");
        let gw = StorageGateway::with_sink(&primary, dir.path().join("b"), 3, Box::new(FailingSink));
        assert!(matches!(gw.save(&mut frame(1)), Err(StorageError::WriteFailed { .. })));
        assert!(!primary.exists());
    }

    #[test]
    fn prune_keeps_retention_newest() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 2);
        for n in 1..=5 {
            gw.save(&mut frame(n)).unwrap();
        }
        let backups = gw.list_backups().unwrap();
        assert_eq!(backups.len(), 2);
        // newest backup holds the 4-row version
        assert_eq!(read_parquet(&backups[0].path).unwrap().height(), 4);
    }

    #[test]
    fn restore_latest_brings_back_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 3);
        gw.save(&mut frame(2)).unwrap();
        gw.save(&mut frame(4)).unwrap();
        gw.restore_latest().unwrap();
        assert_eq!(gw.load().unwrap().unwrap().height(), 2);
    }

    #[test]
    fn restore_without_backups_errors() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 3);
        assert!(matches!(gw.restore_latest(), Err(StorageError::NoBackup(_))));
    }

    #[test]
    fn spool_lands_next_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), dir.path().join("backups"), 3);
        let path = gw.spool(&frame(3)).unwrap();
        assert_eq!(path, dir.path().join("d_new_only.parquet"));
        assert_eq!(read_parquet(&path).unwrap().height(), 3);
    }

    #[test]
    fn foreign_files_are_not_backups() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("d_notes.parquet"), b"x").unwrap();
        fs::write(backups.join("other_20240101_120000_000.parquet"), b"x").unwrap();
        fs::write(backups.join("d_20240101_120000_000.parquet"), b"x").unwrap();
        let gw = StorageGateway::new(dir.path().join("d.parquet"), &backups, 3);
        let listed = gw.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].taken_at.format("%Y%m%d").to_string(), "20240101");
    }
}
