//! SQLite store opening and shared row helpers.
//!
//! Every grove store is a single SQLite file accessed through an sqlx pool.
//! The canonical store runs in WAL mode so readers proceed while the merger
//! writes; session stores run with the rollback journal so a session stays
//! one self-describing file that the queue can move with a bare rename.

use chrono::{DateTime, SecondsFormat, Utc};
use grove_core::{GroveError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Journal mode for a store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreJournal {
    /// WAL: concurrent readers, sidecar files while open
    Wal,
    /// Rollback journal: the store stays a single file at rest
    Rollback,
}

/// Open (or create) a store file.
pub async fn open_store(
    path: &Path,
    journal: StoreJournal,
    busy_timeout: Duration,
    max_connections: u32,
) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mode = match journal {
        StoreJournal::Wal => SqliteJournalMode::Wal,
        StoreJournal::Rollback => SqliteJournalMode::Delete,
    };

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(mode)
        .busy_timeout(busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| GroveError::storage(format!("failed to open {}: {e}", path.display())))?;

    Ok(pool)
}

/// Open a store only if the file already exists.
pub async fn open_existing(
    path: &Path,
    journal: StoreJournal,
    busy_timeout: Duration,
    max_connections: u32,
) -> Result<SqlitePool> {
    if !path.exists() {
        return Err(GroveError::not_found("store", path.display().to_string()));
    }
    open_store(path, journal, busy_timeout, max_connections).await
}

/// The canonical data directory layout.
#[derive(Debug, Clone)]
pub struct StorePaths {
    data_dir: PathBuf,
}

impl StorePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn content(&self) -> PathBuf {
        self.data_dir.join("content.db")
    }

    pub fn schema(&self) -> PathBuf {
        self.data_dir.join("schema.db")
    }

    pub fn users(&self) -> PathBuf {
        self.data_dir.join("users.db")
    }

    pub fn audit(&self) -> PathBuf {
        self.data_dir.join("audit.db")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// All four store files, paired with their short names.
    pub fn all(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("content", self.content()),
            ("schema", self.schema()),
            ("users", self.users()),
            ("audit", self.audit()),
        ]
    }
}

/// Render a timestamp in the fixed-width form stored in every table.
///
/// Microsecond precision keeps lexicographic and chronological order in
/// agreement, which `max(updated_at)` digests rely on.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Render a change-journal timestamp at nanosecond precision.
pub fn fmt_ts_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GroveError::storage(format!("invalid timestamp '{s}': {e}")))
}

/// Parse an optional stored timestamp.
pub fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}
