//! The garbage collector: periodic reclamation of session files, queue
//! directories, audit history and store free space.
//!
//! The GC is cooperative: it opens files read-only-briefly, never holds a
//! lock across the merger's transaction, and skips anything it cannot open.

use crate::queue::MergeQueue;
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use grove_core::config::GcConfig;
use grove_core::{Result, SessionStatus};
use grove_store::{SessionDb, SqliteAuditSink};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one GC cycle reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub sessions_removed: u64,
    pub done_removed: u64,
    pub failed_removed: u64,
    pub audit_rows_trimmed: u64,
    pub merge_rows_trimmed: u64,
    pub stores_vacuumed: u64,
}

pub struct GarbageCollector {
    config: GcConfig,
    sessions_dir: PathBuf,
    queue: MergeQueue,
    audit: Arc<SqliteAuditSink>,
    /// Stores eligible for compaction, by name.
    vacuum_targets: Vec<(String, SqlitePool)>,
    lock_timeout: Duration,
}

impl GarbageCollector {
    pub fn new(
        config: GcConfig,
        sessions_dir: impl Into<PathBuf>,
        queue: MergeQueue,
        audit: Arc<SqliteAuditSink>,
        vacuum_targets: Vec<(String, SqlitePool)>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            config,
            sessions_dir: sessions_dir.into(),
            queue,
            audit,
            vacuum_targets,
            lock_timeout,
        }
    }

    /// Run GC cycles until cancelled.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.interval_hours * 3600);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh boot does
            // not race session recovery.
            interval.tick().await;

            info!("Garbage collector started (every {}h)", self.config.interval_hours);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match self.run_cycle().await {
                            Ok(report) => debug!("GC cycle complete: {report:?}"),
                            Err(e) => error!("GC cycle failed: {e}"),
                        }
                    }
                }
            }
            info!("Garbage collector stopped");
        })
    }

    /// One full sweep over sessions, queue directories, audit history and
    /// store free space.
    pub async fn run_cycle(&self) -> Result<GcReport> {
        let mut report = GcReport::default();

        report.sessions_removed = self.sweep_sessions().await?;
        report.done_removed = self
            .sweep_queue_dir(self.queue.done_files().await?, self.config.merged_days)
            .await;
        report.failed_removed = self
            .sweep_queue_dir(
                self.queue.failed_files().await?,
                self.config.failed_archive_days,
            )
            .await;

        let cutoff = Utc::now() - ChronoDuration::days(self.config.audit_retention_days as i64);
        let (audit_rows, merge_rows) = self.audit.trim(cutoff).await?;
        report.audit_rows_trimmed = audit_rows;
        report.merge_rows_trimmed = merge_rows;

        report.stores_vacuumed = self.compact_stores().await;

        if report != GcReport::default() {
            info!(
                "GC reclaimed: {} session(s), {} done, {} failed, {}+{} audit rows, {} store(s) compacted",
                report.sessions_removed,
                report.done_removed,
                report.failed_removed,
                report.audit_rows_trimmed,
                report.merge_rows_trimmed,
                report.stores_vacuumed
            );
        }
        Ok(report)
    }

    /// Remove abandoned sessions: explicitly abandoned files, or active
    /// sessions idle past the configured horizon. Merged sessions never sit
    /// in the sessions directory (submit renames them into the queue), so
    /// their files are reclaimed by the `done/` sweep instead.
    async fn sweep_sessions(&self) -> Result<u64> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let idle_cutoff = Utc::now() - ChronoDuration::days(self.config.abandoned_days as i64);

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let db = match SessionDb::open(&path, self.lock_timeout).await {
                Ok(db) => db,
                Err(e) => {
                    warn!("GC skipping {}: {e}", path.display());
                    continue;
                }
            };
            let meta = match db.read_meta().await {
                Ok(meta) => meta,
                Err(e) => {
                    db.close().await;
                    warn!("GC skipping {}: {e}", path.display());
                    continue;
                }
            };
            db.close().await;

            let reclaim = match meta.status {
                SessionStatus::Abandoned => true,
                SessionStatus::Active => meta.last_activity < idle_cutoff,
                _ => false,
            };
            if reclaim {
                debug!("GC removing session file {}", path.display());
                if remove_file_logged(&path).await {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn sweep_queue_dir(
        &self,
        files: Vec<(SystemTime, PathBuf)>,
        max_age_days: u64,
    ) -> u64 {
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 86_400);
        let mut removed = 0;
        for (mtime, path) in files {
            if mtime < cutoff && remove_file_logged(&path).await {
                removed += 1;
            }
        }
        removed
    }

    /// Compact stores whose free-page ratio exceeds the threshold, but only
    /// inside the configured off-hours window.
    async fn compact_stores(&self) -> u64 {
        let hour = chrono::Local::now().hour() as u8;
        if !in_window(hour, self.config.vacuum_start_hour, self.config.vacuum_end_hour) {
            return 0;
        }

        let mut vacuumed = 0;
        for (name, pool) in &self.vacuum_targets {
            match free_page_ratio(pool).await {
                Ok(ratio) if ratio > self.config.vacuum_threshold as f64 / 100.0 => {
                    info!("Compacting store '{name}' ({:.0}% free pages)", ratio * 100.0);
                    match sqlx::query("VACUUM").execute(pool).await {
                        Ok(_) => vacuumed += 1,
                        Err(e) => warn!("VACUUM of '{name}' failed: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Could not read free-page ratio of '{name}': {e}"),
            }
        }
        vacuumed
    }
}

/// Whether `hour` falls inside a start..end window that may wrap midnight.
fn in_window(hour: u8, start: u8, end: u8) -> bool {
    if start <= end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

async fn free_page_ratio(pool: &SqlitePool) -> Result<f64> {
    let free: i64 = sqlx::query_scalar("PRAGMA freelist_count")
        .fetch_one(pool)
        .await?;
    let total: i64 = sqlx::query_scalar("PRAGMA page_count")
        .fetch_one(pool)
        .await?;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(free as f64 / total as f64)
}

async fn remove_file_logged(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) => {
            warn!("GC could not remove {}: {e}", path.display());
            false
        }
    }
}
