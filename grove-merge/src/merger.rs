//! The merge daemon: the only writer on the canonical store.
//!
//! One long-lived task claims submitted session files from the queue in
//! FIFO order, validates them against the canonical store, applies the
//! change journal in a single transaction, and publishes the outcome to the
//! audit log and the page cache. Either the whole journal commits or none
//! of it does.

use crate::conflict::{Conflict, ConflictKind};
use crate::queue::MergeQueue;
use chrono::Utc;
use grove_cache::PageCache;
use grove_core::config::MergerConfig;
use grove_core::{
    Block, BlockId, BlockRef, ChangeOp, GroveError, Result, SessionId, SessionMeta, SessionStatus,
};
use grove_store::{
    fmt_ts, AuditSink, CanonicalStore, MergeCounts, MergeRecord, SchemaStore, SessionBlock,
    SessionDb,
};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of processing one session file.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged(MergeCounts),
    Conflicted(usize),
    Failed(String),
}

/// Monotone counters backing the health surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergerStats {
    pub merged: u64,
    pub conflicted: u64,
    pub failed: u64,
    pub recovered: u64,
}

pub struct Merger {
    canonical: Arc<CanonicalStore>,
    schema: Arc<SchemaStore>,
    audit: Arc<dyn AuditSink>,
    cache: Option<Arc<PageCache>>,
    queue: MergeQueue,
    config: MergerConfig,
    /// Process-wide writer mutex; the claim-by-rename protocol covers
    /// cross-process exclusion.
    write_lock: tokio::sync::Mutex<()>,
    merged: AtomicU64,
    conflicted: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

impl Merger {
    pub fn new(
        canonical: Arc<CanonicalStore>,
        schema: Arc<SchemaStore>,
        audit: Arc<dyn AuditSink>,
        cache: Option<Arc<PageCache>>,
        queue: MergeQueue,
        config: MergerConfig,
    ) -> Self {
        Self {
            canonical,
            schema,
            audit,
            cache,
            queue,
            config,
            write_lock: tokio::sync::Mutex::new(()),
            merged: AtomicU64::new(0),
            conflicted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &MergeQueue {
        &self.queue
    }

    pub fn stats(&self) -> MergerStats {
        MergerStats {
            merged: self.merged.load(Ordering::Relaxed),
            conflicted: self.conflicted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_timeout_ms)
    }

    /// Run the merge loop until cancelled. The current session always
    /// finishes before the task exits.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.config.recover_on_startup {
                if let Err(e) = self.recover_interrupted().await {
                    error!("Startup recovery failed: {e}");
                }
            }

            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!("Merger started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match self.sweep_with(Some(&token)).await {
                            Ok(_) => {}
                            Err(e @ GroveError::Fatal(_)) => {
                                error!("Merger exiting: {e}");
                                break;
                            }
                            Err(e) => error!("Merge sweep failed: {e}"),
                        }
                    }
                }
            }
            info!("Merger stopped");
        })
    }

    /// Move interrupted `processing/` files to `failed/`.
    ///
    /// We cannot know whether their canonical transaction committed, so they
    /// are never resumed; operators reconcile against merge_log and may move
    /// a file back to `pending/` by hand.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let moved = self.queue.recover_interrupted().await?;
        for path in &moved {
            let session_id =
                MergeQueue::session_id(path).unwrap_or_else(|_| SessionId::new("unknown"));
            let user_id = match SessionDb::open(path, self.lock_timeout()).await {
                Ok(db) => {
                    let user = db.read_meta().await.map(|m| m.user_id).unwrap_or_default();
                    db.close().await;
                    user
                }
                Err(_) => String::new(),
            };
            self.audit
                .log_merge(&MergeRecord {
                    session_id,
                    user_id,
                    status: "failed".to_string(),
                    counts: MergeCounts::default(),
                    duration_ms: 0,
                    error: Some("interrupted".to_string()),
                })
                .await?;
            self.recovered.fetch_add(1, Ordering::Relaxed);
        }
        if !moved.is_empty() {
            warn!("Moved {} interrupted session(s) to failed/", moved.len());
        }
        Ok(moved.len())
    }

    /// Process every file currently pending. Returns how many were handled.
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_with(None).await
    }

    async fn sweep_with(&self, token: Option<&CancellationToken>) -> Result<usize> {
        let mut processed = 0;
        loop {
            if token.is_some_and(|t| t.is_cancelled()) {
                break;
            }
            let Some(path) = self.queue.claim_oldest().await? else {
                break;
            };

            let mut attempt = 0;
            loop {
                match self.process_one(&path).await {
                    Ok(outcome) => {
                        debug!("Processed {}: {outcome:?}", path.display());
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                        attempt += 1;
                        warn!(
                            "Transient error on {} (attempt {attempt}): {e}",
                            path.display()
                        );
                        tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                    Err(e) => {
                        self.reject(&path, None, format!("retries exhausted: {e}"), 0)
                            .await?;
                        break;
                    }
                }
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one claimed session file through validate → apply → publish.
    pub async fn process_one(&self, path: &Path) -> Result<MergeOutcome> {
        let started = Instant::now();
        let session_id = MergeQueue::session_id(path)?;

        let db = match SessionDb::open(path, self.lock_timeout()).await {
            Ok(db) => db,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                let reason = format!("open/meta: {e}");
                self.reject(path, None, reason.clone(), elapsed_ms(started))
                    .await?;
                return Ok(MergeOutcome::Failed(reason));
            }
        };
        let meta = db.read_meta().await?;

        // An already-merged file (a crash-recovered duplicate an operator
        // requeued) must replay as a no-op.
        if meta.status == SessionStatus::Merged {
            db.close().await;
            self.queue.finish(path).await?;
            debug!("Session {session_id} already merged; requeue is a no-op");
            return Ok(MergeOutcome::Merged(MergeCounts::default()));
        }

        // A session built against a newer schema than ours can never merge.
        let canonical_version = self.schema.version().await?;
        if meta.schema_version > canonical_version {
            db.close().await;
            let reason = GroveError::SchemaMismatch {
                session_version: meta.schema_version,
                canonical_version,
            }
            .to_string();
            self.reject(path, Some(&meta), reason.clone(), elapsed_ms(started))
                .await?;
            return Ok(MergeOutcome::Failed(reason));
        }

        let conflicts = self.detect_conflicts(&db).await?;
        if !conflicts.is_empty() {
            return self
                .reject_conflicted(path, &db, &meta, conflicts, started)
                .await;
        }

        let changes = db.changes(true).await?;
        let counts = match self.apply(&db, &changes).await {
            Ok(counts) => counts,
            Err(e) if e.is_transient() => {
                db.close().await;
                return Err(e);
            }
            Err(e) => {
                db.close().await;
                let reason = format!("apply: {e}");
                self.reject(path, Some(&meta), reason.clone(), elapsed_ms(started))
                    .await?;
                return Ok(MergeOutcome::Failed(reason));
            }
        };

        // Post-commit bookkeeping. The canonical transaction is durable at
        // this point; anything below must not undo it.
        if let Err(e) = db.mark_all_merged().await {
            warn!("Could not mark journal merged for {session_id}: {e}");
        }
        if let Err(e) = db.set_status(SessionStatus::Merged).await {
            warn!("Could not persist merged status for {session_id}: {e}");
        }

        self.emit_audit(&meta, &changes).await;
        self.audit
            .log_merge(&MergeRecord {
                session_id: session_id.clone(),
                user_id: meta.user_id.clone(),
                status: "success".to_string(),
                counts,
                duration_ms: elapsed_ms(started),
                error: None,
            })
            .await?;

        db.close().await;

        if let Some(cache) = &self.cache {
            let touched: HashSet<String> = changes
                .iter()
                .map(|c| c.block_id.as_str().to_string())
                .collect();
            let invalidated = cache.invalidate_blocks(touched.iter());
            if invalidated > 0 {
                debug!("Invalidated {invalidated} cached pages after merge of {session_id}");
            }
        }

        self.queue.finish(path).await?;
        self.merged.fetch_add(1, Ordering::Relaxed);
        info!(
            "Merged session {session_id}: +{} ~{} -{} blocks, {} ref changes",
            counts.blocks_inserted, counts.blocks_updated, counts.blocks_deleted, counts.refs_changed
        );
        Ok(MergeOutcome::Merged(counts))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    async fn detect_conflicts(&self, db: &SessionDb) -> Result<Vec<Conflict>> {
        let mut conflicts = Vec::new();

        // Structural-dependency snapshots: the canonical rows a session
        // copied must still exist with the hashes it saw.
        for dep in db.deps().await? {
            for (dep_id, expected) in &dep.snapshot_hashes {
                match self.canonical.get_live_block(&BlockId::new(dep_id)).await? {
                    None => conflicts.push(Conflict::new(
                        dep.block_id.clone(),
                        ConflictKind::Deleted,
                        format!("block {dep_id} no longer exists in canonical"),
                    )),
                    Some(current) if &current.hash != expected => {
                        conflicts.push(
                            Conflict::new(
                                dep.block_id.clone(),
                                ConflictKind::Content,
                                format!("block {dep_id} changed since it was copied"),
                            )
                            .with_hashes(expected.clone(), current.hash),
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        let dirty = db.dirty_blocks().await?;
        let staged: HashMap<&str, &SessionBlock> = dirty
            .iter()
            .map(|s| (s.block.id.as_str(), s))
            .collect();
        let deleted_here: HashSet<&str> = dirty
            .iter()
            .filter(|s| s.block.is_deleted())
            .map(|s| s.block.id.as_str())
            .collect();

        // Every surviving dirty block needs a live parent: either still in
        // canonical (and not deleted by this very session) or created here.
        for s in dirty.iter().filter(|s| !s.block.is_deleted()) {
            let Some(parent) = &s.block.parent_id else {
                continue;
            };
            let parent_live_here = staged
                .get(parent.as_str())
                .is_some_and(|p| !p.block.is_deleted());
            let parent_live_canonical = !deleted_here.contains(parent.as_str())
                && self.canonical.get_live_block(parent).await?.is_some();
            if !(parent_live_here || parent_live_canonical) {
                conflicts.push(Conflict::new(
                    s.block.id.clone(),
                    ConflictKind::Structure,
                    format!("parent {parent} would not exist after merge"),
                ));
            }
        }

        // Deleting a block must not orphan canonical children that this
        // session neither deletes nor reparents.
        for s in dirty.iter().filter(|s| s.block.is_deleted()) {
            let children = self.canonical.get_children(Some(&s.block.id)).await?;
            let orphaned = children
                .iter()
                .filter(|c| match staged.get(c.id.as_str()) {
                    Some(st) => {
                        !st.block.is_deleted()
                            && st.block.parent_id.as_ref() == Some(&s.block.id)
                    }
                    None => true,
                })
                .count();
            if orphaned > 0 {
                conflicts.push(Conflict::new(
                    s.block.id.clone(),
                    ConflictKind::Structure,
                    format!("deleting would orphan {orphaned} child block(s)"),
                ));
            }
        }

        Ok(conflicts)
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    /// Replay the journal against canonical in one transaction.
    async fn apply(&self, db: &SessionDb, changes: &[grove_core::Change]) -> Result<MergeCounts> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.canonical.pool().begin().await?;
        let now = Utc::now();
        let mut counts = MergeCounts::default();

        for change in changes {
            match change.operation {
                ChangeOp::Insert => {
                    let staged = self.staged_row(db, &change.block_id).await?;
                    write_block_row(&mut tx, &staged.block).await?;
                    sync_attrs(&mut tx, db, &change.block_id).await?;
                    counts.blocks_inserted += 1;
                }
                ChangeOp::Update => {
                    if change.field.as_deref() == Some("attrs") {
                        sync_attrs(&mut tx, db, &change.block_id).await?;
                        counts.blocks_updated += 1;
                        continue;
                    }
                    let staged = self.staged_row(db, &change.block_id).await?;
                    // A no-op update (content and placement unchanged) must
                    // not bump canonical timestamps.
                    if row_matches_canonical(&mut tx, &staged.block).await? {
                        continue;
                    }
                    write_block_row(&mut tx, &staged.block).await?;
                    sync_attrs(&mut tx, db, &change.block_id).await?;
                    counts.blocks_updated += 1;
                }
                ChangeOp::Delete => {
                    sqlx::query(
                        "UPDATE blocks SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
                    )
                    .bind(change.block_id.as_str())
                    .bind(fmt_ts(now))
                    .execute(&mut *tx)
                    .await?;
                    counts.blocks_deleted += 1;
                }
                ChangeOp::Link => {
                    let r: BlockRef = parse_snapshot(change.after.as_ref(), "link")?;
                    self.write_ref(&mut tx, &r, true).await?;
                    counts.refs_changed += 1;
                }
                ChangeOp::Unlink => {
                    let r: BlockRef = parse_snapshot(change.before.as_ref(), "unlink")?;
                    self.write_ref(&mut tx, &r, false).await?;
                    counts.refs_changed += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    async fn staged_row(&self, db: &SessionDb, id: &BlockId) -> Result<SessionBlock> {
        db.get_block(id)
            .await?
            .ok_or_else(|| GroveError::storage(format!("journal references missing row {id}")))
    }

    /// Upsert or delete a ref row; symmetric relation types keep their
    /// mirror row in step (invariant vii).
    async fn write_ref(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        r: &BlockRef,
        insert: bool,
    ) -> Result<()> {
        let symmetric = self
            .schema
            .relation_type(&r.ref_type)
            .await?
            .map(|t| t.symmetric)
            .unwrap_or(false);

        if insert {
            upsert_ref_row(tx, &r.from_id, &r.to_id, r).await?;
            if symmetric {
                upsert_ref_row(tx, &r.to_id, &r.from_id, r).await?;
            }
        } else {
            delete_ref_row(tx, &r.from_id, &r.to_id, &r.ref_type).await?;
            if symmetric {
                delete_ref_row(tx, &r.to_id, &r.from_id, &r.ref_type).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outcome paths
    // ------------------------------------------------------------------

    async fn reject_conflicted(
        &self,
        path: &Path,
        db: &SessionDb,
        meta: &SessionMeta,
        conflicts: Vec<Conflict>,
        started: Instant,
    ) -> Result<MergeOutcome> {
        let n = conflicts.len();
        let payloads: std::result::Result<Vec<String>, _> =
            conflicts.iter().map(serde_json::to_string).collect();
        db.save_conflicts(&payloads?).await?;
        db.set_status(SessionStatus::Conflict).await?;
        db.close().await;
        self.queue.fail(path).await?;

        self.audit
            .log_merge(&MergeRecord {
                session_id: meta.id.clone(),
                user_id: meta.user_id.clone(),
                status: "conflict".to_string(),
                counts: MergeCounts {
                    conflicts: n as u64,
                    ..Default::default()
                },
                duration_ms: elapsed_ms(started),
                error: None,
            })
            .await?;

        self.conflicted.fetch_add(1, Ordering::Relaxed);
        info!("Session {} rejected with {n} conflict(s)", meta.id);
        Ok(MergeOutcome::Conflicted(n))
    }

    async fn reject(
        &self,
        path: &Path,
        meta: Option<&SessionMeta>,
        reason: String,
        duration_ms: u64,
    ) -> Result<()> {
        warn!("Rejecting {}: {reason}", path.display());
        self.queue.fail(path).await?;

        let session_id = meta
            .map(|m| m.id.clone())
            .or_else(|| MergeQueue::session_id(path).ok())
            .unwrap_or_else(|| SessionId::new("unknown"));
        self.audit
            .log_merge(&MergeRecord {
                session_id,
                user_id: meta.map(|m| m.user_id.clone()).unwrap_or_default(),
                status: "failed".to_string(),
                counts: MergeCounts::default(),
                duration_ms,
                error: Some(reason),
            })
            .await?;
        self.failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Per-change audit records; failures here must not fail the merge.
    async fn emit_audit(&self, meta: &SessionMeta, changes: &[grove_core::Change]) {
        for change in changes {
            let result = match change.operation {
                ChangeOp::Insert => match parse_snapshot::<Block>(change.after.as_ref(), "insert") {
                    Ok(block) => {
                        self.audit
                            .log_insert(&meta.id, &meta.user_id, meta.user_type, &block)
                            .await
                    }
                    Err(e) => Err(e),
                },
                ChangeOp::Update if change.field.is_none() => {
                    match (
                        parse_snapshot::<Block>(change.before.as_ref(), "update"),
                        parse_snapshot::<Block>(change.after.as_ref(), "update"),
                    ) {
                        (Ok(before), Ok(after)) => {
                            self.audit
                                .log_update(&meta.id, &meta.user_id, meta.user_type, &before, &after)
                                .await
                        }
                        (Err(e), _) | (_, Err(e)) => Err(e),
                    }
                }
                ChangeOp::Delete => match parse_snapshot::<Block>(change.before.as_ref(), "delete") {
                    Ok(before) => {
                        self.audit
                            .log_delete(&meta.id, &meta.user_id, meta.user_type, &before)
                            .await
                    }
                    Err(e) => Err(e),
                },
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!("Audit record for change {} failed: {e}", change.id);
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn parse_snapshot<T: serde::de::DeserializeOwned>(
    value: Option<&serde_json::Value>,
    op: &str,
) -> Result<T> {
    let value = value
        .ok_or_else(|| GroveError::storage(format!("{op} change has no snapshot")))?
        .clone();
    Ok(serde_json::from_value(value)?)
}

/// Write a block row into canonical: update when present, insert otherwise.
async fn write_block_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    block: &Block,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE blocks SET parent_id = ?2, type = ?3, content = ?4, content_html = ?5,
         position = ?6, hash = ?7, updated_at = ?8, created_by = ?9, published = ?10,
         deleted_at = ?11
         WHERE id = ?1",
    )
    .bind(block.id.as_str())
    .bind(block.parent_id.as_ref().map(|p| p.as_str().to_string()))
    .bind(&block.block_type)
    .bind(&block.content)
    .bind(&block.content_html)
    .bind(&block.position)
    .bind(&block.hash)
    .bind(fmt_ts(block.updated_at))
    .bind(&block.created_by)
    .bind(block.published as i64)
    .bind(block.deleted_at.map(fmt_ts))
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if updated == 0 {
        sqlx::query(
            "INSERT INTO blocks
             (id, parent_id, type, content, content_html, position, hash,
              created_at, updated_at, created_by, published, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(block.id.as_str())
        .bind(block.parent_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(&block.block_type)
        .bind(&block.content)
        .bind(&block.content_html)
        .bind(&block.position)
        .bind(&block.hash)
        .bind(fmt_ts(block.created_at))
        .bind(fmt_ts(block.updated_at))
        .bind(&block.created_by)
        .bind(block.published as i64)
        .bind(block.deleted_at.map(fmt_ts))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Whether canonical already holds this block with identical content and
/// placement.
async fn row_matches_canonical(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    block: &Block,
) -> Result<bool> {
    let row = sqlx::query("SELECT parent_id, position, hash, published FROM blocks WHERE id = ?1")
        .bind(block.id.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(false);
    };
    let parent: Option<String> = row.try_get("parent_id")?;
    let position: String = row.try_get("position")?;
    let hash: String = row.try_get("hash")?;
    let published: i64 = row.try_get("published")?;
    Ok(hash == block.hash
        && position == block.position
        && parent.as_deref() == block.parent_id.as_ref().map(|p| p.as_str())
        && (published != 0) == block.published)
}

async fn sync_attrs(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    db: &SessionDb,
    block_id: &BlockId,
) -> Result<()> {
    let attrs = db.get_attrs(block_id).await?;
    sqlx::query("DELETE FROM attrs WHERE block_id = ?1")
        .bind(block_id.as_str())
        .execute(&mut **tx)
        .await?;
    for attr in &attrs {
        sqlx::query("INSERT INTO attrs (block_id, name, value) VALUES (?1, ?2, ?3)")
            .bind(attr.block_id.as_str())
            .bind(&attr.name)
            .bind(&attr.value)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn upsert_ref_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    from: &BlockId,
    to: &BlockId,
    r: &BlockRef,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO refs (from_id, to_id, type, anchor, created_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(&r.ref_type)
    .bind(&r.anchor)
    .bind(fmt_ts(r.created_at))
    .bind(&r.created_by)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn delete_ref_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    from: &BlockId,
    to: &BlockId,
    ref_type: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM refs WHERE from_id = ?1 AND to_id = ?2 AND type = ?3")
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(ref_type)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
