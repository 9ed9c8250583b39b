//! The session manager: creates, hosts and mutates isolated editing
//! sessions, and hands submitted sessions to the merge queue.
//!
//! Sessions never write the canonical store. Every staging operation runs
//! against the session's own store file under that session's operation lock;
//! submit persists the status flip first and then moves the file into
//! `pending/` with a single rename.

use crate::canonical::CanonicalStore;
use crate::diff::{BlockUpdate, SessionDiff};
use crate::schema_store::SchemaStore;
use crate::session_db::SessionDb;
use chrono::{Duration as ChronoDuration, Utc};
use grove_core::config::SessionConfig;
use dashmap::DashMap;
use grove_core::{
    Block, BlockId, BlockRef, BlockSource, GroveError, Result, SessionId, SessionMeta,
    SessionStatus, StructuralDep, UserType,
};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct SessionHandle {
    meta: RwLock<SessionMeta>,
    db: SessionDb,
    /// Serializes operations within one session
    op_lock: Mutex<()>,
}

pub struct SessionManager {
    canonical: Arc<CanonicalStore>,
    schema: Arc<SchemaStore>,
    sessions_dir: PathBuf,
    queue_dir: PathBuf,
    session_config: SessionConfig,
    lock_timeout: Duration,
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        canonical: Arc<CanonicalStore>,
        schema: Arc<SchemaStore>,
        sessions_dir: impl Into<PathBuf>,
        queue_dir: impl Into<PathBuf>,
        session_config: SessionConfig,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            canonical,
            schema,
            sessions_dir: sessions_dir.into(),
            queue_dir: queue_dir.into(),
            session_config,
            lock_timeout,
            sessions: DashMap::new(),
        }
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir.join(format!("{id}.db"))
    }

    fn handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(id.as_str())
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| GroveError::not_found("session", id.as_str()))
    }

    /// Rebuild the in-memory registry from the sessions directory.
    ///
    /// Each file is self-contained; only `active` and `conflict` sessions
    /// are hosted again, anything else is left on disk for the GC.
    pub async fn recover(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let mut entries = tokio::fs::read_dir(&self.sessions_dir).await?;
        let mut recovered = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let db = match SessionDb::open(&path, self.lock_timeout).await {
                Ok(db) => db,
                Err(e) => {
                    warn!("Skipping unreadable session file {}: {e}", path.display());
                    continue;
                }
            };
            let meta = db.read_meta().await?;
            match meta.status {
                SessionStatus::Active | SessionStatus::Conflict => {
                    debug!("Recovered session {} ({})", meta.id, meta.status);
                    self.register(meta, db);
                    recovered += 1;
                }
                _ => db.close().await,
            }
        }

        info!("Session recovery complete: {recovered} sessions hosted");
        Ok(recovered)
    }

    fn register(&self, meta: SessionMeta, db: SessionDb) {
        let id = meta.id.as_str().to_string();
        self.sessions.insert(
            id,
            Arc::new(SessionHandle {
                meta: RwLock::new(meta),
                db,
                op_lock: Mutex::new(()),
            }),
        );
    }

    /// Create a new session for a user.
    pub async fn create(&self, user_id: &str, user_type: UserType) -> Result<SessionMeta> {
        let id = SessionId::generate(user_id);
        let now = Utc::now();
        let meta = SessionMeta {
            id: id.clone(),
            user_id: user_id.to_string(),
            user_type,
            created_at: now,
            last_activity: now,
            base_snapshot: self.canonical.snapshot_token().await?,
            schema_version: self.schema.version().await?,
            schema_hash: self.schema.hash().await?,
            status: SessionStatus::Active,
        };

        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let db = SessionDb::create(&self.session_path(&id), &meta, self.lock_timeout).await?;
        info!("Created session {id} for user {user_id}");
        self.register(meta.clone(), db);
        Ok(meta)
    }

    /// Return the user's single active session, creating one if needed.
    /// Sessions idle past `max_inactive_hours` are not reused.
    pub async fn get_or_create(&self, user_id: &str, user_type: UserType) -> Result<SessionMeta> {
        let idle_cutoff =
            Utc::now() - ChronoDuration::hours(self.session_config.max_inactive_hours as i64);
        let existing = self.sessions.iter().find_map(|entry| {
            let meta = entry.value().meta.read();
            (meta.user_id == user_id
                && meta.status == SessionStatus::Active
                && meta.last_activity > idle_cutoff)
                .then(|| meta.clone())
        });
        match existing {
            Some(meta) => Ok(meta),
            None => self.create(user_id, user_type).await,
        }
    }

    /// Metadata for a hosted session.
    pub fn get_session(&self, id: &SessionId) -> Result<SessionMeta> {
        Ok(self.handle(id)?.meta.read().clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionMeta> {
        self.sessions
            .iter()
            .map(|e| e.value().meta.read().clone())
            .collect()
    }

    pub fn list_sessions_by_user(&self, user_id: &str) -> Vec<SessionMeta> {
        self.sessions
            .iter()
            .filter_map(|e| {
                let meta = e.value().meta.read();
                (meta.user_id == user_id).then(|| meta.clone())
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Staging operations
    // ------------------------------------------------------------------

    /// Copy a canonical block into the session for editing.
    ///
    /// Also records the structural-dependency snapshot: the block's parent
    /// plus its own canonical hash. Copying an already-staged block returns
    /// the staged row unchanged.
    pub async fn copy_block(&self, id: &SessionId, block_id: &BlockId) -> Result<Block> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        if let Some(existing) = handle.db.get_block(block_id).await? {
            return Ok(existing.block);
        }

        let block = self
            .canonical
            .get_live_block(block_id)
            .await?
            .ok_or_else(|| GroveError::not_found("block", block_id.as_str()))?;
        let attrs = self.canonical.get_attrs(block_id).await?;

        let mut snapshot_hashes = std::collections::HashMap::new();
        snapshot_hashes.insert(block_id.as_str().to_string(), block.hash.clone());
        let dep = StructuralDep {
            block_id: block_id.clone(),
            depends_on: block.parent_id.iter().cloned().collect(),
            snapshot_hashes,
        };

        handle.db.copy_in(&block, &attrs, &dep).await?;
        self.touch(&handle).await?;
        Ok(block)
    }

    /// Stage a new block. Assigns an id when empty and stamps ownership.
    pub async fn insert_block(&self, id: &SessionId, mut block: Block) -> Result<Block> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        if !self.schema.has_block_type(&block.block_type).await? {
            return Err(GroveError::invalid_input(format!(
                "unknown block type '{}'",
                block.block_type
            )));
        }

        if block.id.is_empty() {
            block.id = BlockId::generate();
        }
        block.created_by = handle.meta.read().user_id.clone();
        block.rehash();
        let now = Utc::now();
        block.created_at = now;
        block.updated_at = now;

        handle.db.stage_insert(&block).await?;
        self.touch(&handle).await?;
        Ok(block)
    }

    /// Stage an update of an already-staged block.
    pub async fn update_block(&self, id: &SessionId, mut block: Block) -> Result<Block> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        let current = handle
            .db
            .get_block(&block.id)
            .await?
            .ok_or_else(|| GroveError::not_found("block", block.id.as_str()))?;

        block.rehash();
        block.updated_at = Utc::now();
        handle.db.stage_update(&block, &current.block).await?;
        self.touch(&handle).await?;
        Ok(block)
    }

    /// Stage a soft delete of a staged block.
    pub async fn delete_block(&self, id: &SessionId, block_id: &BlockId) -> Result<()> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        let current = handle
            .db
            .get_block(block_id)
            .await?
            .ok_or_else(|| GroveError::not_found("block", block_id.as_str()))?;

        handle
            .db
            .stage_delete(block_id, Utc::now(), &current.block)
            .await?;
        self.touch(&handle).await?;
        Ok(())
    }

    /// Stage a typed ref between two blocks.
    pub async fn link(
        &self,
        id: &SessionId,
        from: &BlockId,
        to: &BlockId,
        ref_type: &str,
        anchor: Option<String>,
    ) -> Result<BlockRef> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        if self.schema.relation_type(ref_type).await?.is_none() {
            return Err(GroveError::invalid_input(format!(
                "unknown relation type '{ref_type}'"
            )));
        }

        let r = BlockRef {
            from_id: from.clone(),
            to_id: to.clone(),
            ref_type: ref_type.to_string(),
            anchor,
            created_at: Utc::now(),
            created_by: handle.meta.read().user_id.clone(),
        };
        handle.db.stage_link(&r).await?;
        self.touch(&handle).await?;
        Ok(r)
    }

    /// Stage removal of a ref.
    pub async fn unlink(
        &self,
        id: &SessionId,
        from: &BlockId,
        to: &BlockId,
        ref_type: &str,
    ) -> Result<()> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        let existing = handle.db.get_ref(from, to, ref_type).await?;
        let before = match existing {
            Some(r) => r,
            None => BlockRef {
                from_id: from.clone(),
                to_id: to.clone(),
                ref_type: ref_type.to_string(),
                anchor: None,
                created_at: Utc::now(),
                created_by: handle.meta.read().user_id.clone(),
            },
        };
        handle.db.stage_unlink(&before).await?;
        self.touch(&handle).await?;
        Ok(())
    }

    /// Stage an attr write on a staged block.
    pub async fn set_attr(
        &self,
        id: &SessionId,
        block_id: &BlockId,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.stage_attr(id, block_id, name, Some(value)).await
    }

    /// Stage an attr removal on a staged block.
    pub async fn remove_attr(&self, id: &SessionId, block_id: &BlockId, name: &str) -> Result<()> {
        self.stage_attr(id, block_id, name, None).await
    }

    async fn stage_attr(
        &self,
        id: &SessionId,
        block_id: &BlockId,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        if handle.db.get_block(block_id).await?.is_none() {
            return Err(GroveError::not_found("block", block_id.as_str()));
        }
        let before = handle
            .db
            .get_attrs(block_id)
            .await?
            .into_iter()
            .find(|a| a.name == name);
        handle
            .db
            .stage_attr(block_id, name, value, before.as_ref())
            .await?;
        self.touch(&handle).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Diff, submit, abandon
    // ------------------------------------------------------------------

    /// Enumerate the session's staged changes against canonical.
    pub async fn get_diff(&self, id: &SessionId) -> Result<SessionDiff> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;

        let mut diff = SessionDiff::default();
        for staged in handle.db.dirty_blocks().await? {
            if staged.block.is_deleted() {
                diff.deletes.push(staged.block.id.clone());
                continue;
            }
            match staged.source {
                BlockSource::New => diff.inserts.push(staged.block),
                BlockSource::Copy => {
                    let before = self.canonical.get_block(&staged.block.id).await?;
                    diff.updates.push(BlockUpdate {
                        before,
                        after: staged.block,
                    });
                }
            }
        }
        Ok(diff)
    }

    /// Submit the session to the merger.
    ///
    /// The status flip is persisted inside the store first; the rename into
    /// `pending/` is the durability point and must stay on one volume.
    pub async fn submit(&self, id: &SessionId) -> Result<PathBuf> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;
        self.require_active(&handle, id)?;

        // A session built against a newer schema can never merge; fail fast
        // without queueing anything.
        let canonical_version = self.schema.version().await?;
        let session_version = handle.meta.read().schema_version;
        if session_version > canonical_version {
            return Err(GroveError::SchemaMismatch {
                session_version,
                canonical_version,
            });
        }

        handle.db.set_status(SessionStatus::Submitted).await?;
        handle.db.touch(Utc::now()).await?;
        handle.db.close().await;

        let from = self.session_path(id);
        let to = self.queue_dir.join("pending").join(format!("{id}.db"));
        if let Err(e) = tokio::fs::rename(&from, &to).await {
            // Put the session back in play rather than stranding the file.
            warn!("Submit rename failed for {id}: {e}");
            let db = SessionDb::open(&from, self.lock_timeout).await?;
            db.set_status(SessionStatus::Active).await?;
            let mut meta = handle.meta.read().clone();
            meta.status = SessionStatus::Active;
            self.sessions.remove(id.as_str());
            self.register(meta, db);
            return Err(GroveError::transient(format!("submit rename failed: {e}")));
        }

        handle.meta.write().status = SessionStatus::Submitted;
        self.sessions.remove(id.as_str());
        info!("Session {id} submitted to merge queue");
        Ok(to)
    }

    /// Abandon a hosted session.
    pub async fn abandon(&self, id: &SessionId) -> Result<()> {
        let handle = self.handle(id)?;
        let _guard = handle.op_lock.lock().await;

        let status = handle.meta.read().status;
        if !status.can_transition_to(SessionStatus::Abandoned) {
            return Err(GroveError::not_active(id.as_str(), status.as_str()));
        }

        handle.db.set_status(SessionStatus::Abandoned).await?;
        handle.db.close().await;
        handle.meta.write().status = SessionStatus::Abandoned;
        self.sessions.remove(id.as_str());
        info!("Session {id} abandoned");
        Ok(())
    }

    /// Pull a conflicted session file back from `failed/` and host it so the
    /// resolver can rewrite it.
    pub async fn reopen_conflicted(&self, id: &SessionId) -> Result<SessionMeta> {
        if self.sessions.contains_key(id.as_str()) {
            return self.get_session(id);
        }

        let from = self.queue_dir.join("failed").join(format!("{id}.db"));
        if !from.exists() {
            return Err(GroveError::not_found("conflicted session", id.as_str()));
        }
        let to = self.session_path(id);
        tokio::fs::rename(&from, &to).await?;

        let db = SessionDb::open(&to, self.lock_timeout).await?;
        let meta = db.read_meta().await?;
        if meta.status != SessionStatus::Conflict {
            db.close().await;
            return Err(GroveError::invalid_input(format!(
                "session {id} is '{}', not 'conflict'",
                meta.status
            )));
        }
        self.register(meta.clone(), db);
        Ok(meta)
    }

    /// Direct store access for the resolver, which rewrites session rows.
    pub fn session_db(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.handle(id)
    }

    /// Where a session currently is in its lifecycle, wherever its file
    /// lives.
    pub async fn session_status(&self, id: &SessionId) -> Result<SessionStatus> {
        if let Ok(handle) = self.handle(id) {
            return Ok(handle.meta.read().status);
        }

        let name = format!("{id}.db");
        for dir in ["pending", "processing"] {
            if self.queue_dir.join(dir).join(&name).exists() {
                return Ok(SessionStatus::Submitted);
            }
        }
        if self.queue_dir.join("done").join(&name).exists() {
            return Ok(SessionStatus::Merged);
        }
        for path in [
            self.queue_dir.join("failed").join(&name),
            self.sessions_dir.join(&name),
        ] {
            if path.exists() {
                let db = SessionDb::open(&path, self.lock_timeout).await?;
                let status = db.read_meta().await?.status;
                db.close().await;
                return Ok(status);
            }
        }
        Err(GroveError::not_found("session", id.as_str()))
    }

    fn require_active(&self, handle: &SessionHandle, id: &SessionId) -> Result<()> {
        let status = handle.meta.read().status;
        if status != SessionStatus::Active {
            return Err(GroveError::not_active(id.as_str(), status.as_str()));
        }
        Ok(())
    }

    async fn touch(&self, handle: &SessionHandle) -> Result<()> {
        let now = Utc::now();
        handle.db.touch(now).await?;
        handle.meta.write().last_activity = now;
        Ok(())
    }
}

impl SessionHandle {
    pub fn meta(&self) -> SessionMeta {
        self.meta.read().clone()
    }

    pub fn db(&self) -> &SessionDb {
        &self.db
    }

    pub(crate) fn set_status_mem(&self, status: SessionStatus) {
        self.meta.write().status = status;
    }
}

/// Update both the stored and in-memory status of a hosted session.
/// Used by the resolver when a batch of resolutions completes.
pub async fn set_session_status(handle: &Arc<SessionHandle>, status: SessionStatus) -> Result<()> {
    handle.db().set_status(status).await?;
    handle.set_status_mem(status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fmt_ts;
    use tempfile::TempDir;

    async fn fixture() -> (SessionManager, Arc<CanonicalStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let canonical = Arc::new(
            CanonicalStore::open(&dir.path().join("content.db"), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let schema = Arc::new(
            SchemaStore::open(&dir.path().join("schema.db"), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        for sub in ["pending", "processing", "done", "failed"] {
            tokio::fs::create_dir_all(dir.path().join("queue").join(sub))
                .await
                .unwrap();
        }
        let manager = SessionManager::new(
            Arc::clone(&canonical),
            schema,
            dir.path().join("sessions"),
            dir.path().join("queue"),
            SessionConfig::default(),
            Duration::from_secs(1),
        );
        (manager, canonical, dir)
    }

    async fn seed_canonical(canonical: &CanonicalStore, id: &str, content: &str) {
        let now = fmt_ts(Utc::now());
        sqlx::query(
            "INSERT INTO blocks (id, type, content, position, hash, created_at, updated_at)
             VALUES (?1, 'paragraph', ?2, 'm', ?3, ?4, ?4)",
        )
        .bind(id)
        .bind(content)
        .bind(grove_core::content_hash(content))
        .bind(&now)
        .execute(canonical.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_get_or_create() {
        let (manager, _canonical, _dir) = fixture().await;
        let s1 = manager.create("u1", UserType::Human).await.unwrap();
        assert_eq!(s1.status, SessionStatus::Active);
        assert_eq!(s1.schema_version, 1);

        let s2 = manager.get_or_create("u1", UserType::Human).await.unwrap();
        assert_eq!(s1.id, s2.id);

        let s3 = manager.get_or_create("u2", UserType::Bot).await.unwrap();
        assert_ne!(s1.id, s3.id);
        assert_eq!(manager.list_sessions().len(), 2);
        assert_eq!(manager.list_sessions_by_user("u1").len(), 1);
    }

    #[tokio::test]
    async fn test_insert_appears_in_diff() {
        let (manager, _canonical, _dir) = fixture().await;
        let s = manager.create("u1", UserType::Human).await.unwrap();

        let block = manager
            .insert_block(&s.id, Block::new("paragraph", "Hello"))
            .await
            .unwrap();
        assert_eq!(block.created_by, "u1");

        let diff = manager.get_diff(&s.id).await.unwrap();
        assert_eq!(diff.inserts.len(), 1);
        assert!(diff.updates.is_empty());
        assert!(diff.deletes.is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_unknown_type() {
        let (manager, _canonical, _dir) = fixture().await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        let err = manager
            .insert_block(&s.id, Block::new("hologram", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_copy_update_delete_diff() {
        let (manager, canonical, _dir) = fixture().await;
        seed_canonical(&canonical, "b1", "original").await;
        seed_canonical(&canonical, "b2", "doomed").await;
        let s = manager.create("u1", UserType::Human).await.unwrap();

        let mut copied = manager.copy_block(&s.id, &BlockId::new("b1")).await.unwrap();
        assert_eq!(copied.content, "original");
        // Clean copy stages nothing.
        assert!(manager.get_diff(&s.id).await.unwrap().is_empty());

        copied.content = "edited".to_string();
        manager.update_block(&s.id, copied).await.unwrap();

        manager.copy_block(&s.id, &BlockId::new("b2")).await.unwrap();
        manager.delete_block(&s.id, &BlockId::new("b2")).await.unwrap();

        let diff = manager.get_diff(&s.id).await.unwrap();
        assert_eq!(diff.updates.len(), 1);
        assert_eq!(diff.updates[0].before.as_ref().unwrap().content, "original");
        assert_eq!(diff.updates[0].after.content, "edited");
        assert_eq!(diff.deletes.len(), 1);
        assert_eq!(diff.deletes[0].as_str(), "b2");
    }

    #[tokio::test]
    async fn test_copy_missing_block_is_not_found() {
        let (manager, _canonical, _dir) = fixture().await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        let err = manager
            .copy_block(&s.id, &BlockId::new("ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_submit_moves_file_to_pending() {
        let (manager, _canonical, dir) = fixture().await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        manager
            .insert_block(&s.id, Block::new("paragraph", "Hello"))
            .await
            .unwrap();

        let pending = manager.submit(&s.id).await.unwrap();
        assert!(pending.exists());
        assert!(pending.starts_with(dir.path().join("queue").join("pending")));
        assert!(!dir
            .path()
            .join("sessions")
            .join(format!("{}.db", s.id))
            .exists());

        // No longer hosted; operations fail with NotFound.
        assert!(manager
            .insert_block(&s.id, Block::new("paragraph", "late"))
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            manager.session_status(&s.id).await.unwrap(),
            SessionStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_operations_require_active_status() {
        let (manager, _canonical, _dir) = fixture().await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        manager.abandon(&s.id).await.unwrap();

        // Abandoned sessions are no longer hosted.
        assert!(manager.get_session(&s.id).is_err());
        assert_eq!(
            manager.session_status(&s.id).await.unwrap(),
            SessionStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn test_recover_rehosts_active_sessions() {
        let (manager, canonical, dir) = fixture().await;
        seed_canonical(&canonical, "b1", "text").await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        manager.copy_block(&s.id, &BlockId::new("b1")).await.unwrap();

        // Simulate a restart: drop the registry, recover from disk.
        drop(manager);
        let schema = Arc::new(
            SchemaStore::open(&dir.path().join("schema.db"), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let manager2 = SessionManager::new(
            canonical,
            schema,
            dir.path().join("sessions"),
            dir.path().join("queue"),
            SessionConfig::default(),
            Duration::from_secs(1),
        );
        let recovered = manager2.recover().await.unwrap();
        assert_eq!(recovered, 1);
        let meta = manager2.get_session(&s.id).unwrap();
        assert_eq!(meta.user_id, "u1");
    }

    #[tokio::test]
    async fn test_attr_staging() {
        let (manager, canonical, _dir) = fixture().await;
        seed_canonical(&canonical, "t1", "a task").await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        manager.copy_block(&s.id, &BlockId::new("t1")).await.unwrap();

        manager
            .set_attr(&s.id, &BlockId::new("t1"), "status", "\"open\"")
            .await
            .unwrap();
        let diff = manager.get_diff(&s.id).await.unwrap();
        assert_eq!(diff.updates.len(), 1);

        manager
            .remove_attr(&s.id, &BlockId::new("t1"), "status")
            .await
            .unwrap();
        let handle = manager.session_db(&s.id).unwrap();
        assert!(handle.db().get_attrs(&BlockId::new("t1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_requires_known_relation() {
        let (manager, _canonical, _dir) = fixture().await;
        let s = manager.create("u1", UserType::Human).await.unwrap();
        let a = manager
            .insert_block(&s.id, Block::new("paragraph", "a"))
            .await
            .unwrap();
        let b = manager
            .insert_block(&s.id, Block::new("paragraph", "b"))
            .await
            .unwrap();

        assert!(manager
            .link(&s.id, &a.id, &b.id, "teleports", None)
            .await
            .is_err());
        let r = manager
            .link(&s.id, &a.id, &b.id, "cites", None)
            .await
            .unwrap();
        assert_eq!(r.ref_type, "cites");

        manager.unlink(&s.id, &a.id, &b.id, "cites").await.unwrap();
        let handle = manager.session_db(&s.id).unwrap();
        assert!(handle
            .db()
            .get_ref(&a.id, &b.id, "cites")
            .await
            .unwrap()
            .is_none());
    }
}
