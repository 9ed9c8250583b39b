//! The per-session ephemeral store.
//!
//! Each session owns one SQLite file mirroring the canonical schema plus
//! staging metadata. Every staging operation writes its row change and the
//! matching journal entry in one transaction, so a crash mid-operation never
//! leaves the journal out of step with the rows.

use crate::ddl::{apply_ddl, SESSION_DDL};
use crate::rows::{attr_from_row, block_from_row, ref_from_row};
use crate::store::{fmt_ts, fmt_ts_nanos, open_existing, open_store, parse_ts, StoreJournal};
use chrono::{DateTime, Utc};
use grove_core::{
    Attr, Block, BlockId, BlockRef, BlockSource, Change, ChangeOp, GroveError, Result, SessionMeta,
    SessionStatus, StructuralDep,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A block row as staged in a session store.
#[derive(Debug, Clone)]
pub struct SessionBlock {
    pub block: Block,
    pub source: BlockSource,
    pub dirty: bool,
}

#[derive(Debug)]
pub struct SessionDb {
    pool: SqlitePool,
    path: PathBuf,
}

impl SessionDb {
    /// Create a fresh session store and persist its metadata row.
    pub async fn create(path: &Path, meta: &SessionMeta, busy_timeout: Duration) -> Result<Self> {
        let pool = open_store(path, StoreJournal::Rollback, busy_timeout, 1).await?;
        apply_ddl(&pool, SESSION_DDL).await?;
        let db = Self {
            pool,
            path: path.to_path_buf(),
        };
        db.write_meta(meta).await?;
        Ok(db)
    }

    /// Open an existing session store. A file whose metadata cannot be read
    /// is reported as corrupt.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let pool = open_existing(path, StoreJournal::Rollback, busy_timeout, 1).await?;
        let db = Self {
            pool,
            path: path.to_path_buf(),
        };
        if let Err(e) = db.read_meta().await {
            db.pool.close().await;
            return Err(GroveError::corrupt_session(format!(
                "{}: {e}",
                path.display()
            )));
        }
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the pool so the single store file can be renamed away.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub async fn read_meta(&self) -> Result<SessionMeta> {
        let row = sqlx::query("SELECT * FROM _session_meta LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GroveError::storage("session store has no metadata row"))?;
        meta_from_row(&row)
    }

    pub async fn write_meta(&self, meta: &SessionMeta) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO _session_meta
             (id, user_id, user_type, created_at, last_activity, base_snapshot,
              schema_version, schema_hash, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(meta.id.as_str())
        .bind(&meta.user_id)
        .bind(meta.user_type.as_str())
        .bind(fmt_ts(meta.created_at))
        .bind(fmt_ts(meta.last_activity))
        .bind(&meta.base_snapshot)
        .bind(meta.schema_version)
        .bind(&meta.schema_hash)
        .bind(meta.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE _session_meta SET status = ?1")
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE _session_meta SET last_activity = ?1")
            .bind(fmt_ts(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staging operations (row write + journal entry, one transaction each)
    // ------------------------------------------------------------------

    /// Copy a canonical block into the session, clean, together with its
    /// attrs and a structural-dependency snapshot. Not journaled; copies are
    /// not changes.
    pub async fn copy_in(&self, block: &Block, attrs: &[Attr], dep: &StructuralDep) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_block(&mut tx, block, BlockSource::Copy, false).await?;
        for attr in attrs {
            sqlx::query("INSERT OR REPLACE INTO attrs (block_id, name, value) VALUES (?1, ?2, ?3)")
                .bind(attr.block_id.as_str())
                .bind(&attr.name)
                .bind(&attr.value)
                .execute(&mut *tx)
                .await?;
        }
        upsert_dep_tx(&mut tx, dep).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn stage_insert(&self, block: &Block) -> Result<()> {
        let after = serde_json::to_string(block)?;
        let mut tx = self.pool.begin().await?;
        upsert_block(&mut tx, block, BlockSource::New, true).await?;
        append_change(&mut tx, ChangeOp::Insert, &block.id, None, None, Some(after.as_str())).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn stage_update(&self, block: &Block, before: &Block) -> Result<()> {
        let before_json = serde_json::to_string(before)?;
        let after_json = serde_json::to_string(block)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE blocks SET parent_id = ?2, type = ?3, content = ?4, content_html = ?5,
             position = ?6, hash = ?7, updated_at = ?8, published = ?9, _dirty = 1
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
        .bind(block.published as i64)
        .execute(&mut *tx)
        .await?;
        append_change(
            &mut tx,
            ChangeOp::Update,
            &block.id,
            None,
            Some(before_json.as_str()),
            Some(after_json.as_str()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn stage_delete(&self, id: &BlockId, deleted_at: DateTime<Utc>, before: &Block) -> Result<()> {
        let before_json = serde_json::to_string(before)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE blocks SET deleted_at = ?2, updated_at = ?2, _dirty = 1 WHERE id = ?1")
            .bind(id.as_str())
            .bind(fmt_ts(deleted_at))
            .execute(&mut *tx)
            .await?;
        append_change(&mut tx, ChangeOp::Delete, id, None, Some(before_json.as_str()), None).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn stage_link(&self, r: &BlockRef) -> Result<()> {
        let after = serde_json::to_string(r)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO refs (from_id, to_id, type, anchor, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(r.from_id.as_str())
        .bind(r.to_id.as_str())
        .bind(&r.ref_type)
        .bind(&r.anchor)
        .bind(fmt_ts(r.created_at))
        .bind(&r.created_by)
        .execute(&mut *tx)
        .await?;
        append_change(&mut tx, ChangeOp::Link, &r.from_id, None, None, Some(after.as_str())).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn stage_unlink(&self, before: &BlockRef) -> Result<()> {
        let before_json = serde_json::to_string(before)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM refs WHERE from_id = ?1 AND to_id = ?2 AND type = ?3")
            .bind(before.from_id.as_str())
            .bind(before.to_id.as_str())
            .bind(&before.ref_type)
            .execute(&mut *tx)
            .await?;
        append_change(
            &mut tx,
            ChangeOp::Unlink,
            &before.from_id,
            None,
            Some(before_json.as_str()),
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Set or remove an attr. The owning block is marked dirty and the
    /// journal carries an `update` on its `attrs` field.
    pub async fn stage_attr(
        &self,
        block_id: &BlockId,
        name: &str,
        value: Option<&str>,
        before: Option<&Attr>,
    ) -> Result<()> {
        let before_json = before.map(serde_json::to_string).transpose()?;
        let after_json = value
            .map(|v| {
                serde_json::to_string(&Attr {
                    block_id: block_id.clone(),
                    name: name.to_string(),
                    value: v.to_string(),
                })
            })
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        match value {
            Some(v) => {
                sqlx::query("INSERT OR REPLACE INTO attrs (block_id, name, value) VALUES (?1, ?2, ?3)")
                    .bind(block_id.as_str())
                    .bind(name)
                    .bind(v)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM attrs WHERE block_id = ?1 AND name = ?2")
                    .bind(block_id.as_str())
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        sqlx::query("UPDATE blocks SET _dirty = 1 WHERE id = ?1")
            .bind(block_id.as_str())
            .execute(&mut *tx)
            .await?;
        append_change(
            &mut tx,
            ChangeOp::Update,
            block_id,
            Some("attrs"),
            before_json.as_deref(),
            after_json.as_deref(),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_block(&self, id: &BlockId) -> Result<Option<SessionBlock>> {
        let row = sqlx::query("SELECT * FROM blocks WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_block_from_row(&r)).transpose()
    }

    pub async fn dirty_blocks(&self) -> Result<Vec<SessionBlock>> {
        let rows = sqlx::query("SELECT * FROM blocks WHERE _dirty = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_block_from_row).collect()
    }

    pub async fn get_attrs(&self, id: &BlockId) -> Result<Vec<Attr>> {
        let rows = sqlx::query("SELECT * FROM attrs WHERE block_id = ?1 ORDER BY name")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attr_from_row).collect()
    }

    pub async fn get_ref(&self, from: &BlockId, to: &BlockId, ty: &str) -> Result<Option<BlockRef>> {
        let row = sqlx::query("SELECT * FROM refs WHERE from_id = ?1 AND to_id = ?2 AND type = ?3")
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(ty)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| ref_from_row(&r)).transpose()
    }

    /// Journal rows in insertion order.
    pub async fn changes(&self, unmerged_only: bool) -> Result<Vec<Change>> {
        let sql = if unmerged_only {
            "SELECT * FROM _changes WHERE merged = 0 ORDER BY id"
        } else {
            "SELECT * FROM _changes ORDER BY id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(change_from_row).collect()
    }

    pub async fn mark_all_merged(&self) -> Result<()> {
        sqlx::query("UPDATE _changes SET merged = 1 WHERE merged = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Structural dependencies
    // ------------------------------------------------------------------

    pub async fn deps(&self) -> Result<Vec<StructuralDep>> {
        let rows = sqlx::query("SELECT * FROM _structural_deps ORDER BY block_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dep_from_row).collect()
    }

    pub async fn dep_for(&self, block_id: &BlockId) -> Result<Option<StructuralDep>> {
        let row = sqlx::query("SELECT * FROM _structural_deps WHERE block_id = ?1")
            .bind(block_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| dep_from_row(&r)).transpose()
    }

    pub async fn upsert_dep(&self, dep: &StructuralDep) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_dep_tx(&mut tx, dep).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove the dependency entry for a block.
    pub async fn delete_dep(&self, block_id: &BlockId) -> Result<()> {
        sqlx::query("DELETE FROM _structural_deps WHERE block_id = ?1")
            .bind(block_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a block's journal rows (used when a resolution takes the
    /// canonical side and the staged edits must not replay).
    pub async fn delete_changes_for(&self, block_id: &BlockId) -> Result<()> {
        sqlx::query("DELETE FROM _changes WHERE block_id = ?1")
            .bind(block_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrite the expected hash of one dependency entry.
    pub async fn set_dep_hash(&self, block_id: &BlockId, dep_id: &str, hash: &str) -> Result<()> {
        let mut dep = self
            .dep_for(block_id)
            .await?
            .ok_or_else(|| GroveError::not_found("structural dep", block_id.as_str()))?;
        dep.snapshot_hashes.insert(dep_id.to_string(), hash.to_string());
        self.upsert_dep(&dep).await
    }

    // ------------------------------------------------------------------
    // Conflicts (opaque JSON payloads owned by the merge layer)
    // ------------------------------------------------------------------

    pub async fn save_conflicts(&self, items: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM _conflicts").execute(&mut *tx).await?;
        for item in items {
            sqlx::query("INSERT INTO _conflicts (detail) VALUES (?1)")
                .bind(item)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_conflicts(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT detail FROM _conflicts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("detail").map_err(Into::into))
            .collect()
    }

    pub async fn clear_conflicts(&self) -> Result<()> {
        sqlx::query("DELETE FROM _conflicts").execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolution rewrites
    // ------------------------------------------------------------------

    /// Replace a staged block row wholesale.
    pub async fn overwrite_block(
        &self,
        block: &Block,
        source: BlockSource,
        dirty: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_block(&mut tx, block, source, dirty).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_source(&self, id: &BlockId, source: BlockSource) -> Result<()> {
        sqlx::query("UPDATE blocks SET _source = ?2 WHERE id = ?1")
            .bind(id.as_str())
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_parent(&self, id: &BlockId, parent: Option<&BlockId>) -> Result<()> {
        sqlx::query("UPDATE blocks SET parent_id = ?2, _dirty = 1 WHERE id = ?1")
            .bind(id.as_str())
            .bind(parent.map(|p| p.as_str().to_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop a block with its journal rows and dependency entry (discard).
    pub async fn purge_block(&self, id: &BlockId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blocks WHERE id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM attrs WHERE block_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM _changes WHERE block_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM _structural_deps WHERE block_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_block(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    block: &Block,
    source: BlockSource,
    dirty: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO blocks
         (id, parent_id, type, content, content_html, position, hash,
          created_at, updated_at, created_by, published, deleted_at, _dirty, _source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
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
    .bind(dirty as i64)
    .bind(source.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_change(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    op: ChangeOp,
    block_id: &BlockId,
    field: Option<&str>,
    before: Option<&str>,
    after: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO _changes (ts, operation, block_id, field, before, after)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(fmt_ts_nanos(Utc::now()))
    .bind(op.as_str())
    .bind(block_id.as_str())
    .bind(field)
    .bind(before)
    .bind(after)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_dep_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    dep: &StructuralDep,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO _structural_deps (block_id, depends_on, snapshot_hashes)
         VALUES (?1, ?2, ?3)",
    )
    .bind(dep.block_id.as_str())
    .bind(serde_json::to_string(&dep.depends_on)?)
    .bind(serde_json::to_string(&dep.snapshot_hashes)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn session_block_from_row(row: &SqliteRow) -> Result<SessionBlock> {
    Ok(SessionBlock {
        block: block_from_row(row)?,
        source: row.try_get::<String, _>("_source")?.parse()?,
        dirty: row.try_get::<i64, _>("_dirty")? != 0,
    })
}

fn change_from_row(row: &SqliteRow) -> Result<Change> {
    let before: Option<String> = row.try_get("before")?;
    let after: Option<String> = row.try_get("after")?;
    Ok(Change {
        id: row.try_get("id")?,
        ts: parse_ts(&row.try_get::<String, _>("ts")?)?,
        operation: row.try_get::<String, _>("operation")?.parse()?,
        block_id: BlockId::new(row.try_get::<String, _>("block_id")?),
        field: row.try_get("field")?,
        before: before.map(|s| serde_json::from_str(&s)).transpose()?,
        after: after.map(|s| serde_json::from_str(&s)).transpose()?,
        merged: row.try_get::<i64, _>("merged")? != 0,
    })
}

fn dep_from_row(row: &SqliteRow) -> Result<StructuralDep> {
    Ok(StructuralDep {
        block_id: BlockId::new(row.try_get::<String, _>("block_id")?),
        depends_on: serde_json::from_str(&row.try_get::<String, _>("depends_on")?)?,
        snapshot_hashes: serde_json::from_str(&row.try_get::<String, _>("snapshot_hashes")?)?,
    })
}

fn meta_from_row(row: &SqliteRow) -> Result<SessionMeta> {
    Ok(SessionMeta {
        id: grove_core::SessionId::new(row.try_get::<String, _>("id")?),
        user_id: row.try_get("user_id")?,
        user_type: row.try_get::<String, _>("user_type")?.parse()?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        last_activity: parse_ts(&row.try_get::<String, _>("last_activity")?)?,
        base_snapshot: row.try_get("base_snapshot")?,
        schema_version: row.try_get("schema_version")?,
        schema_hash: row.try_get("schema_hash")?,
        status: row.try_get::<String, _>("status")?.parse()?,
    })
}
