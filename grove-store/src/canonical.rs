//! The canonical content store.
//!
//! Read by every component concurrently; written only inside the merger's
//! single transaction, which borrows the pool through [`CanonicalStore::pool`].

use crate::ddl::{apply_ddl, CONTENT_DDL};
use crate::rows::{attr_from_row, block_from_row, ref_from_row};
use crate::store::{open_store, StoreJournal};
use grove_core::{Attr, Block, BlockId, BlockRef, Result};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Readers share the pool; the merger's writer transaction takes one
/// connection at a time.
const READ_CONNECTIONS: u32 = 5;

pub struct CanonicalStore {
    pool: SqlitePool,
}

impl CanonicalStore {
    /// Open (or create) the canonical store and apply its schema.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let pool = open_store(path, StoreJournal::Wal, busy_timeout, READ_CONNECTIONS).await?;
        apply_ddl(&pool, CONTENT_DDL).await?;
        debug!("Canonical store open at {}", path.display());
        Ok(Self { pool })
    }

    /// The underlying pool. Writes outside the merger are not allowed.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Fetch a block row, soft-deleted rows included.
    pub async fn get_block(&self, id: &BlockId) -> Result<Option<Block>> {
        let row = sqlx::query("SELECT * FROM blocks WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| block_from_row(&r)).transpose()
    }

    /// Fetch a block only if it is live.
    pub async fn get_live_block(&self, id: &BlockId) -> Result<Option<Block>> {
        let row = sqlx::query("SELECT * FROM blocks WHERE id = ?1 AND deleted_at IS NULL")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| block_from_row(&r)).transpose()
    }

    /// Live children of a parent (or roots), ordered by position.
    pub async fn get_children(&self, parent: Option<&BlockId>) -> Result<Vec<Block>> {
        let rows = match parent {
            Some(p) => {
                sqlx::query(
                    "SELECT * FROM blocks
                     WHERE parent_id = ?1 AND deleted_at IS NULL
                     ORDER BY position",
                )
                .bind(p.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM blocks
                     WHERE parent_id IS NULL AND deleted_at IS NULL
                     ORDER BY position",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(block_from_row).collect()
    }

    pub async fn get_refs_from(&self, id: &BlockId) -> Result<Vec<BlockRef>> {
        let rows = sqlx::query("SELECT * FROM refs WHERE from_id = ?1")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ref_from_row).collect()
    }

    pub async fn get_refs_to(&self, id: &BlockId) -> Result<Vec<BlockRef>> {
        let rows = sqlx::query("SELECT * FROM refs WHERE to_id = ?1")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ref_from_row).collect()
    }

    pub async fn get_attrs(&self, id: &BlockId) -> Result<Vec<Attr>> {
        let rows = sqlx::query("SELECT * FROM attrs WHERE block_id = ?1 ORDER BY name")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attr_from_row).collect()
    }

    /// Full-text search over live block content.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<Block>> {
        let rows = sqlx::query(
            "SELECT b.* FROM blocks_fts f
             JOIN blocks b ON b.id = f.id
             WHERE blocks_fts MATCH ?1 AND b.deleted_at IS NULL
             LIMIT ?2",
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(block_from_row).collect()
    }

    pub async fn block_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM blocks")
            .fetch_one(&self.pool)
            .await?)
    }

    /// A cheap scalar digest of store state: `count(blocks):max(updated_at)`.
    ///
    /// Any successful merge changes at least one `updated_at`, so the token
    /// moves on every write.
    pub async fn snapshot_token(&self) -> Result<String> {
        let row = sqlx::query("SELECT count(*) AS n, max(updated_at) AS m FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        let m: Option<String> = row.try_get("m")?;
        Ok(format!("{}:{}", n, m.unwrap_or_default()))
    }

    // ------------------------------------------------------------------
    // Invariant checks (used by tests and operator tooling)
    // ------------------------------------------------------------------

    /// Ids of blocks whose stored hash does not match their content.
    pub async fn verify_hashes(&self) -> Result<Vec<BlockId>> {
        let rows = sqlx::query("SELECT id, content, hash FROM blocks")
            .fetch_all(&self.pool)
            .await?;
        let mut bad = Vec::new();
        for row in &rows {
            let content: String = row.try_get("content")?;
            let hash: String = row.try_get("hash")?;
            if grove_core::content_hash(&content) != hash {
                bad.push(BlockId::new(row.try_get::<String, _>("id")?));
            }
        }
        Ok(bad)
    }

    /// Parents whose live children are not strictly ordered by position.
    pub async fn verify_sibling_order(&self) -> Result<Vec<Option<BlockId>>> {
        let rows = sqlx::query(
            "SELECT parent_id, position FROM blocks
             WHERE deleted_at IS NULL
             ORDER BY parent_id, position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut bad = Vec::new();
        let mut current: Option<Option<String>> = None;
        let mut positions: Vec<String> = Vec::new();
        for row in &rows {
            let parent: Option<String> = row.try_get("parent_id")?;
            let position: String = row.try_get("position")?;
            if current.as_ref() != Some(&parent) {
                if let Some(p) = current.take() {
                    if !grove_core::findex::validate_order(&positions) {
                        bad.push(p.map(BlockId::new));
                    }
                }
                current = Some(parent);
                positions.clear();
            }
            positions.push(position);
        }
        if let Some(p) = current {
            if !grove_core::findex::validate_order(&positions) {
                bad.push(p.map(BlockId::new));
            }
        }
        Ok(bad)
    }

    /// Human-readable descriptions of referential-integrity violations.
    pub async fn verify_referential(&self) -> Result<Vec<String>> {
        let mut violations = Vec::new();

        let rows = sqlx::query(
            "SELECT b.id, b.parent_id FROM blocks b
             LEFT JOIN blocks p ON p.id = b.parent_id AND p.deleted_at IS NULL
             WHERE b.deleted_at IS NULL AND b.parent_id IS NOT NULL AND p.id IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let id: String = row.try_get("id")?;
            let parent: String = row.try_get("parent_id")?;
            violations.push(format!("block {id} has dangling parent {parent}"));
        }

        let rows = sqlx::query(
            "SELECT r.from_id, r.to_id, r.type FROM refs r
             LEFT JOIN blocks f ON f.id = r.from_id AND f.deleted_at IS NULL
             LEFT JOIN blocks t ON t.id = r.to_id AND t.deleted_at IS NULL
             WHERE f.id IS NULL OR t.id IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let from: String = row.try_get("from_id")?;
            let to: String = row.try_get("to_id")?;
            let ty: String = row.try_get("type")?;
            violations.push(format!("ref {from} -> {to} ({ty}) has a dead endpoint"));
        }

        Ok(violations)
    }
}
