//! The audit sink: per-operation audit records and per-merge log rows.
//!
//! The merger talks to a narrow [`AuditSink`] trait; the SQLite
//! implementation keeps both logs in audit.db. Content fields are elided
//! unless the block's type is on the allow-list, so ordinary prose never
//! lands in the audit trail.

use crate::ddl::{apply_ddl, AUDIT_DDL};
use crate::store::{fmt_ts, open_store, parse_ts, StoreJournal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grove_core::{Block, Result, SessionId, UserType};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

/// Block types whose content is recorded verbatim.
pub const DEFAULT_CONTENT_ALLOWLIST: &[&str] = &["code", "definition", "procedure"];

/// Per-merge counters recorded in merge_log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub blocks_inserted: u64,
    pub blocks_updated: u64,
    pub blocks_deleted: u64,
    pub refs_changed: u64,
    pub conflicts: u64,
}

/// One merge attempt, success or not.
#[derive(Debug, Clone)]
pub struct MergeRecord {
    pub session_id: SessionId,
    pub user_id: String,
    pub status: String,
    pub counts: MergeCounts,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Query filters for the audit log; all optional, paginated.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub block_id: Option<String>,
    pub user_id: Option<String>,
    pub operation: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

/// One audit_log row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub user_type: String,
    pub operation: String,
    pub block_id: String,
    pub block_type: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// One merge_log row.
#[derive(Debug, Clone)]
pub struct MergeLogEntry {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub status: String,
    pub counts: MergeCounts,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// The narrow interface the merger emits audit records through.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_insert(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        block: &Block,
    ) -> Result<()>;

    async fn log_update(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        before: &Block,
        after: &Block,
    ) -> Result<()>;

    async fn log_delete(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        before: &Block,
    ) -> Result<()>;

    async fn log_merge(&self, record: &MergeRecord) -> Result<()>;
}

pub struct SqliteAuditSink {
    pool: SqlitePool,
    content_allowlist: Vec<String>,
}

impl SqliteAuditSink {
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let pool = open_store(path, StoreJournal::Wal, busy_timeout, 2).await?;
        apply_ddl(&pool, AUDIT_DDL).await?;
        Ok(Self {
            pool,
            content_allowlist: DEFAULT_CONTENT_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    pub fn with_allowlist(mut self, types: Vec<String>) -> Self {
        self.content_allowlist = types;
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Serialize a block for the audit trail, dropping content fields for
    /// types outside the allow-list.
    fn elide(&self, block: &Block) -> Result<Value> {
        let mut value = serde_json::to_value(block)?;
        if !self.content_allowlist.contains(&block.block_type) {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("content");
                obj.remove("content_html");
            }
        }
        Ok(value)
    }

    async fn insert_row(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        operation: &str,
        block_id: &str,
        block_type: &str,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
             (ts, session_id, user_id, user_type, operation, block_id, block_type, before, after)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(session_id.as_str())
        .bind(user_id)
        .bind(user_type.as_str())
        .bind(operation)
        .bind(block_id)
        .bind(block_type)
        .bind(before.map(|v| v.to_string()))
        .bind(after.map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Query the audit log with filters and pagination.
    pub async fn query(&self, q: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from("SELECT * FROM audit_log WHERE 1=1");
        if q.block_id.is_some() {
            sql.push_str(" AND block_id = ?");
        }
        if q.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if q.operation.is_some() {
            sql.push_str(" AND operation = ?");
        }
        if q.from.is_some() {
            sql.push_str(" AND ts >= ?");
        }
        if q.to.is_some() {
            sql.push_str(" AND ts < ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(v) = &q.block_id {
            query = query.bind(v);
        }
        if let Some(v) = &q.user_id {
            query = query.bind(v);
        }
        if let Some(v) = &q.operation {
            query = query.bind(v);
        }
        if let Some(v) = q.from {
            query = query.bind(fmt_ts(v));
        }
        if let Some(v) = q.to {
            query = query.bind(fmt_ts(v));
        }
        let limit = if q.limit == 0 { 50 } else { q.limit };
        query = query.bind(limit as i64).bind(q.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let before: Option<String> = row.try_get("before")?;
            let after: Option<String> = row.try_get("after")?;
            entries.push(AuditEntry {
                id: row.try_get("id")?,
                ts: parse_ts(&row.try_get::<String, _>("ts")?)?,
                session_id: row.try_get("session_id")?,
                user_id: row.try_get("user_id")?,
                user_type: row.try_get("user_type")?,
                operation: row.try_get("operation")?,
                block_id: row.try_get("block_id")?,
                block_type: row.try_get("block_type")?,
                before: before.map(|s| serde_json::from_str(&s)).transpose()?,
                after: after.map(|s| serde_json::from_str(&s)).transpose()?,
            });
        }
        Ok(entries)
    }

    /// Merge attempts, newest first.
    pub async fn merge_history(&self, limit: u32, offset: u32) -> Result<Vec<MergeLogEntry>> {
        let rows = sqlx::query("SELECT * FROM merge_log ORDER BY id DESC LIMIT ?1 OFFSET ?2")
            .bind(if limit == 0 { 50 } else { limit } as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(MergeLogEntry {
                id: row.try_get("id")?,
                ts: parse_ts(&row.try_get::<String, _>("ts")?)?,
                session_id: row.try_get("session_id")?,
                user_id: row.try_get("user_id")?,
                status: row.try_get("status")?,
                counts: MergeCounts {
                    blocks_inserted: row.try_get::<i64, _>("blocks_inserted")? as u64,
                    blocks_updated: row.try_get::<i64, _>("blocks_updated")? as u64,
                    blocks_deleted: row.try_get::<i64, _>("blocks_deleted")? as u64,
                    refs_changed: row.try_get::<i64, _>("refs_changed")? as u64,
                    conflicts: row.try_get::<i64, _>("conflicts")? as u64,
                },
                duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
                error: row.try_get("error")?,
            });
        }
        Ok(entries)
    }

    /// Delete audit and merge rows older than the cutoff. Returns the number
    /// of rows removed from each log.
    pub async fn trim(&self, cutoff: DateTime<Utc>) -> Result<(u64, u64)> {
        let cutoff = fmt_ts(cutoff);
        let audit = sqlx::query("DELETE FROM audit_log WHERE ts < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let merges = sqlx::query("DELETE FROM merge_log WHERE ts < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok((audit, merges))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn log_insert(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        block: &Block,
    ) -> Result<()> {
        let after = self.elide(block)?;
        self.insert_row(
            session_id,
            user_id,
            user_type,
            "insert",
            block.id.as_str(),
            &block.block_type,
            None,
            Some(after),
        )
        .await
    }

    async fn log_update(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        before: &Block,
        after: &Block,
    ) -> Result<()> {
        let before_v = self.elide(before)?;
        let after_v = self.elide(after)?;
        self.insert_row(
            session_id,
            user_id,
            user_type,
            "update",
            after.id.as_str(),
            &after.block_type,
            Some(before_v),
            Some(after_v),
        )
        .await
    }

    async fn log_delete(
        &self,
        session_id: &SessionId,
        user_id: &str,
        user_type: UserType,
        before: &Block,
    ) -> Result<()> {
        let before_v = self.elide(before)?;
        self.insert_row(
            session_id,
            user_id,
            user_type,
            "delete",
            before.id.as_str(),
            &before.block_type,
            Some(before_v),
            None,
        )
        .await
    }

    async fn log_merge(&self, record: &MergeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO merge_log
             (ts, session_id, user_id, status, blocks_inserted, blocks_updated,
              blocks_deleted, refs_changed, conflicts, duration_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(record.session_id.as_str())
        .bind(&record.user_id)
        .bind(&record.status)
        .bind(record.counts.blocks_inserted as i64)
        .bind(record.counts.blocks_updated as i64)
        .bind(record.counts.blocks_deleted as i64)
        .bind(record.counts.refs_changed as i64)
        .bind(record.counts.conflicts as i64)
        .bind(record.duration_ms as i64)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn sink() -> (SqliteAuditSink, TempDir) {
        let dir = TempDir::new().unwrap();
        let sink = SqliteAuditSink::open(&dir.path().join("audit.db"), Duration::from_secs(1))
            .await
            .unwrap();
        (sink, dir)
    }

    #[tokio::test]
    async fn test_content_elision_respects_allowlist() {
        let (sink, _dir) = sink().await;
        let session = SessionId::new("s1");

        let prose = Block::new("paragraph", "private prose");
        sink.log_insert(&session, "u1", UserType::Human, &prose)
            .await
            .unwrap();

        let code = Block::new("code", "fn main() {}");
        sink.log_insert(&session, "u1", UserType::Human, &code)
            .await
            .unwrap();

        let entries = sink.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(entries.len(), 2);

        let prose_entry = entries.iter().find(|e| e.block_type == "paragraph").unwrap();
        assert!(prose_entry.after.as_ref().unwrap().get("content").is_none());

        let code_entry = entries.iter().find(|e| e.block_type == "code").unwrap();
        assert_eq!(
            code_entry.after.as_ref().unwrap()["content"],
            "fn main() {}"
        );
    }

    #[tokio::test]
    async fn test_query_filters_and_pagination() {
        let (sink, _dir) = sink().await;
        let session = SessionId::new("s1");
        for i in 0..5 {
            let block = Block::new("paragraph", format!("b{i}"));
            sink.log_insert(&session, "u1", UserType::Human, &block)
                .await
                .unwrap();
        }
        let other = Block::new("paragraph", "other");
        sink.log_delete(&SessionId::new("s2"), "u2", UserType::Bot, &other)
            .await
            .unwrap();

        let q = AuditQuery {
            user_id: Some("u1".to_string()),
            ..Default::default()
        };
        assert_eq!(sink.query(&q).await.unwrap().len(), 5);

        let q = AuditQuery {
            operation: Some("delete".to_string()),
            ..Default::default()
        };
        let deletes = sink.query(&q).await.unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].user_id, "u2");

        let q = AuditQuery {
            limit: 2,
            offset: 4,
            ..Default::default()
        };
        assert_eq!(sink.query(&q).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_log_round_trip() {
        let (sink, _dir) = sink().await;
        sink.log_merge(&MergeRecord {
            session_id: SessionId::new("s1"),
            user_id: "u1".to_string(),
            status: "success".to_string(),
            counts: MergeCounts {
                blocks_inserted: 1,
                ..Default::default()
            },
            duration_ms: 12,
            error: None,
        })
        .await
        .unwrap();

        let history = sink.merge_history(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "success");
        assert_eq!(history[0].counts.blocks_inserted, 1);
    }

    #[tokio::test]
    async fn test_trim_removes_old_rows() {
        let (sink, _dir) = sink().await;
        let block = Block::new("paragraph", "x");
        sink.log_insert(&SessionId::new("s1"), "u1", UserType::Human, &block)
            .await
            .unwrap();

        // Nothing is older than "now - 1 day".
        let (a, m) = sink.trim(Utc::now() - chrono::Duration::days(1)).await.unwrap();
        assert_eq!((a, m), (0, 0));

        // Everything is older than "now + 1 day".
        let (a, _m) = sink.trim(Utc::now() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(a, 1);
        assert!(sink.query(&AuditQuery::default()).await.unwrap().is_empty());
    }
}
