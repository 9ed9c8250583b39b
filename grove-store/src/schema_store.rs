//! The type schema store: block types, relation types, schema version.

use crate::ddl::{apply_ddl, SCHEMA_DDL};
use crate::store::{open_store, StoreJournal};
use grove_core::{BlockType, GroveError, RelationType, Result, SchemaDef, TypeCategory};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub struct SchemaStore {
    pool: SqlitePool,
}

impl SchemaStore {
    /// Open (or create) the schema store; an empty store is seeded with the
    /// built-in vocabulary at version 1.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let pool = open_store(path, StoreJournal::Wal, busy_timeout, 2).await?;
        apply_ddl(&pool, SCHEMA_DDL).await?;
        let store = Self { pool };
        if store.version().await? == 0 {
            store.seed_defaults().await?;
        }
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Current schema version; 0 when the store is unseeded.
    pub async fn version(&self) -> Result<i64> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Current schema content hash.
    pub async fn hash(&self) -> Result<String> {
        let hash: Option<String> = sqlx::query_scalar("SELECT hash FROM schema_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        hash.ok_or_else(|| GroveError::storage("schema store has no meta row"))
    }

    /// Load the full schema definition.
    pub async fn load(&self) -> Result<SchemaDef> {
        let rows = sqlx::query("SELECT * FROM block_types ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut block_types = Vec::with_capacity(rows.len());
        for row in &rows {
            block_types.push(BlockType {
                name: row.try_get("name")?,
                label: row.try_get("label")?,
                icon: row.try_get("icon")?,
                json_schema: row.try_get("json_schema")?,
                allowed_parents: serde_json::from_str(&row.try_get::<String, _>("allowed_parents")?)?,
                allowed_children: serde_json::from_str(&row.try_get::<String, _>("allowed_children")?)?,
                category: parse_category(&row.try_get::<String, _>("category")?)?,
                version: row.try_get("version")?,
            });
        }

        let rows = sqlx::query("SELECT * FROM relation_types ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let mut relation_types = Vec::with_capacity(rows.len());
        for row in &rows {
            relation_types.push(RelationType {
                name: row.try_get("name")?,
                inverse: row.try_get("inverse")?,
                symmetric: row.try_get::<i64, _>("symmetric")? != 0,
            });
        }

        Ok(SchemaDef {
            block_types,
            relation_types,
            version: self.version().await?,
            hash: self.hash().await?,
        })
    }

    /// Whether a block type exists in the current schema.
    pub async fn has_block_type(&self, name: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar("SELECT count(*) FROM block_types WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }

    /// Look up a relation type.
    pub async fn relation_type(&self, name: &str) -> Result<Option<RelationType>> {
        let row = sqlx::query("SELECT * FROM relation_types WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(RelationType {
                name: r.try_get("name")?,
                inverse: r.try_get("inverse")?,
                symmetric: r.try_get::<i64, _>("symmetric")? != 0,
            })
        })
        .transpose()
    }

    async fn seed_defaults(&self) -> Result<()> {
        info!("Seeding default type schema");
        let mut schema = default_schema();
        schema.hash = schema.compute_hash();

        let mut tx = self.pool.begin().await?;
        for t in &schema.block_types {
            sqlx::query(
                "INSERT INTO block_types
                 (name, label, icon, json_schema, allowed_parents, allowed_children, category, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&t.name)
            .bind(&t.label)
            .bind(&t.icon)
            .bind(&t.json_schema)
            .bind(serde_json::to_string(&t.allowed_parents)?)
            .bind(serde_json::to_string(&t.allowed_children)?)
            .bind(category_str(t.category))
            .bind(t.version)
            .execute(&mut *tx)
            .await?;
        }
        for r in &schema.relation_types {
            sqlx::query("INSERT INTO relation_types (name, inverse, symmetric) VALUES (?1, ?2, ?3)")
                .bind(&r.name)
                .bind(&r.inverse)
                .bind(r.symmetric as i64)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT INTO schema_meta (id, version, hash) VALUES (1, ?1, ?2)")
            .bind(schema.version)
            .bind(&schema.hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn category_str(c: TypeCategory) -> &'static str {
    match c {
        TypeCategory::Content => "content",
        TypeCategory::Discussion => "discussion",
        TypeCategory::Knowledge => "knowledge",
        TypeCategory::Task => "task",
        TypeCategory::Bot => "bot",
        TypeCategory::System => "system",
    }
}

fn parse_category(s: &str) -> Result<TypeCategory> {
    match s {
        "content" => Ok(TypeCategory::Content),
        "discussion" => Ok(TypeCategory::Discussion),
        "knowledge" => Ok(TypeCategory::Knowledge),
        "task" => Ok(TypeCategory::Task),
        "bot" => Ok(TypeCategory::Bot),
        "system" => Ok(TypeCategory::System),
        other => Err(GroveError::storage(format!("unknown type category '{other}'"))),
    }
}

/// The built-in vocabulary seeded into a fresh schema store.
pub fn default_schema() -> SchemaDef {
    fn bt(name: &str, label: &str, icon: &str, category: TypeCategory) -> BlockType {
        BlockType {
            name: name.to_string(),
            label: label.to_string(),
            icon: icon.to_string(),
            json_schema: None,
            allowed_parents: Vec::new(),
            allowed_children: Vec::new(),
            category,
            version: 1,
        }
    }
    fn rel(name: &str, inverse: &str, symmetric: bool) -> RelationType {
        RelationType {
            name: name.to_string(),
            inverse: inverse.to_string(),
            symmetric,
        }
    }

    SchemaDef {
        block_types: vec![
            bt("paragraph", "Paragraph", "text", TypeCategory::Content),
            bt("heading", "Heading", "heading", TypeCategory::Content),
            bt("code", "Code", "code", TypeCategory::Content),
            bt("comment", "Comment", "message", TypeCategory::Discussion),
            bt("question", "Question", "help", TypeCategory::Discussion),
            bt("definition", "Definition", "book", TypeCategory::Knowledge),
            bt("procedure", "Procedure", "list", TypeCategory::Knowledge),
            bt("task", "Task", "check", TypeCategory::Task),
            bt("bot_request", "Bot request", "robot", TypeCategory::Bot),
            bt("bot_response", "Bot response", "robot", TypeCategory::Bot),
            bt("page", "Page", "file", TypeCategory::System),
        ],
        relation_types: vec![
            rel("parent_of", "child_of", false),
            rel("references", "referenced_by", false),
            rel("cites", "cited_by", false),
            rel("refutes", "refuted_by", false),
            rel("extends", "extended_by", false),
            rel("depends", "depended_on_by", false),
            rel("supersedes", "superseded_by", false),
            rel("answers", "answered_by", false),
            rel("blocks", "blocked_by", false),
            rel("related_to", "related_to", true),
        ],
        version: 1,
        hash: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_seed_and_load() {
        let dir = TempDir::new().unwrap();
        let store = SchemaStore::open(&dir.path().join("schema.db"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(store.version().await.unwrap(), 1);
        let schema = store.load().await.unwrap();
        assert!(schema.block_type("paragraph").is_some());
        assert!(schema.block_type("code").is_some());
        assert_eq!(schema.relation_type("related_to").unwrap().symmetric, true);
        assert_eq!(schema.hash, schema.compute_hash());
        store.close().await;
    }

    #[tokio::test]
    async fn test_reopen_does_not_reseed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schema.db");
        let store = SchemaStore::open(&path, Duration::from_secs(1)).await.unwrap();
        store.close().await;

        let store = SchemaStore::open(&path, Duration::from_secs(1)).await.unwrap();
        let schema = store.load().await.unwrap();
        assert_eq!(schema.version, 1);
        assert_eq!(
            schema.block_types.len(),
            default_schema().block_types.len()
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_relation_lookup() {
        let dir = TempDir::new().unwrap();
        let store = SchemaStore::open(&dir.path().join("schema.db"), Duration::from_secs(1))
            .await
            .unwrap();
        let rel = store.relation_type("cites").await.unwrap().unwrap();
        assert_eq!(rel.inverse, "cited_by");
        assert!(!rel.symmetric);
        assert!(store.relation_type("nope").await.unwrap().is_none());
        assert!(store.has_block_type("task").await.unwrap());
        store.close().await;
    }
}
