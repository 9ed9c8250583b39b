//! Embedded DDL for every grove store.

use grove_core::Result;
use sqlx::SqlitePool;

/// Canonical content store: blocks, refs, attrs and the full-text index.
pub const CONTENT_DDL: &str = r"
CREATE TABLE IF NOT EXISTS blocks (
    id           TEXT PRIMARY KEY,
    parent_id    TEXT,
    type         TEXT NOT NULL,
    content      TEXT NOT NULL DEFAULT '',
    content_html TEXT,
    position     TEXT NOT NULL,
    hash         TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    created_by   TEXT NOT NULL DEFAULT '',
    published    INTEGER NOT NULL DEFAULT 0,
    deleted_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_blocks_parent_position ON blocks(parent_id, position);
CREATE INDEX IF NOT EXISTS idx_blocks_type ON blocks(type);
CREATE INDEX IF NOT EXISTS idx_blocks_updated_at ON blocks(updated_at);
CREATE INDEX IF NOT EXISTS idx_blocks_hash ON blocks(hash);
CREATE INDEX IF NOT EXISTS idx_blocks_published ON blocks(published) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS refs (
    from_id    TEXT NOT NULL,
    to_id      TEXT NOT NULL,
    type       TEXT NOT NULL,
    anchor     TEXT,
    created_at TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (from_id, to_id, type)
);

CREATE INDEX IF NOT EXISTS idx_refs_to ON refs(to_id);

CREATE TABLE IF NOT EXISTS attrs (
    block_id TEXT NOT NULL,
    name     TEXT NOT NULL,
    value    TEXT NOT NULL,
    PRIMARY KEY (block_id, name)
);

CREATE VIRTUAL TABLE IF NOT EXISTS blocks_fts USING fts5(
    id UNINDEXED,
    type UNINDEXED,
    content
);

CREATE TRIGGER IF NOT EXISTS blocks_fts_ai AFTER INSERT ON blocks BEGIN
    DELETE FROM blocks_fts WHERE id = new.id;
    INSERT INTO blocks_fts(id, type, content) VALUES (new.id, new.type, new.content);
END;

CREATE TRIGGER IF NOT EXISTS blocks_fts_au AFTER UPDATE OF content ON blocks BEGIN
    DELETE FROM blocks_fts WHERE id = old.id;
    INSERT INTO blocks_fts(id, type, content) VALUES (new.id, new.type, new.content);
END;

CREATE TRIGGER IF NOT EXISTS blocks_fts_ad AFTER DELETE ON blocks BEGIN
    DELETE FROM blocks_fts WHERE id = old.id;
END;
";

/// Type schema store: block types, relation types and the schema version.
pub const SCHEMA_DDL: &str = r"
CREATE TABLE IF NOT EXISTS block_types (
    name             TEXT PRIMARY KEY,
    label            TEXT NOT NULL,
    icon             TEXT NOT NULL DEFAULT '',
    json_schema      TEXT,
    allowed_parents  TEXT NOT NULL DEFAULT '[]',
    allowed_children TEXT NOT NULL DEFAULT '[]',
    category         TEXT NOT NULL,
    version          INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS relation_types (
    name      TEXT PRIMARY KEY,
    inverse   TEXT NOT NULL,
    symmetric INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schema_meta (
    id      INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    hash    TEXT NOT NULL
);
";

/// Users store; written by the out-of-scope auth layer, created here.
pub const USERS_DDL: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL DEFAULT '',
    user_type  TEXT NOT NULL DEFAULT 'human',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS permissions (
    user_id  TEXT NOT NULL,
    resource TEXT NOT NULL,
    level    TEXT NOT NULL,
    PRIMARY KEY (user_id, resource)
);

CREATE TABLE IF NOT EXISTS api_keys (
    key_hash     TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    last_used_at TEXT
);
";

/// Audit store: the per-operation audit log and the per-merge log.
pub const AUDIT_DDL: &str = r"
CREATE TABLE IF NOT EXISTS audit_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    ts         TEXT NOT NULL,
    session_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    user_type  TEXT NOT NULL,
    operation  TEXT NOT NULL,
    block_id   TEXT NOT NULL,
    block_type TEXT NOT NULL DEFAULT '',
    before     TEXT,
    after      TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_block ON audit_log(block_id);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id);
CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(ts);
CREATE INDEX IF NOT EXISTS idx_audit_operation ON audit_log(operation);

CREATE TABLE IF NOT EXISTS merge_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ts              TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    status          TEXT NOT NULL,
    blocks_inserted INTEGER NOT NULL DEFAULT 0,
    blocks_updated  INTEGER NOT NULL DEFAULT 0,
    blocks_deleted  INTEGER NOT NULL DEFAULT 0,
    refs_changed    INTEGER NOT NULL DEFAULT 0,
    conflicts       INTEGER NOT NULL DEFAULT 0,
    duration_ms     INTEGER NOT NULL DEFAULT 0,
    error           TEXT
);

CREATE INDEX IF NOT EXISTS idx_merge_session ON merge_log(session_id);
CREATE INDEX IF NOT EXISTS idx_merge_ts ON merge_log(ts);
";

/// Session store: a mirror of the content schema plus staging metadata,
/// the change journal and the structural-dependency snapshots.
pub const SESSION_DDL: &str = r"
CREATE TABLE IF NOT EXISTS blocks (
    id           TEXT PRIMARY KEY,
    parent_id    TEXT,
    type         TEXT NOT NULL,
    content      TEXT NOT NULL DEFAULT '',
    content_html TEXT,
    position     TEXT NOT NULL,
    hash         TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    created_by   TEXT NOT NULL DEFAULT '',
    published    INTEGER NOT NULL DEFAULT 0,
    deleted_at   TEXT,
    _dirty       INTEGER NOT NULL DEFAULT 0,
    _source      TEXT NOT NULL DEFAULT 'new' CHECK (_source IN ('new', 'copy'))
);

CREATE TABLE IF NOT EXISTS refs (
    from_id    TEXT NOT NULL,
    to_id      TEXT NOT NULL,
    type       TEXT NOT NULL,
    anchor     TEXT,
    created_at TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (from_id, to_id, type)
);

CREATE TABLE IF NOT EXISTS attrs (
    block_id TEXT NOT NULL,
    name     TEXT NOT NULL,
    value    TEXT NOT NULL,
    PRIMARY KEY (block_id, name)
);

CREATE TABLE IF NOT EXISTS _session_meta (
    id             TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL,
    user_type      TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    last_activity  TEXT NOT NULL,
    base_snapshot  TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    schema_hash    TEXT NOT NULL,
    status         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _changes (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ts        TEXT NOT NULL,
    operation TEXT NOT NULL,
    block_id  TEXT NOT NULL,
    field     TEXT,
    before    TEXT,
    after     TEXT,
    merged    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS _structural_deps (
    block_id        TEXT PRIMARY KEY,
    depends_on      TEXT NOT NULL DEFAULT '[]',
    snapshot_hashes TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS _conflicts (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    detail TEXT NOT NULL
);
";

/// Execute a DDL batch. `raw_sql` runs the whole multi-statement script,
/// trigger bodies included.
pub async fn apply_ddl(pool: &SqlitePool, ddl: &str) -> Result<()> {
    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

/// Open a store file just long enough to apply a DDL batch.
pub async fn apply_ddl_to(
    path: &std::path::Path,
    ddl: &str,
    busy_timeout: std::time::Duration,
) -> Result<()> {
    let pool = crate::store::open_store(path, crate::store::StoreJournal::Wal, busy_timeout, 1).await?;
    let result = apply_ddl(&pool, ddl).await;
    pool.close().await;
    result
}
