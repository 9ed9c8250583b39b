//! Storage layer for grove: SQLite-backed stores, the session manager and
//! the audit sink.
//!
//! The canonical store is read by every component and written only by the
//! merge daemon; each editing session owns its own store file until it is
//! handed to the merge queue.

pub mod audit;
pub mod canonical;
pub mod ddl;
pub mod diff;
pub mod schema_store;
pub mod session;
pub mod session_db;
pub mod store;

mod rows;

pub use audit::{
    AuditEntry, AuditQuery, AuditSink, MergeCounts, MergeLogEntry, MergeRecord, SqliteAuditSink,
};
pub use canonical::CanonicalStore;
pub use ddl::{apply_ddl, apply_ddl_to};
pub use diff::{BlockUpdate, SessionDiff};
pub use schema_store::{default_schema, SchemaStore};
pub use session::{set_session_status, SessionHandle, SessionManager};
pub use session_db::{SessionBlock, SessionDb};
pub use store::{fmt_ts, fmt_ts_nanos, open_existing, open_store, parse_ts, StoreJournal, StorePaths};
