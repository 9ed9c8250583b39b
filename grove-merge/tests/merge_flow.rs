//! End-to-end merge pipeline tests: session staging, queue handoff, merge,
//! conflict detection and resolution, cache invalidation, crash recovery.

use chrono::Utc;
use grove_cache::{page_key, PageCache};
use grove_core::config::MergerConfig;
use grove_core::{content_hash, Block, BlockId, BlockSource, GroveError, SessionStatus, UserType};
use grove_merge::{ConflictKind, ConflictResolver, MergeQueue, Merger, Resolution};
use grove_store::{
    CanonicalStore, SchemaStore, SessionDb, SessionManager, SqliteAuditSink,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    canonical: Arc<CanonicalStore>,
    manager: Arc<SessionManager>,
    merger: Arc<Merger>,
    resolver: ConflictResolver,
    audit: Arc<SqliteAuditSink>,
    cache: Arc<PageCache>,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let timeout = Duration::from_secs(1);

    let canonical = Arc::new(
        CanonicalStore::open(&dir.path().join("data").join("content.db"), timeout)
            .await
            .unwrap(),
    );
    let schema = Arc::new(
        SchemaStore::open(&dir.path().join("data").join("schema.db"), timeout)
            .await
            .unwrap(),
    );
    let audit = Arc::new(
        SqliteAuditSink::open(&dir.path().join("data").join("audit.db"), timeout)
            .await
            .unwrap(),
    );
    let cache = Arc::new(
        PageCache::new(dir.path().join("cache"), 16, Duration::from_secs(3600), true).unwrap(),
    );

    let queue = MergeQueue::new(dir.path().join("queue"));
    queue.ensure_layout().await.unwrap();

    let manager = Arc::new(SessionManager::new(
        Arc::clone(&canonical),
        Arc::clone(&schema),
        dir.path().join("sessions"),
        dir.path().join("queue"),
        grove_core::config::SessionConfig::default(),
        timeout,
    ));

    let merger = Arc::new(Merger::new(
        Arc::clone(&canonical),
        Arc::clone(&schema),
        audit.clone(),
        Some(Arc::clone(&cache)),
        queue,
        MergerConfig {
            poll_interval_ms: 50,
            max_retries: 3,
            lock_timeout_ms: 1000,
            recover_on_startup: true,
        },
    ));

    let resolver = ConflictResolver::new(Arc::clone(&manager), Arc::clone(&canonical));

    Fixture {
        _dir: dir,
        canonical,
        manager,
        merger,
        resolver,
        audit,
        cache,
    }
}

async fn assert_invariants(canonical: &CanonicalStore) {
    assert!(canonical.verify_hashes().await.unwrap().is_empty(), "P1");
    assert!(
        canonical.verify_sibling_order().await.unwrap().is_empty(),
        "P2"
    );
    assert!(
        canonical.verify_referential().await.unwrap().is_empty(),
        "P3"
    );
}

#[tokio::test]
async fn single_user_insert_merges() {
    let f = fixture().await;
    let s = f.manager.create("u1", UserType::Human).await.unwrap();

    let mut block = Block::new("paragraph", "Hello");
    block.id = BlockId::new("b1");
    f.manager.insert_block(&s.id, block).await.unwrap();
    f.manager.submit(&s.id).await.unwrap();

    let processed = f.merger.sweep().await.unwrap();
    assert_eq!(processed, 1);

    let merged = f
        .canonical
        .get_live_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.content, "Hello");
    assert_eq!(merged.hash, content_hash("Hello"));
    assert_eq!(merged.created_by, "u1");
    assert_eq!(f.canonical.block_count().await.unwrap(), 1);

    let history = f.audit.merge_history(10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "success");
    assert_eq!(history[0].counts.blocks_inserted, 1);

    // File ended in done/.
    assert_eq!(f.merger.queue().done_files().await.unwrap().len(), 1);
    assert_eq!(
        f.manager.session_status(&s.id).await.unwrap(),
        SessionStatus::Merged
    );
    assert_invariants(&f.canonical).await;
}

#[tokio::test]
async fn concurrent_edits_yield_content_conflict_then_keep_session_resolves() {
    let f = fixture().await;

    // Seed canonical with b1.
    let seed = f.manager.create("seed", UserType::System).await.unwrap();
    let mut block = Block::new("paragraph", "v0");
    block.id = BlockId::new("b1");
    f.manager.insert_block(&seed.id, block).await.unwrap();
    f.manager.submit(&seed.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    let h0 = f
        .canonical
        .get_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .unwrap()
        .hash;

    // A copies b1 (expects h0).
    let a = f.manager.create("alice", UserType::Human).await.unwrap();
    let a_copy = f.manager.copy_block(&a.id, &BlockId::new("b1")).await.unwrap();
    assert_eq!(a_copy.hash, h0);

    // B copies, edits to "Hi", merges first.
    let b = f.manager.create("bob", UserType::Human).await.unwrap();
    let mut b_copy = f.manager.copy_block(&b.id, &BlockId::new("b1")).await.unwrap();
    b_copy.content = "Hi".to_string();
    f.manager.update_block(&b.id, b_copy).await.unwrap();
    f.manager.submit(&b.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    // A edits to "Hey" against the stale copy and submits.
    let mut a_edit = a_copy.clone();
    a_edit.content = "Hey".to_string();
    f.manager.update_block(&a.id, a_edit).await.unwrap();
    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    // Canonical still has B's version; A is conflicted.
    let canonical_now = f
        .canonical
        .get_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canonical_now.content, "Hi");
    assert_eq!(
        f.manager.session_status(&a.id).await.unwrap(),
        SessionStatus::Conflict
    );

    // Scenario 3: keep_session, resubmit, canonical becomes "Hey".
    f.manager.reopen_conflicted(&a.id).await.unwrap();
    let views = f.resolver.conflicts(&a.id).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].conflict.kind, ConflictKind::Content);
    assert_eq!(views[0].conflict.expected_hash.as_deref(), Some(h0.as_str()));
    assert_eq!(views[0].canonical_preview.as_ref().unwrap().content, "Hi");
    assert_eq!(views[0].session_preview.as_ref().unwrap().content, "Hey");

    f.resolver
        .resolve(
            &a.id,
            &[(BlockId::new("b1"), Resolution::KeepSession)],
        )
        .await
        .unwrap();
    assert_eq!(
        f.manager.get_session(&a.id).unwrap().status,
        SessionStatus::Active
    );

    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    let final_block = f
        .canonical
        .get_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_block.content, "Hey");
    assert_invariants(&f.canonical).await;
}

#[tokio::test]
async fn deleted_parent_yields_structure_conflict_make_root_resolves() {
    let f = fixture().await;

    // Seed b1.
    let seed = f.manager.create("seed", UserType::System).await.unwrap();
    let mut b1 = Block::new("paragraph", "parent");
    b1.id = BlockId::new("b1");
    f.manager.insert_block(&seed.id, b1).await.unwrap();
    f.manager.submit(&seed.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    // A stages b3 under b1.
    let a = f.manager.create("alice", UserType::Human).await.unwrap();
    let mut b3 = Block::new("paragraph", "child");
    b3.id = BlockId::new("b3");
    b3.parent_id = Some(BlockId::new("b1"));
    f.manager.insert_block(&a.id, b3).await.unwrap();

    // B deletes b1 and merges first.
    let b = f.manager.create("bob", UserType::Human).await.unwrap();
    f.manager.copy_block(&b.id, &BlockId::new("b1")).await.unwrap();
    f.manager.delete_block(&b.id, &BlockId::new("b1")).await.unwrap();
    f.manager.submit(&b.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    assert!(f
        .canonical
        .get_live_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .is_none());

    // A submits; the merge must reject with a Structure conflict on b3.
    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    assert_eq!(
        f.manager.session_status(&a.id).await.unwrap(),
        SessionStatus::Conflict
    );

    f.manager.reopen_conflicted(&a.id).await.unwrap();
    let views = f.resolver.conflicts(&a.id).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].conflict.kind, ConflictKind::Structure);
    assert_eq!(views[0].conflict.block_id.as_str(), "b3");

    f.resolver
        .resolve(&a.id, &[(BlockId::new("b3"), Resolution::MakeRoot)])
        .await
        .unwrap();
    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let b3 = f
        .canonical
        .get_live_block(&BlockId::new("b3"))
        .await
        .unwrap()
        .unwrap();
    assert!(b3.parent_id.is_none());
    assert_invariants(&f.canonical).await;
}

#[tokio::test]
async fn merge_invalidates_dependent_cached_pages() {
    let f = fixture().await;

    let seed = f.manager.create("seed", UserType::System).await.unwrap();
    let mut b1 = Block::new("paragraph", "v0");
    b1.id = BlockId::new("b1");
    f.manager.insert_block(&seed.id, b1).await.unwrap();
    f.manager.submit(&seed.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    // Cache page /x depending on b1.
    let key = page_key("/x", &[]);
    f.cache.set(&key, b"<html>v0</html>", &["b1".to_string()]).unwrap();
    assert!(f.cache.get(&key).is_some());

    // Merge an update of b1.
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    let mut copy = f.manager.copy_block(&s.id, &BlockId::new("b1")).await.unwrap();
    copy.content = "v1".to_string();
    f.manager.update_block(&s.id, copy).await.unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    // The dependent page is gone; regeneration brings it back.
    assert!(f.cache.get(&key).is_none());
    f.cache.set(&key, b"<html>v1</html>", &["b1".to_string()]).unwrap();
    assert_eq!(f.cache.get(&key).unwrap(), b"<html>v1</html>");
}

#[tokio::test]
async fn crash_recovery_moves_processing_to_failed() {
    let f = fixture().await;

    // A session dies mid-merge: its file sits in processing/.
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    f.manager
        .insert_block(&s.id, Block::new("paragraph", "x"))
        .await
        .unwrap();
    let pending = f.manager.submit(&s.id).await.unwrap();
    let processing = f
        .merger
        .queue()
        .processing_dir()
        .join(pending.file_name().unwrap());
    tokio::fs::rename(&pending, &processing).await.unwrap();

    let recovered = f.merger.recover_interrupted().await.unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(f.merger.queue().failed_files().await.unwrap().len(), 1);

    // Canonical untouched.
    assert_eq!(f.canonical.block_count().await.unwrap(), 0);

    let history = f.audit.merge_history(10, 0).await.unwrap();
    assert_eq!(history[0].status, "failed");
    assert_eq!(history[0].error.as_deref(), Some("interrupted"));
}

#[tokio::test]
async fn empty_session_merges_with_zero_counts() {
    let f = fixture().await;
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let history = f.audit.merge_history(10, 0).await.unwrap();
    assert_eq!(history[0].status, "success");
    assert_eq!(history[0].counts.blocks_inserted, 0);
    assert_eq!(history[0].counts.blocks_updated, 0);
    assert_eq!(
        f.manager.session_status(&s.id).await.unwrap(),
        SessionStatus::Merged
    );
}

#[tokio::test]
async fn noop_update_leaves_canonical_timestamps_alone() {
    let f = fixture().await;

    let seed = f.manager.create("seed", UserType::System).await.unwrap();
    let mut b1 = Block::new("paragraph", "stable");
    b1.id = BlockId::new("b1");
    f.manager.insert_block(&seed.id, b1).await.unwrap();
    f.manager.submit(&seed.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    let before = f
        .canonical
        .get_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .unwrap();

    // Copy, write back unchanged content, submit.
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    let copy = f.manager.copy_block(&s.id, &BlockId::new("b1")).await.unwrap();
    f.manager.update_block(&s.id, copy).await.unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let after = f
        .canonical
        .get_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.hash, before.hash);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(
        f.manager.session_status(&s.id).await.unwrap(),
        SessionStatus::Merged
    );
}

#[tokio::test]
async fn insert_then_delete_merges_to_never_live_row() {
    let f = fixture().await;
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    let mut block = Block::new("paragraph", "ephemeral");
    block.id = BlockId::new("b9");
    f.manager.insert_block(&s.id, block).await.unwrap();
    f.manager.delete_block(&s.id, &BlockId::new("b9")).await.unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    // The row exists but was never live.
    let row = f.canonical.get_block(&BlockId::new("b9")).await.unwrap().unwrap();
    assert!(row.is_deleted());
    assert!(f
        .canonical
        .get_live_block(&BlockId::new("b9"))
        .await
        .unwrap()
        .is_none());
    assert_invariants(&f.canonical).await;
}

#[tokio::test]
async fn reprocessing_a_merged_file_is_a_noop() {
    let f = fixture().await;
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    let mut block = Block::new("paragraph", "once");
    block.id = BlockId::new("b1");
    f.manager.insert_block(&s.id, block).await.unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let token_after_first = f.canonical.snapshot_token().await.unwrap();

    // Operator moves the done file back to pending; a second run must not
    // change canonical (the journal is already marked merged).
    let done = f.merger.queue().done_files().await.unwrap();
    let back = f
        .merger
        .queue()
        .pending_dir()
        .join(done[0].1.file_name().unwrap());
    tokio::fs::rename(&done[0].1, &back).await.unwrap();
    f.merger.sweep().await.unwrap();

    assert_eq!(
        f.canonical.snapshot_token().await.unwrap(),
        token_after_first
    );
    assert_invariants(&f.canonical).await;
}

#[tokio::test]
async fn newer_session_schema_is_rejected_by_merger() {
    let f = fixture().await;

    // Craft a submitted file directly in pending/ with a future schema, as
    // if it came from a newer deployment.
    let path = f.merger.queue().pending_dir().join("u9_1_ff.db");
    {
        let now = Utc::now();
        let meta = grove_core::SessionMeta {
            id: grove_core::SessionId::new("u9_1_ff"),
            user_id: "u9".to_string(),
            user_type: UserType::Human,
            created_at: now,
            last_activity: now,
            base_snapshot: "0:".to_string(),
            schema_version: 99,
            schema_hash: "h".to_string(),
            status: SessionStatus::Submitted,
        };
        let db = SessionDb::create(&path, &meta, Duration::from_secs(1)).await.unwrap();
        db.close().await;
    }
    f.merger.sweep().await.unwrap();

    assert_eq!(f.merger.queue().failed_files().await.unwrap().len(), 1);
    let history = f.audit.merge_history(10, 0).await.unwrap();
    assert_eq!(history[0].status, "failed");
    assert!(history[0].error.as_deref().unwrap().contains("Schema mismatch"));
    assert_eq!(f.canonical.block_count().await.unwrap(), 0);
}

#[tokio::test]
async fn links_merge_and_symmetric_relations_mirror() {
    let f = fixture().await;
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    let mut a = Block::new("paragraph", "a");
    a.id = BlockId::new("ba");
    let mut b = Block::new("paragraph", "b");
    b.id = BlockId::new("bb");
    f.manager.insert_block(&s.id, a).await.unwrap();
    f.manager.insert_block(&s.id, b).await.unwrap();
    f.manager
        .link(&s.id, &BlockId::new("ba"), &BlockId::new("bb"), "cites", None)
        .await
        .unwrap();
    f.manager
        .link(
            &s.id,
            &BlockId::new("ba"),
            &BlockId::new("bb"),
            "related_to",
            None,
        )
        .await
        .unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let from_a = f.canonical.get_refs_from(&BlockId::new("ba")).await.unwrap();
    assert_eq!(from_a.len(), 2);

    // related_to is symmetric: the mirror row exists.
    let from_b = f.canonical.get_refs_from(&BlockId::new("bb")).await.unwrap();
    assert_eq!(from_b.len(), 1);
    assert_eq!(from_b[0].ref_type, "related_to");
    assert_invariants(&f.canonical).await;
}

#[tokio::test]
async fn attrs_ride_along_with_merge() {
    let f = fixture().await;
    let s = f.manager.create("u1", UserType::Human).await.unwrap();
    let mut task = Block::new("task", "ship it");
    task.id = BlockId::new("t1");
    f.manager.insert_block(&s.id, task).await.unwrap();
    f.manager
        .set_attr(&s.id, &BlockId::new("t1"), "status", "\"open\"")
        .await
        .unwrap();
    f.manager.submit(&s.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let attrs = f.canonical.get_attrs(&BlockId::new("t1")).await.unwrap();
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].name, "status");
    assert_eq!(attrs[0].value, "\"open\"");
}

#[tokio::test]
async fn discard_resolution_drops_the_block() {
    let f = fixture().await;

    // Seed and then delete b1 under A's feet.
    let seed = f.manager.create("seed", UserType::System).await.unwrap();
    let mut b1 = Block::new("paragraph", "target");
    b1.id = BlockId::new("b1");
    f.manager.insert_block(&seed.id, b1).await.unwrap();
    f.manager.submit(&seed.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let a = f.manager.create("alice", UserType::Human).await.unwrap();
    let mut copy = f.manager.copy_block(&a.id, &BlockId::new("b1")).await.unwrap();
    copy.content = "edit".to_string();
    f.manager.update_block(&a.id, copy).await.unwrap();

    let b = f.manager.create("bob", UserType::Human).await.unwrap();
    f.manager.copy_block(&b.id, &BlockId::new("b1")).await.unwrap();
    f.manager.delete_block(&b.id, &BlockId::new("b1")).await.unwrap();
    f.manager.submit(&b.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    assert_eq!(
        f.manager.session_status(&a.id).await.unwrap(),
        SessionStatus::Conflict
    );

    f.manager.reopen_conflicted(&a.id).await.unwrap();
    let views = f.resolver.conflicts(&a.id).await.unwrap();
    assert_eq!(views[0].conflict.kind, ConflictKind::Deleted);

    f.resolver
        .resolve(&a.id, &[(BlockId::new("b1"), Resolution::Discard)])
        .await
        .unwrap();

    // Nothing left to merge; resubmit is an empty success.
    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    assert_eq!(
        f.manager.session_status(&a.id).await.unwrap(),
        SessionStatus::Merged
    );
    assert!(f
        .canonical
        .get_live_block(&BlockId::new("b1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn resolver_rejects_mismatched_choice() {
    let f = fixture().await;

    let seed = f.manager.create("seed", UserType::System).await.unwrap();
    let mut b1 = Block::new("paragraph", "v0");
    b1.id = BlockId::new("b1");
    f.manager.insert_block(&seed.id, b1).await.unwrap();
    f.manager.submit(&seed.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    let a = f.manager.create("alice", UserType::Human).await.unwrap();
    let mut copy = f.manager.copy_block(&a.id, &BlockId::new("b1")).await.unwrap();
    copy.content = "mine".to_string();
    f.manager.update_block(&a.id, copy).await.unwrap();

    let b = f.manager.create("bob", UserType::Human).await.unwrap();
    let mut other = f.manager.copy_block(&b.id, &BlockId::new("b1")).await.unwrap();
    other.content = "theirs".to_string();
    f.manager.update_block(&b.id, other).await.unwrap();
    f.manager.submit(&b.id).await.unwrap();
    f.merger.sweep().await.unwrap();

    f.manager.submit(&a.id).await.unwrap();
    f.merger.sweep().await.unwrap();
    f.manager.reopen_conflicted(&a.id).await.unwrap();

    // Recreate is a Deleted-conflict choice; this is a Content conflict.
    let err = f
        .resolver
        .resolve(&a.id, &[(BlockId::new("b1"), Resolution::Recreate)])
        .await
        .unwrap_err();
    assert!(matches!(err, GroveError::InvalidInput(_)));

    // KeepContent takes canonical's version and the resubmit is a no-op.
    f.resolver
        .resolve(&a.id, &[(BlockId::new("b1"), Resolution::KeepContent)])
        .await
        .unwrap();
    let handle = f.manager.session_db(&a.id).unwrap();
    let staged = handle.db().get_block(&BlockId::new("b1")).await.unwrap().unwrap();
    assert_eq!(staged.block.content, "theirs");
    assert_eq!(staged.source, BlockSource::Copy);
    assert!(!staged.dirty);
}
