//! The conflict resolver: turns a conflicted session's stored conflict list
//! into presentable data and rewrites the session store to encode the user's
//! chosen resolutions so the session can be resubmitted.

use crate::conflict::{Conflict, ConflictKind, ConflictView, Resolution};
use grove_core::{BlockId, BlockSource, GroveError, Result, SessionId, SessionStatus};
use grove_store::{set_session_status, CanonicalStore, SessionManager};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ConflictResolver {
    manager: Arc<SessionManager>,
    canonical: Arc<CanonicalStore>,
}

impl ConflictResolver {
    pub fn new(manager: Arc<SessionManager>, canonical: Arc<CanonicalStore>) -> Self {
        Self { manager, canonical }
    }

    /// The session's conflicts, enriched with session/canonical previews and
    /// suggested choices. The session must be hosted (see
    /// [`SessionManager::reopen_conflicted`]).
    pub async fn conflicts(&self, id: &SessionId) -> Result<Vec<ConflictView>> {
        let handle = self.manager.session_db(id)?;
        let mut views = Vec::new();
        for payload in handle.db().load_conflicts().await? {
            let conflict: Conflict = serde_json::from_str(&payload)?;
            let session_preview = handle
                .db()
                .get_block(&conflict.block_id)
                .await?
                .map(|s| s.block);
            let canonical_preview = self.canonical.get_block(&conflict.block_id).await?;
            let suggested = conflict
                .suggested_choices()
                .iter()
                .map(|s| s.to_string())
                .collect();
            views.push(ConflictView {
                conflict,
                session_preview,
                canonical_preview,
                suggested,
            });
        }
        Ok(views)
    }

    /// Apply a batch of resolutions and return the session to `active` so it
    /// can be resubmitted.
    ///
    /// Every conflicted block must be covered by exactly one resolution that
    /// matches its conflict kind; nothing is applied otherwise.
    pub async fn resolve(
        &self,
        id: &SessionId,
        resolutions: &[(BlockId, Resolution)],
    ) -> Result<()> {
        let handle = self.manager.session_db(id)?;
        let meta = handle.meta();
        if meta.status != SessionStatus::Conflict {
            return Err(GroveError::not_active(id.as_str(), meta.status.as_str()));
        }

        let mut conflicts: HashMap<String, Conflict> = HashMap::new();
        for payload in handle.db().load_conflicts().await? {
            let c: Conflict = serde_json::from_str(&payload)?;
            conflicts.insert(c.block_id.as_str().to_string(), c);
        }

        // Validate the whole batch before touching any rows.
        for (block_id, resolution) in resolutions {
            let conflict = conflicts.get(block_id.as_str()).ok_or_else(|| {
                GroveError::invalid_input(format!("block {block_id} has no recorded conflict"))
            })?;
            if !resolution.applies_to(conflict.kind) {
                return Err(GroveError::invalid_input(format!(
                    "resolution does not apply to a {:?} conflict on {block_id}",
                    conflict.kind
                )));
            }
        }
        let unresolved: Vec<&String> = conflicts
            .keys()
            .filter(|k| !resolutions.iter().any(|(b, _)| b.as_str() == k.as_str()))
            .collect();
        if !unresolved.is_empty() {
            return Err(GroveError::invalid_input(format!(
                "{} conflict(s) left without a resolution",
                unresolved.len()
            )));
        }

        for (block_id, resolution) in resolutions {
            let conflict = &conflicts[block_id.as_str()];
            self.apply_one(&handle, block_id, conflict, resolution).await?;
        }

        handle.db().clear_conflicts().await?;
        set_session_status(&handle, SessionStatus::Active).await?;
        info!(
            "Session {id}: {} resolution(s) applied, back to active",
            resolutions.len()
        );
        Ok(())
    }

    async fn apply_one(
        &self,
        handle: &Arc<grove_store::SessionHandle>,
        block_id: &BlockId,
        conflict: &Conflict,
        resolution: &Resolution,
    ) -> Result<()> {
        debug!("Resolving {:?} on {block_id}", conflict.kind);
        let db = handle.db();

        match resolution {
            // Acknowledge the canonical overwrite: expect the hash canonical
            // has now, so revalidation passes and the session row wins.
            Resolution::KeepSession => {
                let current = self
                    .canonical
                    .get_live_block(block_id)
                    .await?
                    .ok_or_else(|| GroveError::not_found("block", block_id.as_str()))?;
                db.set_dep_hash(block_id, block_id.as_str(), &current.hash)
                    .await?;
            }

            // Take canonical's version: overwrite the row, drop the staged
            // edits from the journal, and refresh the dependency snapshot.
            Resolution::KeepContent => {
                let current = self
                    .canonical
                    .get_live_block(block_id)
                    .await?
                    .ok_or_else(|| GroveError::not_found("block", block_id.as_str()))?;
                db.overwrite_block(&current, BlockSource::Copy, false).await?;
                db.delete_changes_for(block_id).await?;
                db.set_dep_hash(block_id, block_id.as_str(), &current.hash)
                    .await?;
            }

            // Replace the staged row with the user's merged block.
            Resolution::Manual { block } => {
                let staged = db
                    .get_block(block_id)
                    .await?
                    .ok_or_else(|| GroveError::not_found("block", block_id.as_str()))?;
                let mut merged = block.clone();
                merged.id = block_id.clone();
                merged.created_at = staged.block.created_at;
                merged.updated_at = chrono::Utc::now();
                merged.rehash();
                db.overwrite_block(&merged, staged.source, true).await?;
                if let Some(current) = self.canonical.get_live_block(block_id).await? {
                    db.set_dep_hash(block_id, block_id.as_str(), &current.hash)
                        .await?;
                }
            }

            // The original vanished: re-insert instead of updating it.
            Resolution::Recreate => {
                db.set_source(block_id, BlockSource::New).await?;
                db.delete_dep(block_id).await?;
            }

            Resolution::NewParent { parent_id } => {
                if self.canonical.get_live_block(parent_id).await?.is_none() {
                    return Err(GroveError::invalid_input(format!(
                        "new parent {parent_id} does not exist in canonical"
                    )));
                }
                db.set_parent(block_id, Some(parent_id)).await?;
            }

            Resolution::MakeRoot => {
                db.set_parent(block_id, None).await?;
            }

            Resolution::Discard => {
                db.purge_block(block_id).await?;
            }
        }
        Ok(())
    }
}
