//! Session-to-canonical diff enumeration.

use grove_core::{Block, BlockId};

/// The staged effect of a session against the canonical store.
#[derive(Debug, Clone, Default)]
pub struct SessionDiff {
    /// Blocks created in the session
    pub inserts: Vec<Block>,

    /// Copied blocks that were modified
    pub updates: Vec<BlockUpdate>,

    /// Blocks soft-deleted in the session
    pub deletes: Vec<BlockId>,
}

/// One modified block with its canonical counterpart at diff time.
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    /// The canonical row, when it still exists
    pub before: Option<Block>,

    /// The staged row
    pub after: Block,
}

impl SessionDiff {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of staged block changes.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}
