//! Conflict classification and user-facing resolutions.

use grove_core::{Block, BlockId};
use serde::{Deserialize, Serialize};

/// Why a submitted session was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// A structural-dependency hash no longer matches canonical
    Content,

    /// A referenced block is gone from canonical
    Deleted,

    /// A parent or ref endpoint would dangle after merge
    Structure,

    /// Reserved for permission-aware deployments
    Permission,
}

/// One conflict detected at merge time, persisted into the session store
/// for the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub block_id: BlockId,
    pub kind: ConflictKind,

    /// Hash the session expected (Content conflicts)
    pub expected_hash: Option<String>,

    /// Hash canonical currently has (Content conflicts)
    pub canonical_hash: Option<String>,

    /// Human-readable explanation
    pub detail: String,
}

impl Conflict {
    pub fn new(block_id: BlockId, kind: ConflictKind, detail: impl Into<String>) -> Self {
        Self {
            block_id,
            kind,
            expected_hash: None,
            canonical_hash: None,
            detail: detail.into(),
        }
    }

    pub fn with_hashes(mut self, expected: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.expected_hash = Some(expected.into());
        self.canonical_hash = Some(canonical.into());
        self
    }

    /// The resolution choices a UI should offer for this conflict.
    pub fn suggested_choices(&self) -> &'static [&'static str] {
        match self.kind {
            ConflictKind::Content => &["keep_session", "keep_content", "manual"],
            ConflictKind::Deleted => &["recreate", "discard"],
            ConflictKind::Structure => &["new_parent", "make_root", "discard"],
            ConflictKind::Permission => &[],
        }
    }
}

/// A user-chosen resolution for one conflicted block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "choice", rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the session's version; acknowledge overwriting canonical
    KeepSession,

    /// Take the canonical version; the staged edits are dropped
    KeepContent,

    /// Replace the staged row with a hand-merged block
    Manual { block: Block },

    /// Re-insert the block instead of updating the vanished original
    Recreate,

    /// Reparent under an existing block
    NewParent { parent_id: BlockId },

    /// Detach to the root of the forest
    MakeRoot,

    /// Drop the staged block entirely
    Discard,
}

impl Resolution {
    /// Whether this resolution applies to a conflict of the given kind.
    pub fn applies_to(&self, kind: ConflictKind) -> bool {
        matches!(
            (kind, self),
            (ConflictKind::Content, Resolution::KeepSession)
                | (ConflictKind::Content, Resolution::KeepContent)
                | (ConflictKind::Content, Resolution::Manual { .. })
                | (ConflictKind::Deleted, Resolution::Recreate)
                | (ConflictKind::Deleted, Resolution::Discard)
                | (ConflictKind::Structure, Resolution::NewParent { .. })
                | (ConflictKind::Structure, Resolution::MakeRoot)
                | (ConflictKind::Structure, Resolution::Discard)
        )
    }
}

/// A conflict enriched with previews for presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictView {
    #[serde(flatten)]
    pub conflict: Conflict,

    /// The block as staged in the session
    pub session_preview: Option<Block>,

    /// The block as it stands in canonical
    pub canonical_preview: Option<Block>,

    pub suggested: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let c = Conflict::new(BlockId::new("b1"), ConflictKind::Content, "hash moved")
            .with_hashes("h0", "h1");
        let json = serde_json::to_string(&c).unwrap();
        let back: Conflict = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ConflictKind::Content);
        assert_eq!(back.expected_hash.as_deref(), Some("h0"));
    }

    #[test]
    fn test_resolution_tagging() {
        let r = Resolution::NewParent {
            parent_id: BlockId::new("p1"),
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"choice\":\"new_parent\""));
        let back: Resolution = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Resolution::NewParent { .. }));
    }

    #[test]
    fn test_applies_to_matrix() {
        assert!(Resolution::KeepSession.applies_to(ConflictKind::Content));
        assert!(Resolution::Recreate.applies_to(ConflictKind::Deleted));
        assert!(Resolution::MakeRoot.applies_to(ConflictKind::Structure));
        assert!(Resolution::Discard.applies_to(ConflictKind::Structure));

        assert!(!Resolution::KeepSession.applies_to(ConflictKind::Deleted));
        assert!(!Resolution::Recreate.applies_to(ConflictKind::Content));
        assert!(!Resolution::Discard.applies_to(ConflictKind::Content));
    }

    #[test]
    fn test_suggested_choices_match_kind() {
        let c = Conflict::new(BlockId::new("b"), ConflictKind::Deleted, "gone");
        assert_eq!(c.suggested_choices(), &["recreate", "discard"]);
    }
}
