//! The block/ref/attr content model and the type schema entries.

use crate::id::BlockId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A typed content block.
///
/// Blocks form a forest under `parent_id`; siblings are ordered by the
/// fractional-index string in `position`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Unique block identifier
    pub id: BlockId,

    /// Parent block, if any
    pub parent_id: Option<BlockId>,

    /// Block type name (must exist in the current schema)
    #[serde(rename = "type")]
    pub block_type: String,

    /// Markdown content
    pub content: String,

    /// Rendered HTML, if the renderer has produced it
    pub content_html: Option<String>,

    /// Fractional ordering key among siblings
    pub position: String,

    /// SHA-256 of `content`, lowercase hex
    pub hash: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// User that created the block
    pub created_by: String,

    /// Whether the block is published
    pub published: bool,

    /// Soft-delete timestamp; once set it is never cleared
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Block {
    /// Create a new block with freshly computed hash and timestamps.
    pub fn new(block_type: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: BlockId::generate(),
            parent_id: None,
            block_type: block_type.into(),
            hash: content_hash(&content),
            content,
            content_html: None,
            position: crate::findex::initial(),
            created_at: now,
            updated_at: now,
            created_by: String::new(),
            published: false,
            deleted_at: None,
        }
    }

    /// Recompute `hash` from the current content.
    pub fn rehash(&mut self) {
        self.hash = content_hash(&self.content);
    }

    /// Whether the block is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// SHA-256 of a content string, lowercase hex.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A typed, directed reference between two blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub from_id: BlockId,
    pub to_id: BlockId,

    /// Relation type name (must exist in the relation schema)
    #[serde(rename = "type")]
    pub ref_type: String,

    /// Optional anchor within the source block
    pub anchor: Option<String>,

    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// A string attribute on a block. `value` is JSON-encoded where typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr {
    pub block_id: BlockId,
    pub name: String,
    pub value: String,
}

/// Categories a block type can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCategory {
    Content,
    Discussion,
    Knowledge,
    Task,
    Bot,
    System,
}

/// Schema entry describing one block type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockType {
    pub name: String,
    pub label: String,
    pub icon: String,

    /// JSON schema used to validate attrs of blocks of this type
    pub json_schema: Option<String>,

    /// Whitelist of parent type names; empty means any
    pub allowed_parents: Vec<String>,

    /// Whitelist of child type names; empty means any
    pub allowed_children: Vec<String>,

    pub category: TypeCategory,
    pub version: i64,
}

/// Schema entry describing one relation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationType {
    pub name: String,

    /// Declared inverse relation name
    pub inverse: String,

    /// Symmetric relations imply the mirrored row exists
    pub symmetric: bool,
}

/// The process-wide type schema with its monotonic version and content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub block_types: Vec<BlockType>,
    pub relation_types: Vec<RelationType>,
    pub version: i64,
    pub hash: String,
}

impl SchemaDef {
    /// Look up a block type by name.
    pub fn block_type(&self, name: &str) -> Option<&BlockType> {
        self.block_types.iter().find(|t| t.name == name)
    }

    /// Look up a relation type by name.
    pub fn relation_type(&self, name: &str) -> Option<&RelationType> {
        self.relation_types.iter().find(|t| t.name == name)
    }

    /// Compute the schema content hash over its serialized entries.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for t in &self.block_types {
            hasher.update(t.name.as_bytes());
            hasher.update([0]);
            hasher.update(t.version.to_le_bytes());
        }
        for r in &self.relation_types {
            hasher.update(r.name.as_bytes());
            hasher.update([0]);
            hasher.update(r.inverse.as_bytes());
            hasher.update([r.symmetric as u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Who owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Human,
    Bot,
    System,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Bot => "bot",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for UserType {
    type Err = crate::error::GroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "bot" => Ok(Self::Bot),
            "system" => Ok(Self::System),
            other => Err(crate::error::GroveError::invalid_input(format!(
                "unknown user type '{other}'"
            ))),
        }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting staging operations
    Active,

    /// Handed to the merger queue
    Submitted,

    /// Changes applied to canonical
    Merged,

    /// Rejected with a conflict list awaiting resolution
    Conflict,

    /// Abandoned without merging
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Submitted => "submitted",
            Self::Merged => "merged",
            Self::Conflict => "conflict",
            Self::Abandoned => "abandoned",
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Abandoned)
    }

    /// Validate a state transition.
    ///
    /// active → submitted | abandoned; submitted → merged | conflict;
    /// conflict → active (resolution) | abandoned.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Active, Submitted)
                | (Active, Abandoned)
                | (Submitted, Merged)
                | (Submitted, Conflict)
                | (Conflict, Active)
                | (Conflict, Abandoned)
        )
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = crate::error::GroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "submitted" => Ok(Self::Submitted),
            "merged" => Ok(Self::Merged),
            "conflict" => Ok(Self::Conflict),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(crate::error::GroveError::invalid_input(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a session row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSource {
    /// Created inside the session
    New,

    /// Copied from the canonical store
    Copy,
}

impl BlockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Copy => "copy",
        }
    }
}

impl std::str::FromStr for BlockSource {
    type Err = crate::error::GroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "copy" => Ok(Self::Copy),
            other => Err(crate::error::GroveError::invalid_input(format!(
                "unknown block source '{other}'"
            ))),
        }
    }
}

/// Operations recorded in a session's change journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Link,
    Unlink,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Link => "link",
            Self::Unlink => "unlink",
        }
    }
}

impl std::str::FromStr for ChangeOp {
    type Err = crate::error::GroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "link" => Ok(Self::Link),
            "unlink" => Ok(Self::Unlink),
            other => Err(crate::error::GroveError::invalid_input(format!(
                "unknown change operation '{other}'"
            ))),
        }
    }
}

/// One row of a session's append-only change journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    /// Monotonic journal id within the session
    pub id: i64,

    /// High-resolution timestamp
    pub ts: DateTime<Utc>,

    pub operation: ChangeOp,
    pub block_id: BlockId,

    /// Affected field, when the operation targets one
    pub field: Option<String>,

    /// Compact JSON snapshot before the operation
    pub before: Option<serde_json::Value>,

    /// Compact JSON snapshot after the operation
    pub after: Option<serde_json::Value>,

    /// Set by the merger once applied to canonical
    pub merged: bool,
}

/// A session's declaration that a referenced block's canonical state is
/// expected to hold until merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralDep {
    /// The block this dependency belongs to
    pub block_id: BlockId,

    /// Blocks this one structurally depends on (its parent at copy time)
    pub depends_on: Vec<BlockId>,

    /// Canonical hash of each dependency at copy time, keyed by block id
    pub snapshot_hashes: std::collections::HashMap<String, String>,
}

/// Session metadata as persisted in the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: crate::id::SessionId,
    pub user_id: String,
    pub user_type: UserType,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,

    /// Digest of the canonical store at session open
    pub base_snapshot: String,

    pub schema_version: i64,
    pub schema_hash: String,
    pub status: SessionStatus,
}
