//! Error types for the grove system.

/// Result type alias for grove operations.
pub type Result<T> = std::result::Result<T, GroveError>;

/// Main error type for the grove system.
#[derive(Debug, thiserror::Error)]
pub enum GroveError {
    /// Storage layer errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Operation attempted on a session that is not active
    #[error("Session {session} is not active (status: {status})")]
    NotActive { session: String, status: String },

    /// Session schema is newer than the canonical schema
    #[error("Schema mismatch: session has version {session_version}, canonical has {canonical_version}")]
    SchemaMismatch {
        session_version: i64,
        canonical_version: i64,
    },

    /// Transient errors (I/O contention, lock timeouts); eligible for retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// A session file that cannot be opened or parsed
    #[error("Corrupt session: {0}")]
    CorruptSession(String),

    /// The canonical store is unavailable; the component must exit
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GroveError {
    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new not-active error
    pub fn not_active(session: impl Into<String>, status: impl Into<String>) -> Self {
        Self::NotActive {
            session: session.into(),
            status: status.into(),
        }
    }

    /// Create a new transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a new corrupt-session error
    pub fn corrupt_session(msg: impl Into<String>) -> Self {
        Self::CorruptSession(msg.into())
    }

    /// Create a new fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for GroveError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.message().contains("locked") => {
                Self::Transient(format!("database locked: {}", db.message()))
            }
            sqlx::Error::PoolTimedOut => Self::Transient("connection pool timed out".to_string()),
            sqlx::Error::RowNotFound => {
                Self::NotFound {
                    resource: "row".to_string(),
                    id: String::new(),
                }
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}
