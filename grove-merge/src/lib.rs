//! The mutation pipeline behind the grove content store: the filesystem
//! merge queue, the singleton merge daemon, the conflict resolver and the
//! garbage collector.
//!
//! Writers never touch the canonical store. They stage into per-session
//! stores (grove-store), submit into `pending/`, and the merger here applies
//! each session's journal in one canonical transaction or rejects it with a
//! conflict list.

pub mod conflict;
pub mod gc;
pub mod merger;
pub mod queue;
pub mod resolver;

pub use conflict::{Conflict, ConflictKind, ConflictView, Resolution};
pub use gc::{GarbageCollector, GcReport};
pub use merger::{MergeOutcome, Merger, MergerStats};
pub use queue::MergeQueue;
pub use resolver::ConflictResolver;
