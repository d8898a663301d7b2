//! Durable per-document change log.
//!
//! ```text
//!            head
//!             │
//!   ┌─────────▼──┬─────────┬─────────┬─────────┐
//!   │ [1, 40]    │ [41,41] │ [42,57] │ [58,60] │   entries, keyed by start
//!   │ (snapshot) │         │         │         │
//!   └────────────┴─────────┴─────────┴─────────┘
//!        replace      push      push      push
//! ```
//!
//! Each entry covers an inclusive generation range and carries the changes
//! made in it. `replace` writes a full snapshot and moves the head, which
//! drops everything before it. Loading replays entries from the head.

pub mod loader;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use atlas_core::Changeset;
use thiserror::Error;
use uuid::Uuid;

pub use loader::{load_store, plan_save, LoadedDoc, PlannedSave, SaveKind};
pub use memory::MemoryDocLog;
pub use rocks::{RocksDocLog, StoreConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocLogError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("doc log unavailable: {0}")]
    Unavailable(String),
}

/// One persisted batch of changes.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub generation_start: u64,
    /// Inclusive.
    pub generation_end: u64,
    pub changeset: Changeset,
}

#[async_trait]
pub trait DocLog: Send + Sync {
    /// Entries at or after the head, ordered by start generation.
    async fn load(&self, doc_id: Uuid) -> Result<Vec<LogEntry>, DocLogError>;

    async fn push(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError>;

    /// Atomically move the head to `entry.generation_start`, drop the rows
    /// before it and store `entry`.
    async fn replace(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError>;
}
