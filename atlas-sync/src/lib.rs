//! # atlas-sync: document sessions, ownership and persistence
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────┐  setup_connection(doc)  ┌───────────────┐
//!   client ──────►│ Registry │────────────────────────►│ Backend       │
//!     │           └──────────┘   token                 │  pending      │
//!     │                                                │  tokens       │
//!     └── connect(doc, token) ────────────────────────►│               │
//!                                                      │  Matchmaker ──┼──► LockStore
//!                                                      │    │          │   (one owner
//!                                                      │    ▼          │    per doc)
//!                                                      │  Session ─────┼──► DocLog
//!                                                      │  (per doc)    │   (RocksDB)
//!                                                      └───────────────┘
//! ```
//!
//! Every document has at most one live [`Session`] across the fleet. The
//! session owns the [`atlas_core::DocStore`], applies edits in arrival order,
//! broadcasts the merged result and saves to the [`DocLog`].
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages between clients and sessions
//! - [`session`]: per-document actor
//! - [`matchmaker`]: per-process session routing and lock ownership
//! - [`lock`]: lock store trait and in-memory implementation
//! - [`backend`]: connection tokens in front of the matchmaker
//! - [`registry`]: backend selection across the fleet
//! - [`storage`]: durable change log (memory, RocksDB)
//! - [`traffic`]: optional JSON-lines traffic log
//! - [`transport`]: newline-delimited JSON over TCP

pub mod backend;
pub mod lock;
pub mod matchmaker;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod storage;
pub mod traffic;
pub mod transport;

// Re-exports for convenience
pub use backend::{Backend, BackendConfig, BackendError, BackendStats, CloseReporter};
pub use lock::{LockError, LockMismatch, LockStatus, LockStore, MemoryLockStore};
pub use matchmaker::{Matchmaker, MatchmakerConfig, MatchmakerError, MatchmakerStats};
pub use protocol::{ErrorKind, IncomingMessage, OutgoingMessage, ProtocolError};
pub use registry::{ConnectionTicket, Registry, RegistryError, RegistryStats, RemoteBackend};
pub use session::{
    Connection, Session, SessionConfig, SessionError, SessionHandle, SessionStats, SessionStatus,
};
pub use storage::{
    DocLog, DocLogError, LogEntry, MemoryDocLog, RocksDocLog, StoreConfig,
};
pub use traffic::TrafficLog;
pub use transport::{serve, Request, Refusal, TransportError};
