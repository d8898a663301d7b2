//! Backend gate: one-shot connection tokens in front of the matchmaker.
//!
//! ```text
//!  registry ── setup_connection(doc, token) ──► pending tokens ──┐
//!                                                  (TTL, swept)  │
//!  client ──── connect(doc, token, client) ────────── consume ───┴──► Matchmaker::connect
//!
//!  Matchmaker session closed ──► CloseReporter::register_close(addr, doc)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lock::LockStore;
use crate::matchmaker::{Matchmaker, MatchmakerConfig, MatchmakerError};
use crate::registry::RemoteBackend;
use crate::session::{Connection, SessionConfig};
use crate::storage::DocLog;

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Address clients and other backends reach this process on
    pub external_addr: String,
    /// How long a token from `setup_connection` stays usable
    pub pending_ttl: Duration,
    pub sweep_interval: Duration,
    pub lock_ttl: Duration,
    pub session: SessionConfig,
}

impl BackendConfig {
    pub fn new(external_addr: impl Into<String>) -> Self {
        Self {
            external_addr: external_addr.into(),
            pending_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(5 * 60),
            session: SessionConfig::default(),
        }
    }

    pub fn for_testing(external_addr: impl Into<String>) -> Self {
        Self {
            pending_ttl: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(100),
            lock_ttl: Duration::from_secs(2),
            session: SessionConfig::for_testing(),
            ..Self::new(external_addr)
        }
    }

    fn matchmaker(&self) -> MatchmakerConfig {
        MatchmakerConfig {
            lock_ttl: self.lock_ttl,
            session: self.session.clone(),
            ..MatchmakerConfig::new(self.external_addr.clone())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("unknown, expired or mismatched connection token")]
    InvalidToken,
    #[error("connection token already registered")]
    DuplicateToken,
    #[error(transparent)]
    Matchmaker(#[from] MatchmakerError),
}

/// Told about every document session that closes on a backend.
#[async_trait]
pub trait CloseReporter: Send + Sync {
    async fn register_close(&self, addr: &str, doc_id: Uuid);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub pending_tokens: usize,
    pub sessions: usize,
}

struct Pending {
    doc_id: Uuid,
    expires: Instant,
}

type PendingTokens = Arc<Mutex<HashMap<Uuid, Pending>>>;

#[derive(Clone)]
pub struct Backend {
    config: BackendConfig,
    matchmaker: Matchmaker,
    pending: PendingTokens,
    cancel: CancellationToken,
}

impl Backend {
    pub fn start(
        config: BackendConfig,
        lock_store: Arc<dyn LockStore>,
        doc_log: Arc<dyn DocLog>,
        reporter: Option<Arc<dyn CloseReporter>>,
    ) -> Result<Self, BackendError> {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let matchmaker = Matchmaker::start(config.matchmaker(), lock_store, doc_log, Some(close_tx))?;
        let pending: PendingTokens = Arc::default();
        let cancel = CancellationToken::new();

        tokio::spawn(sweep_loop(
            Arc::clone(&pending),
            config.sweep_interval,
            cancel.clone(),
        ));
        tokio::spawn(forward_closes(config.external_addr.clone(), close_rx, reporter));

        Ok(Backend {
            config,
            matchmaker,
            pending,
            cancel,
        })
    }

    pub fn addr(&self) -> &str {
        &self.config.external_addr
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }

    pub async fn setup_connection(&self, doc_id: Uuid, token: Uuid) -> Result<(), BackendError> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&token) {
            return Err(BackendError::DuplicateToken);
        }
        pending.insert(
            token,
            Pending {
                doc_id,
                expires: Instant::now() + self.config.pending_ttl,
            },
        );
        Ok(())
    }

    /// Consume `token` and join the document's session.
    pub async fn connect(&self, doc_id: Uuid, token: Uuid, client_id: Uuid) -> Result<Connection, BackendError> {
        let entry = self.pending.lock().await.remove(&token);
        match entry {
            Some(p) if p.doc_id == doc_id && p.expires > Instant::now() => {}
            _ => return Err(BackendError::InvalidToken),
        }
        Ok(self.matchmaker.connect(doc_id, client_id).await?)
    }

    /// Drop expired tokens now. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        sweep(&self.pending).await
    }

    pub async fn stats(&self) -> Result<BackendStats, BackendError> {
        let pending_tokens = self.pending.lock().await.len();
        let sessions = self.matchmaker.stats().await?.sessions;
        Ok(BackendStats {
            pending_tokens,
            sessions,
        })
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.matchmaker.shutdown().await;
    }
}

#[async_trait]
impl RemoteBackend for Backend {
    fn addr(&self) -> &str {
        Backend::addr(self)
    }

    async fn setup_connection(&self, doc_id: Uuid, token: Uuid) -> Result<(), BackendError> {
        Backend::setup_connection(self, doc_id, token).await
    }
}

async fn sweep(pending: &PendingTokens) -> usize {
    let now = Instant::now();
    let mut pending = pending.lock().await;
    let before = pending.len();
    pending.retain(|_, p| p.expires > now);
    before - pending.len()
}

async fn sweep_loop(pending: PendingTokens, period: Duration, cancel: CancellationToken) {
    let mut tick = time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let dropped = sweep(&pending).await;
                if dropped > 0 {
                    log::debug!("Swept {dropped} expired connection tokens");
                }
            }
        }
    }
}

async fn forward_closes(
    addr: String,
    mut closes: mpsc::UnboundedReceiver<Uuid>,
    reporter: Option<Arc<dyn CloseReporter>>,
) {
    while let Some(doc_id) = closes.recv().await {
        if let Some(reporter) = &reporter {
            reporter.register_close(&addr, doc_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use crate::storage::MemoryDocLog;

    fn backend(addr: &str) -> Backend {
        Backend::start(
            BackendConfig::for_testing(addr),
            Arc::new(MemoryLockStore::new()),
            Arc::new(MemoryDocLog::new()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let backend = backend("b:1");
        let (doc, token) = (Uuid::new_v4(), Uuid::new_v4());
        backend.setup_connection(doc, token).await.unwrap();
        assert_eq!(
            backend.setup_connection(doc, token).await,
            Err(BackendError::DuplicateToken)
        );

        let conn = backend.connect(doc, token, Uuid::new_v4()).await.unwrap();
        assert_eq!(conn.doc_id(), doc);
        assert!(matches!(
            backend.connect(doc, token, Uuid::new_v4()).await,
            Err(BackendError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_token_bound_to_doc() {
        let backend = backend("b:1");
        let token = Uuid::new_v4();
        backend.setup_connection(Uuid::new_v4(), token).await.unwrap();
        assert!(matches!(
            backend.connect(Uuid::new_v4(), token, Uuid::new_v4()).await,
            Err(BackendError::InvalidToken)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_tokens_are_swept() {
        let backend = backend("b:1");
        let doc = Uuid::new_v4();
        let expired = Uuid::new_v4();
        backend.setup_connection(doc, expired).await.unwrap();
        time::advance(Duration::from_millis(600)).await;
        backend.setup_connection(doc, Uuid::new_v4()).await.unwrap();
        time::advance(Duration::from_millis(600)).await;

        // The background sweeper may already have run.
        backend.sweep().await;
        assert_eq!(backend.stats().await.unwrap().pending_tokens, 1);
        assert!(matches!(
            backend.connect(doc, expired, Uuid::new_v4()).await,
            Err(BackendError::InvalidToken)
        ));
    }
}
