//! Per-process matchmaker: at most one live session per document across the
//! fleet.
//!
//! ```text
//!  connect(doc, client)
//!         │
//!         ▼
//!  ┌─────────────┐  local session?  ──yes──► session.connect (spawned)
//!  │ Matchmaker  │
//!  │   actor     │──no──► try_acquire(matchmaker-lock:doc)   (spawned)
//!  └──────┬──────┘            │ Acquired ──► Session::spawn ──► connect
//!         │                   │ HeldBy(v) ─► ShouldTrySpecific { addr(v) }
//!         │                   └ error ─────► LockStore (retry)
//!         │
//!         ├── every ttl/4: refresh(held keys) ── lost keys ──► abandon session
//!         └── session closed ──► release(key) unless the lock was lost
//! ```
//!
//! Lock acquisition, refresh and release run in spawned tasks and report
//! back on an internal channel, so a slow lock store never stalls routing.
//! Connects that arrive while a document's lock is being acquired or
//! released wait for that call to land.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lock::{holder_addr, lock_key, lock_value, LockError, LockMismatch, LockStatus, LockStore};
use crate::session::{Connection, Session, SessionConfig, SessionError, SessionHandle};
use crate::storage::DocLog;

#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    /// Address other backends redirect clients to
    pub addr: String,
    /// Distinguishes this process from an earlier one on the same address
    pub run_id: Uuid,
    pub lock_ttl: Duration,
    /// Bound on a whole `connect`, including lock acquisition and load
    pub connect_timeout: Duration,
    pub session: SessionConfig,
}

impl MatchmakerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            run_id: Uuid::new_v4(),
            lock_ttl: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(5),
            session: SessionConfig::default(),
        }
    }

    pub fn for_testing(addr: impl Into<String>) -> Self {
        Self {
            lock_ttl: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            session: SessionConfig::for_testing(),
            ..Self::new(addr)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchmakerError {
    /// The document lives on another backend. Not a failure.
    #[error("document is served by {addr}")]
    ShouldTrySpecific { addr: String },
    #[error("lock store: {0}")]
    LockStore(#[from] LockError),
    #[error("matchmaker did not answer in time")]
    Timeout,
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("matchmaker is shutting down")]
    ShuttingDown,
    #[error("invalid matchmaker config: {0}")]
    InvalidConfig(String),
}

impl MatchmakerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            MatchmakerError::LockStore(_) | MatchmakerError::Timeout => true,
            MatchmakerError::Session(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchmakerStats {
    pub sessions: usize,
    /// Sorted
    pub docs: Vec<Uuid>,
}

type ConnectReply = oneshot::Sender<Result<Connection, MatchmakerError>>;

enum Command {
    Connect {
        doc_id: Uuid,
        client_id: Uuid,
        reply: ConnectReply,
    },
    Healthz {
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<MatchmakerStats>,
    },
}

/// Completions of spawned lock-store calls.
enum Event {
    Acquired {
        doc_id: Uuid,
        result: Result<LockStatus, LockError>,
    },
    Refreshed {
        keys: Vec<String>,
        result: Result<Vec<LockMismatch>, LockError>,
    },
    Released {
        doc_id: Uuid,
        result: Result<Vec<LockMismatch>, LockError>,
    },
}

/// Handle to the matchmaker actor. Clones share the actor.
#[derive(Clone)]
pub struct Matchmaker {
    addr: String,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    connect_timeout: Duration,
}

impl Matchmaker {
    /// Start the actor. Every closed document id is also sent to
    /// `close_listener`, if given.
    pub fn start(
        config: MatchmakerConfig,
        lock_store: Arc<dyn LockStore>,
        doc_log: Arc<dyn DocLog>,
        close_listener: Option<mpsc::UnboundedSender<Uuid>>,
    ) -> Result<Self, MatchmakerError> {
        if config.addr.is_empty() {
            return Err(MatchmakerError::InvalidConfig("addr must not be empty".into()));
        }
        if config.lock_ttl < Duration::from_millis(4) {
            return Err(MatchmakerError::InvalidConfig("lock_ttl is too short".into()));
        }

        let (tx, mailbox) = mpsc::channel(64);
        let (done_tx, done) = watch::channel(false);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let matchmaker = Matchmaker {
            addr: config.addr.clone(),
            tx,
            cancel: cancel.clone(),
            done,
            connect_timeout: config.connect_timeout,
        };

        log::info!("Matchmaker starting on {} (run {})", config.addr, config.run_id);
        let actor = MatchmakerActor {
            lock_value: lock_value(&config.addr, config.run_id),
            config,
            lock_store,
            doc_log,
            sessions: HashMap::new(),
            acquiring: HashMap::new(),
            releasing: HashMap::new(),
            refresh_in_flight: false,
            closed_tx,
            close_listener,
            events_tx,
            cancel,
        };
        tokio::spawn(async move {
            actor.run(mailbox, closed_rx, events_rx).await;
            let _ = done_tx.send(true);
        });
        Ok(matchmaker)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn connect(&self, doc_id: Uuid, client_id: Uuid) -> Result<Connection, MatchmakerError> {
        self.request(|reply| Command::Connect {
            doc_id,
            client_id,
            reply,
        })
        .await?
    }

    pub async fn healthz(&self) -> bool {
        self.request(|reply| Command::Healthz { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn stats(&self) -> Result<MatchmakerStats, MatchmakerError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Cancel every session, wait for them to close and release their locks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.done.borrow()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MatchmakerError> {
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(command(reply))
                .await
                .map_err(|_| MatchmakerError::ShuttingDown)?;
            let value = rx.await.map_err(|_| MatchmakerError::ShuttingDown)?;
            Ok::<T, MatchmakerError>(value)
        };
        time::timeout(self.connect_timeout, exchange)
            .await
            .map_err(|_| MatchmakerError::Timeout)?
    }
}

// ─── Actor ──────────────────────────────────────────────────────

struct LocalSession {
    handle: SessionHandle,
    key: String,
    /// Set once refresh found the key gone. The session is abandoned and the
    /// lock never released.
    lock_lost: bool,
}

struct MatchmakerActor {
    config: MatchmakerConfig,
    lock_value: String,
    lock_store: Arc<dyn LockStore>,
    doc_log: Arc<dyn DocLog>,
    sessions: HashMap<Uuid, LocalSession>,
    /// Connects waiting on an in-flight `try_acquire`
    acquiring: HashMap<Uuid, Vec<(Uuid, ConnectReply)>>,
    /// Connects waiting on an in-flight `release`
    releasing: HashMap<Uuid, Vec<(Uuid, ConnectReply)>>,
    refresh_in_flight: bool,
    closed_tx: mpsc::UnboundedSender<Uuid>,
    close_listener: Option<mpsc::UnboundedSender<Uuid>>,
    events_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl MatchmakerActor {
    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Command>,
        mut closed_rx: mpsc::UnboundedReceiver<Uuid>,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        let cancel = self.cancel.clone();
        let period = self.config.lock_ttl / 4;
        let mut refresh_tick = time::interval_at(Instant::now() + period, period);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(doc_id) = closed_rx.recv() => self.session_closed(doc_id),
                Some(event) = events_rx.recv() => self.handle_event(event),
                _ = refresh_tick.tick() => self.start_refresh(),
            }
        }

        self.shutdown(&mut mailbox, &mut closed_rx, &mut events_rx).await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                doc_id,
                client_id,
                reply,
            } => self.connect(doc_id, client_id, reply),
            Command::Healthz { reply } => {
                let _ = reply.send(true);
            }
            Command::Stats { reply } => {
                let mut docs: Vec<Uuid> = self.sessions.keys().copied().collect();
                docs.sort();
                let _ = reply.send(MatchmakerStats {
                    sessions: docs.len(),
                    docs,
                });
            }
        }
    }

    fn connect(&mut self, doc_id: Uuid, client_id: Uuid, reply: ConnectReply) {
        if let Some(local) = self.sessions.get(&doc_id) {
            route(local.handle.clone(), client_id, reply);
            return;
        }
        if let Some(waiting) = self
            .acquiring
            .get_mut(&doc_id)
            .or_else(|| self.releasing.get_mut(&doc_id))
        {
            waiting.push((client_id, reply));
            return;
        }
        self.start_acquire(doc_id, vec![(client_id, reply)]);
    }

    fn start_acquire(&mut self, doc_id: Uuid, waiting: Vec<(Uuid, ConnectReply)>) {
        self.acquiring.insert(doc_id, waiting);
        let lock_store = Arc::clone(&self.lock_store);
        let key = lock_key(doc_id);
        let value = self.lock_value.clone();
        let ttl = self.config.lock_ttl;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = lock_store.try_acquire(&key, &value, ttl).await;
            let _ = events.send(Event::Acquired { doc_id, result });
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Acquired { doc_id, result } => self.acquired(doc_id, result),
            Event::Refreshed { keys, result } => self.refreshed(keys, result),
            Event::Released { doc_id, result } => {
                log_release(doc_id, &result);
                let waiting = self.releasing.remove(&doc_id).unwrap_or_default();
                if !waiting.is_empty() {
                    self.start_acquire(doc_id, waiting);
                }
            }
        }
    }

    fn acquired(&mut self, doc_id: Uuid, result: Result<LockStatus, LockError>) {
        let waiting = self.acquiring.remove(&doc_id).unwrap_or_default();
        match result {
            Ok(LockStatus::Acquired) => {
                let handle = Session::spawn(
                    doc_id,
                    self.config.session.clone(),
                    Arc::clone(&self.doc_log),
                    self.cancel.child_token(),
                    self.closed_tx.clone(),
                );
                log::info!("Acquired {doc_id}, session started");
                for (client_id, reply) in waiting {
                    route(handle.clone(), client_id, reply);
                }
                self.sessions.insert(
                    doc_id,
                    LocalSession {
                        handle,
                        key: lock_key(doc_id),
                        lock_lost: false,
                    },
                );
            }
            Ok(LockStatus::HeldBy(value)) => {
                let error = match holder_addr(&value) {
                    Ok(addr) => MatchmakerError::ShouldTrySpecific {
                        addr: addr.to_string(),
                    },
                    Err(e) => MatchmakerError::LockStore(e),
                };
                log::debug!("{doc_id} is held by {value}");
                for (_, reply) in waiting {
                    let _ = reply.send(Err(error.clone()));
                }
            }
            Err(e) => {
                log::warn!("Lock acquisition for {doc_id} failed: {e}");
                for (_, reply) in waiting {
                    let _ = reply.send(Err(MatchmakerError::LockStore(e.clone())));
                }
            }
        }
    }

    fn start_refresh(&mut self) {
        if self.refresh_in_flight {
            return;
        }
        let keys: Vec<String> = self
            .sessions
            .values()
            .filter(|local| !local.lock_lost)
            .map(|local| local.key.clone())
            .collect();
        if keys.is_empty() {
            return;
        }

        self.refresh_in_flight = true;
        let lock_store = Arc::clone(&self.lock_store);
        let value = self.lock_value.clone();
        let ttl = self.config.lock_ttl;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = lock_store.refresh(&keys, &value, ttl).await;
            let _ = events.send(Event::Refreshed { keys, result });
        });
    }

    fn refreshed(&mut self, keys: Vec<String>, result: Result<Vec<LockMismatch>, LockError>) {
        self.refresh_in_flight = false;
        let lost: Vec<String> = match result {
            Ok(mismatches) => mismatches.into_iter().map(|m| m.key).collect(),
            Err(e) => {
                log::error!("Lock refresh failed, dropping {} sessions: {e}", keys.len());
                keys
            }
        };
        for local in self.sessions.values_mut() {
            if lost.contains(&local.key) && !local.lock_lost {
                log::warn!("Lost lock {}, abandoning session", local.key);
                local.lock_lost = true;
                local.handle.abandon();
            }
        }
    }

    fn session_closed(&mut self, doc_id: Uuid) {
        let Some(local) = self.sessions.remove(&doc_id) else {
            return;
        };
        log::info!("Session {doc_id} closed ({:?})", local.handle.status());
        if let Some(listener) = &self.close_listener {
            let _ = listener.send(doc_id);
        }
        if local.lock_lost {
            return;
        }
        // Connects for this doc queue until the release lands.
        self.releasing.insert(doc_id, Vec::new());
        let lock_store = Arc::clone(&self.lock_store);
        let value = self.lock_value.clone();
        let ttl = self.config.lock_ttl;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            // Past the TTL the lock has expired anyway.
            let result = time::timeout(ttl, lock_store.release(&[local.key], &value))
                .await
                .unwrap_or_else(|_| Err(LockError::Unavailable("release timed out".into())));
            let _ = events.send(Event::Released { doc_id, result });
        });
    }

    async fn shutdown(
        mut self,
        mailbox: &mut mpsc::Receiver<Command>,
        closed_rx: &mut mpsc::UnboundedReceiver<Uuid>,
        events_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) {
        log::info!("Matchmaker shutting down, {} sessions open", self.sessions.len());
        self.cancel.cancel();
        mailbox.close();

        let mut to_release: Vec<String> = Vec::new();
        let mut open: HashSet<Uuid> = self
            .sessions
            .drain()
            .map(|(doc_id, local)| {
                if !local.lock_lost {
                    to_release.push(local.key);
                }
                doc_id
            })
            .collect();

        while !open.is_empty() || !self.acquiring.is_empty() || !self.releasing.is_empty() {
            tokio::select! {
                Some(doc_id) = closed_rx.recv() => {
                    open.remove(&doc_id);
                    if let Some(listener) = &self.close_listener {
                        let _ = listener.send(doc_id);
                    }
                }
                Some(event) = events_rx.recv() => match event {
                    Event::Acquired { doc_id, result } => {
                        if matches!(result, Ok(LockStatus::Acquired)) {
                            to_release.push(lock_key(doc_id));
                        }
                        for (_, reply) in self.acquiring.remove(&doc_id).unwrap_or_default() {
                            let _ = reply.send(Err(MatchmakerError::ShuttingDown));
                        }
                    }
                    Event::Refreshed { .. } => {}
                    Event::Released { doc_id, result } => {
                        log_release(doc_id, &result);
                        for (_, reply) in self.releasing.remove(&doc_id).unwrap_or_default() {
                            let _ = reply.send(Err(MatchmakerError::ShuttingDown));
                        }
                    }
                },
                Some(command) = mailbox.recv() => {
                    if let Command::Connect { reply, .. } = command {
                        let _ = reply.send(Err(MatchmakerError::ShuttingDown));
                    }
                }
                else => break,
            }
        }

        if !to_release.is_empty() {
            match self.lock_store.release(&to_release, &self.lock_value).await {
                Ok(lost) => log::info!(
                    "Released {} locks ({} no longer ours)",
                    to_release.len() - lost.len(),
                    lost.len()
                ),
                Err(e) => log::error!("Releasing locks on shutdown failed: {e}"),
            }
        }
        log::info!("Matchmaker on {} stopped", self.config.addr);
    }
}

fn log_release(doc_id: Uuid, result: &Result<Vec<LockMismatch>, LockError>) {
    match result {
        Ok(lost) if !lost.is_empty() => log::warn!("Lock for {doc_id} was no longer ours"),
        Ok(_) => log::debug!("Released lock for {doc_id}"),
        Err(e) => log::warn!("Releasing lock for {doc_id} failed: {e}"),
    }
}

/// Hand a connect to a session without blocking the actor.
fn route(handle: SessionHandle, client_id: Uuid, reply: ConnectReply) {
    tokio::spawn(async move {
        let result = handle.connect(client_id).await.map_err(MatchmakerError::from);
        if let Err(Ok(connection)) = reply.send(result) {
            // The caller is gone; free the slot.
            connection.disconnect().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;
    use crate::storage::MemoryDocLog;

    fn start(addr: &str, locks: &MemoryLockStore, log: &MemoryDocLog) -> Matchmaker {
        Matchmaker::start(
            MatchmakerConfig::for_testing(addr),
            Arc::new(locks.clone()),
            Arc::new(log.clone()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_addr_rejected() {
        let result = Matchmaker::start(
            MatchmakerConfig::new(""),
            Arc::new(MemoryLockStore::new()),
            Arc::new(MemoryDocLog::new()),
            None,
        );
        assert!(matches!(result, Err(MatchmakerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_spawns_one_session() {
        let locks = MemoryLockStore::new();
        let mm = start("a:1", &locks, &MemoryDocLog::new());
        let doc = Uuid::new_v4();

        let _c1 = mm.connect(doc, Uuid::new_v4()).await.unwrap();
        let _c2 = mm.connect(doc, Uuid::new_v4()).await.unwrap();
        let stats = mm.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.docs, vec![doc]);
        assert!(mm.healthz().await);
        assert!(locks.get(&lock_key(doc)).await.unwrap().starts_with("a:1:"));
    }

    #[tokio::test]
    async fn test_redirects_to_holder() {
        let locks = MemoryLockStore::new();
        let log = MemoryDocLog::new();
        let first = start("10.0.0.1:9000", &locks, &log);
        let second = start("10.0.0.2:9000", &locks, &log);
        let doc = Uuid::new_v4();

        let _conn = first.connect(doc, Uuid::new_v4()).await.unwrap();
        let err = second.connect(doc, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(
            err,
            MatchmakerError::ShouldTrySpecific {
                addr: "10.0.0.1:9000".into()
            }
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_lock_store_down_is_retryable() {
        let locks = MemoryLockStore::new();
        locks.set_unavailable(true).await;
        let mm = start("a:1", &locks, &MemoryDocLog::new());
        let err = mm.connect(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MatchmakerError::LockStore(_)));
        assert!(err.is_retryable());
    }

    /// Holds every `release` until the gate opens.
    struct GatedRelease {
        inner: MemoryLockStore,
        gate: watch::Receiver<bool>,
    }

    #[async_trait::async_trait]
    impl LockStore for GatedRelease {
        async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<LockStatus, LockError> {
            self.inner.try_acquire(key, value, ttl).await
        }

        async fn refresh(&self, keys: &[String], value: &str, ttl: Duration) -> Result<Vec<LockMismatch>, LockError> {
            self.inner.refresh(keys, value, ttl).await
        }

        async fn release(&self, keys: &[String], value: &str) -> Result<Vec<LockMismatch>, LockError> {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
            self.inner.release(keys, value).await
        }
    }

    #[tokio::test]
    async fn test_slow_release_does_not_stall_routing() {
        let locks = MemoryLockStore::new();
        let (open_gate, gate) = watch::channel(false);
        let store = GatedRelease {
            inner: locks.clone(),
            gate,
        };
        let mut config = MatchmakerConfig::for_testing("a:1");
        config.lock_ttl = Duration::from_secs(30);
        config.session.idle_timeout = Duration::from_millis(100);
        let mm = Matchmaker::start(config, Arc::new(store), Arc::new(MemoryDocLog::new()), None).unwrap();
        let doc = Uuid::new_v4();

        let conn = mm.connect(doc, Uuid::new_v4()).await.unwrap();
        conn.disconnect().await;
        time::sleep(Duration::from_millis(300)).await;

        // The release is stuck, everything else still answers.
        assert!(mm.healthz().await);
        assert_eq!(mm.stats().await.unwrap().sessions, 0);
        assert!(mm.connect(Uuid::new_v4(), Uuid::new_v4()).await.is_ok());
        assert!(locks.get(&lock_key(doc)).await.is_some());

        // A connect for the releasing doc waits for the release, then acquires.
        let waiting = tokio::spawn({
            let mm = mm.clone();
            async move { mm.connect(doc, Uuid::new_v4()).await }
        });
        time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        open_gate.send_replace(true);
        assert!(waiting.await.unwrap().is_ok());
        assert_eq!(mm.stats().await.unwrap().docs.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_connects() {
        let mm = start("a:1", &MemoryLockStore::new(), &MemoryDocLog::new());
        mm.shutdown().await;
        assert!(mm.is_shut_down());
        assert_eq!(
            mm.connect(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err(),
            MatchmakerError::ShuttingDown
        );
    }
}
