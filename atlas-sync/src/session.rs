//! Per-document session actor.
//!
//! ```text
//!  Connection ──► ┌───────────── mailbox ─────────────┐
//!  Connection ──► │ Connect / Incoming / Disconnect / │
//!  SessionHandle ►│ Stats                             │
//!                 └────────────────┬──────────────────┘
//!                                  ▼
//!                       ┌─────────────────────┐  save tick   ┌────────┐
//!                       │ SessionActor        │─────────────►│ DocLog │
//!                       │   DocStore          │◄──save done──│ (task) │
//!                       │   clients, unsent   │              └────────┘
//!                       └──────────┬──────────┘
//!                     broadcast tick (only when dirty)
//!                                  ▼
//!                  bounded outgoing mailbox per client (try_send)
//! ```
//!
//! The actor task is the only writer of the document. Clients that cannot
//! keep up are dropped instead of slowing everyone else down. A failed save
//! is fatal: clients are told, disconnected, and the session ends `Failed`
//! without a final save. So does [`SessionHandle::abandon`], used once the
//! document's lock is gone and another process may already be writing.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use atlas_core::{Aware, Changeset, DocError, DocStore};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{ErrorKind, IncomingMessage, OutgoingMessage};
use crate::storage::{load_store, plan_save, DocLog, DocLogError};
use crate::traffic::TrafficLog;

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close after this long without connections
    pub idle_timeout: Duration,
    pub save_interval: Duration,
    pub broadcast_interval: Duration,
    /// Log entries allowed before the next save becomes a full snapshot
    pub compaction_threshold: usize,
    /// Queued messages per client before the client is dropped
    pub outgoing_capacity: usize,
    pub mailbox_capacity: usize,
    /// Bound on `connect`, `send` and `stats`
    pub request_timeout: Duration,
    pub traffic_log_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
            save_interval: Duration::from_secs(60),
            broadcast_interval: Duration::from_millis(10),
            compaction_threshold: 50,
            outgoing_capacity: 8,
            mailbox_capacity: 64,
            request_timeout: Duration::from_secs(1),
            traffic_log_dir: None,
        }
    }
}

impl SessionConfig {
    /// Short timers so tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            idle_timeout: Duration::from_millis(500),
            save_interval: Duration::from_millis(50),
            broadcast_interval: Duration::from_millis(5),
            compaction_threshold: 4,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Loading,
    Ready,
    Failed,
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::Closed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session did not answer in time")]
    Timeout,
    #[error("session closed")]
    Closed,
    #[error("session failed")]
    Failed,
    #[error("client {0} is already connected")]
    DuplicateClient(Uuid),
    #[error("failed to load document: {0}")]
    Load(String),
}

impl SessionError {
    /// Whether the same request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Timeout | SessionError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub status: SessionStatus,
    pub connections: usize,
    pub generation: u64,
}

enum Command {
    Connect {
        client_id: Uuid,
        reply: oneshot::Sender<Result<Connection, SessionError>>,
    },
    Incoming {
        client_id: Uuid,
        msg: IncomingMessage,
    },
    Disconnect {
        client_id: Uuid,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

// ─── Handles ────────────────────────────────────────────────────

/// Cheap to clone. All clones talk to the same actor.
#[derive(Clone)]
pub struct SessionHandle {
    doc_id: Uuid,
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    abandon: CancellationToken,
    request_timeout: Duration,
}

impl SessionHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Resolves once the session has reached `Failed` or `Closed`.
    pub async fn closed(&self) -> SessionStatus {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        // Sender gone means the actor task ended.
        reached.unwrap_or_else(|_| self.status())
    }

    /// Stop without writing anything more to the doc log. An in-flight save
    /// is aborted and the session ends `Failed`.
    pub fn abandon(&self) {
        self.abandon.cancel();
    }

    pub async fn connect(&self, client_id: Uuid) -> Result<Connection, SessionError> {
        self.request(|reply| Command::Connect { client_id, reply }).await?
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(command(reply))
                .await
                .map_err(|_| terminal_error(&self.status))?;
            let value = rx.await.map_err(|_| terminal_error(&self.status))?;
            Ok::<T, SessionError>(value)
        };
        time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| SessionError::Timeout)?
    }
}

fn terminal_error(status: &watch::Receiver<SessionStatus>) -> SessionError {
    match *status.borrow() {
        SessionStatus::Failed => SessionError::Failed,
        _ => SessionError::Closed,
    }
}

/// One client's link to a session.
///
/// Outgoing messages arrive on [`Connection::recv`]. It returns `None` once
/// the session dropped this client or shut down.
#[derive(Debug)]
pub struct Connection {
    client_id: Uuid,
    doc_id: Uuid,
    tx: mpsc::Sender<Command>,
    outgoing: mpsc::Receiver<OutgoingMessage>,
    request_timeout: Duration,
}

impl Connection {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub async fn send(&self, msg: IncomingMessage) -> Result<(), SessionError> {
        let command = Command::Incoming {
            client_id: self.client_id,
            msg,
        };
        time::timeout(self.request_timeout, self.tx.send(command))
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|_| SessionError::Closed)
    }

    pub async fn recv(&mut self) -> Option<OutgoingMessage> {
        self.outgoing.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutgoingMessage> {
        self.outgoing.try_recv().ok()
    }

    pub async fn disconnect(self) {
        let command = Command::Disconnect {
            client_id: self.client_id,
        };
        // Best effort; a closed session has already forgotten us.
        let _ = time::timeout(self.request_timeout, self.tx.send(command)).await;
    }
}

// ─── Actor ──────────────────────────────────────────────────────

struct Client {
    outgoing: mpsc::Sender<OutgoingMessage>,
    /// Messages with a seq at or below this are stale
    last_seq: i32,
    aware: Aware,
}

struct SaveDone {
    generation_end: u64,
    entry_count: usize,
    result: Result<(), DocLogError>,
}

enum Exit {
    Closed,
    Failed,
    Abandoned,
}

/// The actor state. Only reachable through [`SessionHandle`].
pub struct Session {
    doc_id: Uuid,
    config: SessionConfig,
    doc_log: Arc<dyn DocLog>,
    store: DocStore,
    last_save_g: u64,
    entry_count: usize,
    clients: HashMap<Uuid, Client>,
    /// Changes accepted since the last broadcast
    unsent: Changeset,
    dirty: bool,
    save_task: Option<JoinHandle<()>>,
    idle_deadline: Option<Instant>,
    self_tx: mpsc::Sender<Command>,
    status_tx: watch::Sender<SessionStatus>,
    abandon: CancellationToken,
    traffic: Option<TrafficLog>,
}

impl Session {
    /// Start the actor for `doc_id`. The document is loaded in the
    /// background; commands sent meanwhile queue up in the mailbox.
    ///
    /// `doc_id` is sent on `closed_tx` once the actor has finished, whatever
    /// the reason.
    pub fn spawn(
        doc_id: Uuid,
        config: SessionConfig,
        doc_log: Arc<dyn DocLog>,
        cancel: CancellationToken,
        closed_tx: mpsc::UnboundedSender<Uuid>,
    ) -> SessionHandle {
        let (tx, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
        let (status_tx, status) = watch::channel(SessionStatus::Loading);
        let abandon = CancellationToken::new();
        let handle = SessionHandle {
            doc_id,
            tx: tx.clone(),
            status,
            abandon: abandon.clone(),
            request_timeout: config.request_timeout,
        };

        let session = Session {
            doc_id,
            config,
            doc_log,
            store: DocStore::new(),
            last_save_g: 0,
            entry_count: 0,
            clients: HashMap::new(),
            unsent: Changeset::new(),
            dirty: false,
            save_task: None,
            idle_deadline: None,
            self_tx: tx,
            status_tx,
            abandon,
            traffic: None,
        };
        tokio::spawn(session.run(mailbox, cancel, closed_tx));
        handle
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Command>,
        cancel: CancellationToken,
        closed_tx: mpsc::UnboundedSender<Uuid>,
    ) {
        let doc_id = self.doc_id;
        if let Some(dir) = self.config.traffic_log_dir.clone() {
            self.traffic = TrafficLog::open(&dir, doc_id)
                .await
                .map_err(|e| log::warn!("Traffic log for {doc_id} not opened: {e}"))
                .ok();
        }
        if let Err(e) = self.load().await {
            log::error!("Session {doc_id} failed to load: {e}");
            self.status_tx.send_replace(SessionStatus::Failed);
            mailbox.close();
            while let Some(command) = mailbox.recv().await {
                if let Command::Connect { reply, .. } = command {
                    let _ = reply.send(Err(e.clone()));
                }
            }
            let _ = closed_tx.send(doc_id);
            return;
        }
        self.status_tx.send_replace(SessionStatus::Ready);
        self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        log::info!(
            "Session {doc_id} ready at generation {} ({} log entries)",
            self.store.generation(),
            self.entry_count
        );

        let (save_tx, mut save_rx) = mpsc::channel::<SaveDone>(1);
        let mut broadcast_tick = ticker(self.config.broadcast_interval);
        let mut save_tick = ticker(self.config.save_interval);
        let abandon = self.abandon.clone();

        let exit = loop {
            let idle = self.idle_deadline;
            tokio::select! {
                biased;
                _ = abandon.cancelled() => {
                    log::warn!("Session {doc_id} abandoned, skipping further saves");
                    break Exit::Abandoned;
                }
                _ = cancel.cancelled() => {
                    log::info!("Session {doc_id} cancelled");
                    break Exit::Closed;
                }
                _ = wait_until(idle) => {
                    log::info!("Session {doc_id} idle, closing");
                    break Exit::Closed;
                }
                command = mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break Exit::Closed,
                },
                _ = broadcast_tick.tick() => self.broadcast(),
                _ = save_tick.tick() => self.start_save(&save_tx),
                Some(done) = save_rx.recv() => {
                    if let Err(e) = self.finish_save(done) {
                        self.fail(&e);
                        break Exit::Failed;
                    }
                }
            }
        };

        self.shutdown(exit, &mut mailbox, &mut save_rx).await;
        let _ = closed_tx.send(doc_id);
    }

    async fn load(&mut self) -> Result<(), SessionError> {
        let entries = self
            .doc_log
            .load(self.doc_id)
            .await
            .map_err(|e| SessionError::Load(e.to_string()))?;
        let loaded = load_store(&entries).map_err(|e| SessionError::Load(e.to_string()))?;
        self.store = loaded.store;
        self.last_save_g = loaded.last_save_g;
        self.entry_count = loaded.entry_count;
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { client_id, reply } => self.connect(client_id, reply),
            Command::Incoming { client_id, msg } => self.incoming(client_id, msg),
            Command::Disconnect { client_id } => {
                if self.clients.contains_key(&client_id) {
                    self.remove_client(client_id, "disconnected");
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    status: *self.status_tx.borrow(),
                    connections: self.clients.len(),
                    generation: self.store.generation(),
                });
            }
        }
    }

    fn connect(&mut self, client_id: Uuid, reply: oneshot::Sender<Result<Connection, SessionError>>) {
        if self.clients.contains_key(&client_id) {
            let _ = reply.send(Err(SessionError::DuplicateClient(client_id)));
            return;
        }

        let (outgoing, rx) = mpsc::channel(self.config.outgoing_capacity.max(1));
        self.clients.insert(
            client_id,
            Client {
                outgoing: outgoing.clone(),
                last_seq: 0,
                aware: Aware::for_client(client_id),
            },
        );

        let (_, snapshot) = self.store.changes_after(0);
        let welcome = OutgoingMessage::welcome(self.aware_map(), snapshot);
        if let Some(traffic) = self.traffic.as_mut() {
            traffic.reply(client_id, &welcome);
        }
        // The channel is fresh, so the welcome always fits.
        let _ = outgoing.try_send(welcome);

        let connection = Connection {
            client_id,
            doc_id: self.doc_id,
            tx: self.self_tx.clone(),
            outgoing: rx,
            request_timeout: self.config.request_timeout,
        };
        if reply.send(Ok(connection)).is_err() {
            // The caller gave up waiting.
            self.remove_client(client_id, "connect abandoned");
            return;
        }

        self.idle_deadline = None;
        self.dirty = true;
        log::info!(
            "Client {client_id} joined {} ({} connected)",
            self.doc_id,
            self.clients.len()
        );
    }

    fn incoming(&mut self, client_id: Uuid, msg: IncomingMessage) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if msg.seq <= client.last_seq {
            log::debug!("Ignoring stale seq {} from {client_id}", msg.seq);
            return;
        }
        if let Some(traffic) = self.traffic.as_mut() {
            traffic.incoming(client_id, &msg);
        }

        client.last_seq = msg.seq;
        client.aware.update_from(msg.aware);
        self.dirty = true;

        let Some(change) = msg.change else {
            return;
        };
        match self.store.update(&change) {
            Ok(outcome) => {
                self.unsent.merge(&change);
                if let Some(fixes) = outcome.fixes {
                    self.unsent.merge(&fixes);
                    self.reply(client_id, OutgoingMessage::fixes(fixes));
                }
            }
            Err(DocError::BadUpdate(reason)) => {
                log::warn!("Rejected update from {client_id} on {}: {reason}", self.doc_id);
                self.reply(client_id, OutgoingMessage::error(ErrorKind::BadUpdate(reason)));
            }
        }
    }

    fn reply(&mut self, client_id: Uuid, msg: OutgoingMessage) {
        if let Some(traffic) = self.traffic.as_mut() {
            traffic.reply(client_id, &msg);
        }
        let delivered = self
            .clients
            .get(&client_id)
            .is_some_and(|client| client.outgoing.try_send(msg).is_ok());
        if !delivered {
            self.remove_client(client_id, "outgoing mailbox full or closed");
        }
    }

    fn broadcast(&mut self) {
        if let Some(traffic) = self.traffic.as_mut() {
            traffic.flush();
        }
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let change = (!self.unsent.is_empty()).then(|| std::mem::take(&mut self.unsent));
        let acks = self
            .clients
            .iter()
            .filter(|(_, client)| client.last_seq > 0)
            .map(|(id, client)| (*id, client.last_seq))
            .collect();
        let msg = OutgoingMessage::broadcast(acks, self.aware_map(), change);
        if let Some(traffic) = self.traffic.as_mut() {
            traffic.broadcast(&msg);
        }

        let lagging: Vec<Uuid> = self
            .clients
            .iter()
            .filter(|(_, client)| client.outgoing.try_send(msg.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for client_id in lagging {
            self.remove_client(client_id, "outgoing mailbox full or closed");
        }
    }

    fn aware_map(&self) -> BTreeMap<Uuid, Aware> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.aware.clone()))
            .collect()
    }

    fn remove_client(&mut self, client_id: Uuid, reason: &str) {
        if self.clients.remove(&client_id).is_none() {
            return;
        }
        log::info!(
            "Client {client_id} left {} ({reason}, {} connected)",
            self.doc_id,
            self.clients.len()
        );
        // Peers need the updated aware map.
        self.dirty = true;
        if self.clients.is_empty() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }
    }

    // ─── Persistence ────────────────────────────────────────────

    fn start_save(&mut self, save_tx: &mpsc::Sender<SaveDone>) {
        if self.save_task.is_some() {
            return;
        }
        let Some(plan) = plan_save(
            &self.store,
            self.last_save_g,
            self.entry_count,
            self.config.compaction_threshold,
        ) else {
            return;
        };

        let doc_id = self.doc_id;
        let doc_log = Arc::clone(&self.doc_log);
        let entry_count = plan.entry_count_after(self.entry_count);
        let save_tx = save_tx.clone();
        self.save_task = Some(tokio::spawn(async move {
            let result = plan.write(doc_log.as_ref(), doc_id).await;
            let _ = save_tx
                .send(SaveDone {
                    generation_end: plan.entry.generation_end,
                    entry_count,
                    result,
                })
                .await;
        }));
    }

    fn finish_save(&mut self, done: SaveDone) -> Result<(), DocLogError> {
        self.save_task = None;
        done.result?;
        log::debug!(
            "Saved {} through generation {}",
            self.doc_id,
            done.generation_end
        );
        self.last_save_g = done.generation_end;
        self.entry_count = done.entry_count;
        Ok(())
    }

    fn fail(&mut self, error: &DocLogError) {
        log::error!("Session {} failed to save: {error}", self.doc_id);
        let msg = OutgoingMessage::error(ErrorKind::PersistenceFailure(error.to_string()));
        for (_, client) in self.clients.drain() {
            let _ = client.outgoing.try_send(msg.clone());
        }
        self.status_tx.send_replace(SessionStatus::Failed);
    }

    async fn shutdown(
        mut self,
        exit: Exit,
        mailbox: &mut mpsc::Receiver<Command>,
        save_rx: &mut mpsc::Receiver<SaveDone>,
    ) {
        let doc_id = self.doc_id;
        let mut abandoned = matches!(exit, Exit::Abandoned) || self.abandon.is_cancelled();
        let mut failed = matches!(exit, Exit::Failed) || abandoned;
        let abandon = self.abandon.clone();

        let closing = OutgoingMessage::error(ErrorKind::SessionClosed);
        for (_, client) in self.clients.drain() {
            let _ = client.outgoing.try_send(closing.clone());
        }

        mailbox.close();
        while let Ok(command) = mailbox.try_recv() {
            if let Command::Connect { reply, .. } = command {
                let error = if failed { SessionError::Failed } else { SessionError::Closed };
                let _ = reply.send(Err(error));
            }
        }

        if let Some(task) = self.save_task.take() {
            if abandoned {
                task.abort();
            } else {
                tokio::select! {
                    biased;
                    _ = abandon.cancelled() => task.abort(),
                    done = save_rx.recv() => {
                        if let Some(done) = done {
                            if let Err(e) = self.finish_save(done) {
                                log::error!("Session {doc_id} in-flight save failed: {e}");
                                failed = true;
                            }
                        }
                    }
                }
            }
        }

        if abandon.is_cancelled() {
            abandoned = true;
            failed = true;
        }
        if !failed {
            if let Some(plan) = plan_save(
                &self.store,
                self.last_save_g,
                self.entry_count,
                self.config.compaction_threshold,
            ) {
                match plan.write(self.doc_log.as_ref(), doc_id).await {
                    Ok(()) => log::info!(
                        "Session {doc_id} final save through generation {}",
                        plan.entry.generation_end
                    ),
                    Err(e) => {
                        log::error!("Session {doc_id} final save failed: {e}");
                        failed = true;
                    }
                }
            }
        }

        if let Some(traffic) = self.traffic.take() {
            traffic.close().await;
        }
        if abandoned {
            log::warn!("Session {doc_id} dropped changes after generation {}", self.last_save_g);
        }
        let status = if failed { SessionStatus::Failed } else { SessionStatus::Closed };
        self.status_tx.send_replace(status);
        log::info!("Session {doc_id} ended {status:?}");
    }
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
