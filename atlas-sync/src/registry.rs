//! Backend registry: decides which backend serves a document and hands out
//! connection tokens for it.
//!
//! ```text
//!  setup_connection(doc)
//!     │ doc already mapped? ──yes──► that backend
//!     │                      └─no──► random registered backend
//!     ▼
//!  backend.setup_connection(doc, token) ──► ConnectionTicket { backend, token }
//! ```
//!
//! The mapping is advisory. If two backends end up with tokens for the same
//! document, the lock in the matchmaker sends the loser's clients to the
//! winner.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{BackendError, CloseReporter};

/// What the registry needs from a backend.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    fn addr(&self) -> &str;

    async fn setup_connection(&self, doc_id: Uuid, token: Uuid) -> Result<(), BackendError>;
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no backends registered")]
    NoBackends,
    #[error("backend {backend} refused connection setup: {source}")]
    Setup {
        backend: String,
        #[source]
        source: BackendError,
    },
}

/// Where to connect, and the one-shot token to present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTicket {
    pub backend: String,
    pub token: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sorted
    pub backends: Vec<String>,
    pub open_docs: usize,
}

#[derive(Default)]
struct State {
    backends: BTreeMap<String, Arc<dyn RemoteBackend>>,
    docs: BTreeMap<Uuid, String>,
}

/// Clones share state.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<State>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a backend with the same address is already known.
    pub async fn register_backend(&self, backend: Arc<dyn RemoteBackend>) -> bool {
        let mut state = self.state.lock().await;
        let addr = backend.addr().to_string();
        if state.backends.contains_key(&addr) {
            return false;
        }
        log::info!("Registered backend {addr}");
        state.backends.insert(addr, backend);
        true
    }

    pub async fn unregister_backend(&self, addr: &str) -> bool {
        let mut state = self.state.lock().await;
        state.docs.retain(|_, backend| backend.as_str() != addr);
        let known = state.backends.remove(addr).is_some();
        if known {
            log::info!("Unregistered backend {addr}");
        }
        known
    }

    pub async fn setup_connection(&self, doc_id: Uuid) -> Result<ConnectionTicket, RegistryError> {
        let (backend, mapped) = {
            let state = self.state.lock().await;
            match state.docs.get(&doc_id).and_then(|addr| state.backends.get(addr)) {
                Some(backend) => (Arc::clone(backend), true),
                None => {
                    let backend = state
                        .backends
                        .values()
                        .choose(&mut rand::thread_rng())
                        .ok_or(RegistryError::NoBackends)?;
                    (Arc::clone(backend), false)
                }
            }
        };

        let addr = backend.addr().to_string();
        let token = Uuid::new_v4();
        if let Err(source) = backend.setup_connection(doc_id, token).await {
            if mapped {
                log::warn!("Backend {addr} failed setup for {doc_id}, forgetting mapping");
                let mut state = self.state.lock().await;
                if state.docs.get(&doc_id) == Some(&addr) {
                    state.docs.remove(&doc_id);
                }
            }
            return Err(RegistryError::Setup {
                backend: addr,
                source,
            });
        }

        self.state.lock().await.docs.entry(doc_id).or_insert_with(|| addr.clone());
        Ok(ConnectionTicket {
            backend: addr,
            token,
        })
    }

    /// Forget that `addr` serves `doc_id`.
    pub async fn register_close(&self, addr: &str, doc_id: Uuid) {
        let mut state = self.state.lock().await;
        if state.docs.get(&doc_id).is_some_and(|mapped| mapped == addr) {
            state.docs.remove(&doc_id);
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.lock().await;
        RegistryStats {
            backends: state.backends.keys().cloned().collect(),
            open_docs: state.docs.len(),
        }
    }

    /// Sorted, human-readable dump of backends and their documents.
    pub async fn debug_state(&self) -> String {
        let state = self.state.lock().await;
        let mut out = String::new();
        for addr in state.backends.keys() {
            let _ = writeln!(out, "backend {addr}");
            for (doc_id, _) in state.docs.iter().filter(|(_, a)| *a == addr) {
                let _ = writeln!(out, "  doc {doc_id}");
            }
        }
        for (doc_id, addr) in &state.docs {
            if !state.backends.contains_key(addr) {
                let _ = writeln!(out, "stale doc {doc_id} -> {addr}");
            }
        }
        out
    }
}

#[async_trait]
impl CloseReporter for Registry {
    async fn register_close(&self, addr: &str, doc_id: Uuid) {
        Registry::register_close(self, addr, doc_id).await;
    }
}
