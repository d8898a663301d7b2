//! In-memory doc log for tests and single-process setups.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DocLog, DocLogError, LogEntry};

#[derive(Default)]
struct MemoryDoc {
    head: u64,
    entries: BTreeMap<u64, LogEntry>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<Uuid, MemoryDoc>,
    fail_loads: bool,
    fail_writes: bool,
}

/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryDocLog {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDocLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `load` fail.
    pub async fn set_fail_loads(&self, fail: bool) {
        self.inner.lock().await.fail_loads = fail;
    }

    /// Make every following `push` and `replace` fail.
    pub async fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().await.fail_writes = fail;
    }

    /// Rows stored for `doc_id`, including ones before the head.
    pub async fn row_count(&self, doc_id: Uuid) -> usize {
        self.inner
            .lock()
            .await
            .docs
            .get(&doc_id)
            .map_or(0, |doc| doc.entries.len())
    }

    pub async fn head(&self, doc_id: Uuid) -> u64 {
        self.inner.lock().await.docs.get(&doc_id).map_or(0, |doc| doc.head)
    }
}

#[async_trait]
impl DocLog for MemoryDocLog {
    async fn load(&self, doc_id: Uuid) -> Result<Vec<LogEntry>, DocLogError> {
        let inner = self.inner.lock().await;
        if inner.fail_loads {
            return Err(DocLogError::Unavailable("injected load failure".into()));
        }
        Ok(inner
            .docs
            .get(&doc_id)
            .map(|doc| doc.entries.range(doc.head..).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn push(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_writes {
            return Err(DocLogError::Unavailable("injected write failure".into()));
        }
        inner
            .docs
            .entry(doc_id)
            .or_default()
            .entries
            .insert(entry.generation_start, entry.clone());
        Ok(())
    }

    async fn replace(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_writes {
            return Err(DocLogError::Unavailable("injected write failure".into()));
        }
        let doc = inner.docs.entry(doc_id).or_default();
        doc.head = entry.generation_start;
        doc.entries = doc.entries.split_off(&entry.generation_start);
        doc.entries.insert(entry.generation_start, entry.clone());
        Ok(())
    }
}
