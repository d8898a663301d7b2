//! Rebuilding a document from its log and deciding how to save it.

use atlas_core::{DocError, DocStore};
use uuid::Uuid;

use super::{DocLog, DocLogError, LogEntry};

/// A document rebuilt from its log.
#[derive(Debug)]
pub struct LoadedDoc {
    pub store: DocStore,
    /// End generation of the last persisted entry.
    pub last_save_g: u64,
    pub entry_count: usize,
}

/// Replay `entries` into a fresh store.
///
/// Each entry is applied as one generation, then the generation is fast
/// forwarded to the entry's end so later saves continue the same range.
pub fn load_store(entries: &[LogEntry]) -> Result<LoadedDoc, DocError> {
    let mut store = DocStore::new();
    let mut last_save_g = 0;
    for entry in entries {
        store.fast_forward(entry.generation_start.saturating_sub(1));
        let outcome = store.update(&entry.changeset)?;
        if outcome.fixes.is_some() {
            log::warn!(
                "log entry [{}, {}] needed repairs on replay",
                entry.generation_start,
                entry.generation_end
            );
        }
        store.fast_forward(entry.generation_end);
        last_save_g = entry.generation_end;
    }
    Ok(LoadedDoc {
        store,
        last_save_g,
        entry_count: entries.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Push,
    /// Full snapshot that supersedes every earlier entry.
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSave {
    pub kind: SaveKind,
    pub entry: LogEntry,
}

impl PlannedSave {
    pub async fn write(&self, log: &dyn DocLog, doc_id: Uuid) -> Result<(), DocLogError> {
        match self.kind {
            SaveKind::Push => log.push(doc_id, &self.entry).await,
            SaveKind::Replace => log.replace(doc_id, &self.entry).await,
        }
    }

    /// Entry count of the log after this save.
    pub fn entry_count_after(&self, entry_count: usize) -> usize {
        match self.kind {
            SaveKind::Push => entry_count + 1,
            SaveKind::Replace => 1,
        }
    }
}

/// The entry to write for everything after `last_save_g`, or `None` when
/// nothing changed. Once the log holds more than `compaction_threshold`
/// entries the entry is a full snapshot written with `replace`.
pub fn plan_save(
    store: &DocStore,
    last_save_g: u64,
    entry_count: usize,
    compaction_threshold: usize,
) -> Option<PlannedSave> {
    let (generation, changes) = store.changes_after(last_save_g);
    let changes = changes?;

    let (kind, changeset) = if entry_count > compaction_threshold {
        let (_, snapshot) = store.changes_after(0);
        (SaveKind::Replace, snapshot.unwrap_or_default())
    } else {
        (SaveKind::Push, changes)
    };

    Some(PlannedSave {
        kind,
        entry: LogEntry {
            generation_start: last_save_g + 1,
            generation_end: generation,
            changeset,
        },
    })
}
