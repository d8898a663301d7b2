//! RocksDB-backed doc log.
//!
//! Column families:
//! - `entries`: log rows, keyed by `<doc_id:16 bytes><start:8 bytes BE>`
//! - `heads`: oldest live start generation per document, keyed by doc id
//!
//! Row value: bincode envelope `{start, end, payload}` where `payload` is the
//! changeset JSON, LZ4 compressed with the size prepended.
//!
//! RocksDB calls block, so every operation runs on `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use atlas_core::Changeset;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DocLog, DocLogError, LogEntry};

const CF_ENTRIES: &str = "entries";
const CF_HEADS: &str = "heads";

const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_HEADS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, a save is only acknowledged once durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
    /// Largest serialized changeset accepted in one row (default: 64MB)
    pub max_entry_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atlas_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
            max_entry_bytes: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            max_entry_bytes: 16 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for DocLogError {
    fn from(e: rocksdb::Error) -> Self {
        DocLogError::Database(e.to_string())
    }
}

/// On-disk row.
#[derive(Debug, Serialize, Deserialize)]
struct EntryEnvelope {
    start: u64,
    end: u64,
    payload: Vec<u8>,
}

impl EntryEnvelope {
    fn seal(entry: &LogEntry, max_entry_bytes: usize) -> Result<Vec<u8>, DocLogError> {
        let json = entry
            .changeset
            .to_json_bounded(max_entry_bytes)
            .map_err(|e| DocLogError::Serialization(e.to_string()))?;
        let envelope = EntryEnvelope {
            start: entry.generation_start,
            end: entry.generation_end,
            payload: lz4_flex::compress_prepend_size(&json),
        };
        bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
            .map_err(|e| DocLogError::Serialization(e.to_string()))
    }

    fn open(bytes: &[u8]) -> Result<LogEntry, DocLogError> {
        let (envelope, _): (EntryEnvelope, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| DocLogError::Serialization(e.to_string()))?;
        let json = lz4_flex::decompress_size_prepended(&envelope.payload)
            .map_err(|e| DocLogError::Compression(e.to_string()))?;
        let changeset: Changeset =
            serde_json::from_slice(&json).map_err(|e| DocLogError::Serialization(e.to_string()))?;
        Ok(LogEntry {
            generation_start: envelope.start,
            generation_end: envelope.end,
            changeset,
        })
    }
}

struct Inner {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// RocksDB doc log. Cheap to clone.
#[derive(Clone)]
pub struct RocksDocLog {
    inner: Arc<Inner>,
}

impl RocksDocLog {
    /// Open the log at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, DocLogError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("opened doc log at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(Inner { db, config }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T, DocLogError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, DocLogError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| DocLogError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn cf_options(name: &str, config: &StoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    block_opts.set_block_size(16 * 1024);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_write_buffer_size(config.write_buffer_size);

    match name {
        CF_ENTRIES => {
            // Payloads are already LZ4 compressed.
            opts.set_compression_type(DBCompressionType::None);
            opts.set_max_write_buffer_number(4);
            opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
        }
        CF_HEADS => {
            opts.set_compression_type(DBCompressionType::Lz4);
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        _ => {}
    }

    opts
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, DocLogError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DocLogError::Database(format!("column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn head(&self, doc_id: Uuid) -> Result<u64, DocLogError> {
        let cf = self.cf(CF_HEADS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn load(&self, doc_id: Uuid) -> Result<Vec<LogEntry>, DocLogError> {
        let cf = self.cf(CF_ENTRIES)?;
        let start_key = entry_key(doc_id, self.head(doc_id)?);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            entries.push(EntryEnvelope::open(&value)?);
        }
        Ok(entries)
    }

    fn push(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError> {
        let cf = self.cf(CF_ENTRIES)?;
        let value = EntryEnvelope::seal(entry, self.config.max_entry_bytes)?;
        self.db.put_cf_opt(
            cf,
            entry_key(doc_id, entry.generation_start),
            value,
            &self.write_opts(),
        )?;
        Ok(())
    }

    fn replace(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_heads = self.cf(CF_HEADS)?;
        let value = EntryEnvelope::seal(entry, self.config.max_entry_bytes)?;

        // Head, cleanup and the new row land together.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_heads, doc_id.as_bytes(), entry.generation_start.to_be_bytes());
        batch.delete_range_cf(
            cf_entries,
            entry_key(doc_id, 0),
            entry_key(doc_id, entry.generation_start),
        );
        batch.put_cf(cf_entries, entry_key(doc_id, entry.generation_start), value);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

#[async_trait]
impl DocLog for RocksDocLog {
    async fn load(&self, doc_id: Uuid) -> Result<Vec<LogEntry>, DocLogError> {
        self.run(move |inner| inner.load(doc_id)).await
    }

    async fn push(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError> {
        let entry = entry.clone();
        self.run(move |inner| inner.push(doc_id, &entry)).await
    }

    async fn replace(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), DocLogError> {
        let entry = entry.clone();
        self.run(move |inner| inner.replace(doc_id, &entry)).await
    }
}

/// Entry key: doc_id (16 bytes) + start generation (8 bytes big-endian).
fn entry_key(doc_id: Uuid, start: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&start.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64, DocLogError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DocLogError::Serialization(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{Feature, Layer};
    use tempfile::tempdir;

    fn entry(start: u64, end: u64, id: &str) -> LogEntry {
        let mut changeset = Changeset::new();
        changeset
            .add_feature(Feature::child(id, "", "O").with_name(format!("feature {id}")))
            .set_layer(Layer::new("base").with_opacity(0.8));
        LogEntry {
            generation_start: start,
            generation_end: end,
            changeset,
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let original = entry(7, 9, "f1");
        let bytes = EntryEnvelope::seal(&original, 1 << 20).unwrap();
        assert_eq!(EntryEnvelope::open(&bytes).unwrap(), original);
    }

    #[test]
    fn test_envelope_size_limit() {
        let result = EntryEnvelope::seal(&entry(1, 1, "f1"), 8);
        assert!(matches!(result, Err(DocLogError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_store_open_push_load() {
        let dir = tempdir().unwrap();
        let log = RocksDocLog::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(log.path().exists());

        let doc = Uuid::new_v4();
        let other = Uuid::new_v4();
        log.push(doc, &entry(1, 3, "a")).await.unwrap();
        log.push(doc, &entry(4, 4, "b")).await.unwrap();
        log.push(other, &entry(1, 1, "x")).await.unwrap();

        let loaded = log.load(doc).await.unwrap();
        assert_eq!(loaded, vec![entry(1, 3, "a"), entry(4, 4, "b")]);
        assert_eq!(log.load(other).await.unwrap().len(), 1);
        assert!(log.load(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_drops_older_rows() {
        let dir = tempdir().unwrap();
        let log = RocksDocLog::open(StoreConfig::for_testing(dir.path())).unwrap();

        let doc = Uuid::new_v4();
        for g in 1..=5 {
            log.push(doc, &entry(g, g, "a")).await.unwrap();
        }
        log.replace(doc, &entry(6, 6, "snapshot")).await.unwrap();
        log.push(doc, &entry(7, 8, "later")).await.unwrap();

        let loaded = log.load(doc).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].generation_start, 6);
        assert_eq!(loaded[1].generation_end, 8);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let doc = Uuid::new_v4();
        {
            let log = RocksDocLog::open(StoreConfig::for_testing(&path)).unwrap();
            log.push(doc, &entry(1, 1, "a")).await.unwrap();
            log.replace(doc, &entry(2, 2, "b")).await.unwrap();
        }
        let log = RocksDocLog::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(log.load(doc).await.unwrap(), vec![entry(2, 2, "b")]);
    }
}
