//! RocksDB-backed durable storage for scope replicas.
//!
//! Column families:
//! - `snapshots` — full document state per scope (LZ4 compressed)
//! - `updates`   — incremental v1 updates (LZ4 compressed, keyed by
//!                 scope_key:version)
//! - `meta`      — per-scope bookkeeping (bincode: version, counts,
//!                 timestamps)
//!
//! Scopes are addressed by a 16-byte key derived from the scope name
//! (UUIDv5 over the OID namespace), which keeps the fixed-prefix scan
//! scheme of the update column family independent of scope-name length.
//!
//! One [`UpdateStore`] serves every persistent scope in the process;
//! the database holds an exclusive file lock, so the application opens
//! it once and shares it via `Arc`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::container::Replica;
use crate::scope::{Inbound, ORIGIN_HYDRATE};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_META];

/// Updates accumulated before the next snapshot compaction.
pub const SNAPSHOT_INTERVAL: u64 = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lofi_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-provided temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-scope bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Derived 16-byte scope key
    pub scope_key: Uuid,
    /// Highest update version written
    pub version: u64,
    /// Updates currently held in the update CF
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl ScopeRecord {
    fn new(scope_key: Uuid) -> Self {
        let now = unix_now();
        Self {
            scope_key,
            version: 0,
            update_count: 0,
            snapshot_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("scope not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed update store shared by all persistent scopes.
pub struct UpdateStore {
    /// Single-threaded mode; concurrency is marshalled through tokio
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl UpdateStore {
    /// Open the store at the configured path, creating database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Large values, rewritten only at compaction
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small writes, prefix-scanned by scope key
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Derive the fixed-width storage key for a scope name.
    pub fn scope_key(scope: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, scope.as_bytes())
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append one incremental update for a scope. Returns the version
    /// assigned to it.
    pub fn append_update(&self, scope: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let scope_key = Self::scope_key(scope);

        let mut record = self
            .load_record_by_key(scope_key)?
            .unwrap_or_else(|| ScopeRecord::new(scope_key));
        record.version += 1;
        record.update_count += 1;
        record.updated_at = unix_now();
        let version = record.version;

        let compressed = lz4_flex::compress_prepend_size(update);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, Self::update_key(scope_key, version), &compressed);
        batch.put_cf(&cf_meta, scope_key.as_bytes(), &record.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(version)
    }

    /// Load all updates for a scope with version greater than `since`,
    /// in version order, decompressed.
    pub fn load_updates_since(
        &self,
        scope: &str,
        since: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let scope_key = Self::scope_key(scope);
        let start_key = Self::update_key(scope_key, since + 1);

        let mut updates = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != scope_key.as_bytes() {
                break;
            }
            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            let version = u64::from_be_bytes(ver_buf);

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((version, decompressed));
        }

        Ok(updates)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full-state snapshot for a scope and drop the updates it
    /// subsumes. One atomic batch.
    pub fn save_snapshot(&self, scope: &str, snapshot: &[u8]) -> Result<ScopeRecord, StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let scope_key = Self::scope_key(scope);

        let mut record = self
            .load_record_by_key(scope_key)?
            .unwrap_or_else(|| ScopeRecord::new(scope_key));
        let up_to_version = record.version;
        record.snapshot_size = snapshot.len() as u64;
        record.update_count = 0;
        record.updated_at = unix_now();

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snaps, scope_key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, scope_key.as_bytes(), &record.encode()?);

        // Subsumed updates go in the same batch.
        let start_key = Self::update_key(scope_key, 0);
        let iter = self.db.iterator_cf(
            &cf_updates,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != scope_key.as_bytes() {
                break;
            }
            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            if u64::from_be_bytes(ver_buf) > up_to_version {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(record)
    }

    /// Load a scope's snapshot, decompressed. `None` for scopes never
    /// snapshotted.
    pub fn load_snapshot(&self, scope: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let scope_key = Self::scope_key(scope);

        match self.db.get_cf(&cf, scope_key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Everything needed to rebuild a scope: the snapshot (if any)
    /// followed by every update written after it.
    pub fn load_scope(&self, scope: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut parts = Vec::new();
        if let Some(snapshot) = self.load_snapshot(scope)? {
            parts.push(snapshot);
        }
        for (_, update) in self.load_updates_since(scope, 0)? {
            parts.push(update);
        }
        Ok(parts)
    }

    // ─── Bookkeeping ──────────────────────────────────────────────────

    /// Bookkeeping record for a scope.
    pub fn record(&self, scope: &str) -> Result<ScopeRecord, StoreError> {
        self.load_record_by_key(Self::scope_key(scope))?
            .ok_or_else(|| StoreError::NotFound(scope.to_string()))
    }

    /// Whether the store has ever written anything for this scope.
    pub fn has_scope(&self, scope: &str) -> Result<bool, StoreError> {
        Ok(self.load_record_by_key(Self::scope_key(scope))?.is_some())
    }

    /// Number of loose updates pending the next snapshot.
    pub fn update_count(&self, scope: &str) -> Result<u64, StoreError> {
        Ok(self
            .load_record_by_key(Self::scope_key(scope))?
            .map(|r| r.update_count)
            .unwrap_or(0))
    }

    /// Delete a scope's snapshot, updates, and bookkeeping.
    pub fn delete_scope(&self, scope: &str) -> Result<(), StoreError> {
        let cf_snaps = self.cf(CF_SNAPSHOTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let scope_key = Self::scope_key(scope);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snaps, scope_key.as_bytes());
        batch.delete_cf(&cf_meta, scope_key.as_bytes());

        let start_key = Self::update_key(scope_key, 0);
        let iter = self.db.iterator_cf(
            &cf_updates,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != scope_key.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn load_record_by_key(&self, scope_key: Uuid) -> Result<Option<ScopeRecord>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, scope_key.as_bytes())? {
            Some(bytes) => Ok(Some(ScopeRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Update key: scope_key (16 bytes) + version (8 bytes big-endian).
    fn update_key(scope_key: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(scope_key.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

// ─── Persistence Binding ──────────────────────────────────────────────

/// Connects one replica to the shared store.
///
/// Subscribes to the document's update stream and ships every locally
/// or remotely produced update to a writer task; hydration replays are
/// tagged with [`ORIGIN_HYDRATE`] and skipped, since they re-enter the
/// document from the store itself. Every [`SNAPSHOT_INTERVAL`] updates
/// the writer folds the update log into a fresh snapshot.
///
/// Store failures are reported through the scope's inbound channel and
/// never interrupt editing.
pub struct PersistenceBinding {
    _sub: yrs::Subscription,
}

impl PersistenceBinding {
    pub(crate) fn attach(
        replica: &Replica,
        store: Arc<UpdateStore>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Self, StoreError> {
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let sub = replica
            .doc()
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&yrs::Origin::from(ORIGIN_HYDRATE)) {
                    return;
                }
                // Writer task gone means the scope is tearing down.
                let _ = update_tx.send(event.update.clone());
            })
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let scope = replica.scope().to_string();
        let snapshot_source = replica.clone();
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                let writer = store.clone();
                let scope_name = scope.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let version = writer.append_update(&scope_name, &update)?;
                    let pending = writer.update_count(&scope_name)?;
                    Ok::<(u64, u64), StoreError>((version, pending))
                })
                .await;

                match result {
                    Ok(Ok((version, pending))) => {
                        log::trace!("scope '{scope}' persisted update v{version}");
                        if pending >= SNAPSHOT_INTERVAL {
                            let snapshot = snapshot_source.encode_state();
                            let store = store.clone();
                            let scope_name = scope.clone();
                            let folded = tokio::task::spawn_blocking(move || {
                                store.save_snapshot(&scope_name, &snapshot)
                            })
                            .await;
                            match folded {
                                Ok(Ok(record)) => log::debug!(
                                    "scope '{scope}' compacted into {} byte snapshot",
                                    record.snapshot_size
                                ),
                                Ok(Err(e)) => {
                                    log::warn!("scope '{scope}' snapshot failed: {e}");
                                    let _ = inbound.send(Inbound::StoreFailed(e));
                                }
                                Err(e) => log::warn!("snapshot task panicked: {e}"),
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        log::warn!("scope '{scope}' persist failed: {e}");
                        let _ = inbound.send(Inbound::StoreFailed(e));
                    }
                    Err(e) => log::warn!("persist task panicked: {e}"),
                }
            }
            log::debug!("persistence writer for '{scope}' stopped");
        });

        Ok(Self { _sub: sub })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (UpdateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = UpdateStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    #[test]
    fn scope_key_is_stable() {
        assert_eq!(
            UpdateStore::scope_key("shared-network"),
            UpdateStore::scope_key("shared-network")
        );
        assert_ne!(
            UpdateStore::scope_key("shared-network"),
            UpdateStore::scope_key("internal-private")
        );
    }

    #[test]
    fn append_assigns_monotonic_versions() {
        let (store, _dir) = test_store();
        assert_eq!(store.append_update("s", b"a").unwrap(), 1);
        assert_eq!(store.append_update("s", b"b").unwrap(), 2);
        assert_eq!(store.append_update("s", b"c").unwrap(), 3);
    }

    #[test]
    fn load_updates_since_filters_and_orders() {
        let (store, _dir) = test_store();
        for i in 1u8..=10 {
            store.append_update("s", &[i]).unwrap();
        }

        let all = store.load_updates_since("s", 0).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], (1, vec![1]));
        assert_eq!(all[9], (10, vec![10]));

        let tail = store.load_updates_since("s", 7).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].0, 8);
    }

    #[test]
    fn snapshot_subsumes_updates() {
        let (store, _dir) = test_store();
        for i in 1u8..=5 {
            store.append_update("s", &[i]).unwrap();
        }

        store.save_snapshot("s", b"full state").unwrap();
        assert_eq!(store.update_count("s").unwrap(), 0);
        assert!(store.load_updates_since("s", 0).unwrap().is_empty());
        assert_eq!(store.load_snapshot("s").unwrap().unwrap(), b"full state");

        // Post-snapshot updates accumulate again from the next version.
        let v = store.append_update("s", &[6]).unwrap();
        assert_eq!(v, 6);
        assert_eq!(store.update_count("s").unwrap(), 1);
    }

    #[test]
    fn load_scope_returns_snapshot_then_updates() {
        let (store, _dir) = test_store();
        store.append_update("s", b"pre").unwrap();
        store.save_snapshot("s", b"snap").unwrap();
        store.append_update("s", b"post1").unwrap();
        store.append_update("s", b"post2").unwrap();

        let parts = store.load_scope("s").unwrap();
        assert_eq!(parts, vec![b"snap".to_vec(), b"post1".to_vec(), b"post2".to_vec()]);
    }

    #[test]
    fn unknown_scope_is_empty_not_error() {
        let (store, _dir) = test_store();
        assert!(!store.has_scope("never-written").unwrap());
        assert!(store.load_snapshot("never-written").unwrap().is_none());
        assert!(store.load_scope("never-written").unwrap().is_empty());
        assert_eq!(store.update_count("never-written").unwrap(), 0);
        assert!(store.record("never-written").is_err());
    }

    #[test]
    fn scopes_are_isolated() {
        let (store, _dir) = test_store();
        store.append_update("a", b"from-a").unwrap();
        store.append_update("b", b"from-b").unwrap();
        store.append_update("a", b"more-a").unwrap();

        let a = store.load_updates_since("a", 0).unwrap();
        let b = store.load_updates_since("b", 0).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].1, b"from-b");
    }

    #[test]
    fn delete_scope_removes_everything() {
        let (store, _dir) = test_store();
        store.append_update("s", b"u").unwrap();
        store.save_snapshot("s", b"snap").unwrap();
        store.append_update("s", b"u2").unwrap();

        store.delete_scope("s").unwrap();
        assert!(!store.has_scope("s").unwrap());
        assert!(store.load_scope("s").unwrap().is_empty());
    }

    #[test]
    fn record_tracks_counts() {
        let (store, _dir) = test_store();
        store.append_update("s", b"u1").unwrap();
        store.append_update("s", b"u2").unwrap();

        let record = store.record("s").unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.update_count, 2);
        assert!(record.created_at > 0);
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        {
            let store = UpdateStore::open(config.clone()).unwrap();
            store.append_update("s", b"survives").unwrap();
        }
        let store = UpdateStore::open(config).unwrap();
        let updates = store.load_updates_since("s", 0).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1, b"survives");
        // Versions continue, not restart.
        assert_eq!(store.append_update("s", b"next").unwrap(), 2);
    }

    #[test]
    fn large_snapshot_roundtrip() {
        let (store, _dir) = test_store();
        let data = vec![42u8; 1_000_000];
        let record = store.save_snapshot("s", &data).unwrap();
        assert_eq!(record.snapshot_size, 1_000_000);
        assert_eq!(store.load_snapshot("s").unwrap().unwrap(), data);
    }
}
