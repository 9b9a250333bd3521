//! RocksDB-backed persistent room store.
//!
//! Column families:
//! - `snapshots`  : full room document state (LZ4 compressed), keyed by world id
//! - `deltas`     : accepted updates (LZ4 compressed), keyed by world_id:version
//! - `metadata`   : per-world bookkeeping (bincode)
//! - `memberships`: world roles, keyed by world_id:user_id
//!
//! A world is recovered by applying its snapshot and then every delta with
//! a version above the snapshot's.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use charge_core::membership::Role;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";
const CF_MEMBERSHIPS: &str = "memberships";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_DELTAS, CF_METADATA, CF_MEMBERSHIPS];

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
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("charge_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Per-world bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldMetadata {
    pub world_id: Uuid,
    /// Version of the newest stored delta
    pub last_version: u64,
    /// Newest delta version folded into the snapshot
    pub snapshot_version: u64,
    /// Deltas currently stored
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl WorldMetadata {
    fn new(world_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            world_id,
            last_version: 0,
            snapshot_version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// No record for this world
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "World not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable storage for room documents and memberships.
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write
    meta_lock: Mutex<()>,
}

impl RoomStore {
    /// Open the store, creating the database and column families if needed.
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
        log::info!("Opened room store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            meta_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS | CF_MEMBERSHIPS => {
                // Prefix-scanned by world id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save the full room state, covering every delta stored so far.
    pub fn save_snapshot(&self, world_id: Uuid, snapshot: &[u8]) -> Result<WorldMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let _guard = self.meta_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self.metadata_or_new(world_id)?;
        meta.snapshot_version = meta.last_version;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, world_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, world_id.as_bytes(), &meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Saved snapshot for world {world_id}: {} -> {} bytes",
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, world_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, world_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(world_id)),
        }
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Append an accepted update. Returns the version assigned to it.
    pub fn append_delta(&self, world_id: Uuid, delta: &[u8]) -> Result<u64, StoreError> {
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = lz4_flex::compress_prepend_size(delta);

        let _guard = self.meta_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self.metadata_or_new(world_id)?;
        meta.last_version += 1;
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, Self::delta_key(world_id, meta.last_version), &compressed);
        batch.put_cf(&cf_meta, world_id.as_bytes(), &meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(meta.last_version)
    }

    /// Deltas with a version of at least `since_version`, in version order.
    pub fn load_deltas_since(
        &self,
        world_id: Uuid,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(world_id, since_version);

        let mut deltas = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let Some(version) = Self::delta_version(world_id, &key) else {
                break;
            };
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            deltas.push((version, decompressed));
        }

        Ok(deltas)
    }

    /// Delete deltas up to and including `up_to_version`.
    pub fn compact_deltas(&self, world_id: Uuid, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let start_key = Self::delta_key(world_id, 0);

        let _guard = self.meta_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match Self::delta_version(world_id, &key) {
                Some(version) if version <= up_to_version => {
                    batch.delete_cf(&cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            let mut meta = self.metadata_or_new(world_id)?;
            meta.delta_count = meta.delta_count.saturating_sub(count);
            batch.put_cf(&cf_meta, world_id.as_bytes(), &meta.encode()?);
            self.db.write(batch)?;
            log::debug!("Compacted {count} delta(s) for world {world_id}");
        }

        Ok(count)
    }

    /// Snapshot plus trailing deltas: everything needed to rebuild a world.
    ///
    /// Returns `None` for a world that was never stored.
    pub fn load_world(&self, world_id: Uuid) -> Result<Option<(Option<Vec<u8>>, Vec<Vec<u8>>)>, StoreError> {
        let Some(meta) = self.load_metadata(world_id)? else {
            return Ok(None);
        };
        let snapshot = match self.load_snapshot(world_id) {
            Ok(snapshot) => Some(snapshot),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let deltas = self
            .load_deltas_since(world_id, meta.snapshot_version + 1)?
            .into_iter()
            .map(|(_, delta)| delta)
            .collect();
        Ok(Some((snapshot, deltas)))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, world_id: Uuid) -> Result<Option<WorldMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, world_id.as_bytes())?
            .map(|bytes| WorldMetadata::decode(&bytes))
            .transpose()
    }

    fn metadata_or_new(&self, world_id: Uuid) -> Result<WorldMetadata, StoreError> {
        Ok(self
            .load_metadata(world_id)?
            .unwrap_or_else(|| WorldMetadata::new(world_id)))
    }

    /// Every world with stored state.
    pub fn list_worlds(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut worlds = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid world key".into()))?;
            worlds.push(Uuid::from_bytes(bytes));
        }
        Ok(worlds)
    }

    // ─── Memberships ──────────────────────────────────────────────────

    pub fn put_membership(&self, world_id: Uuid, user_id: &str, role: Role) -> Result<(), StoreError> {
        let cf = self.cf(CF_MEMBERSHIPS)?;
        self.db.put_cf_opt(
            &cf,
            Self::membership_key(world_id, user_id),
            role.as_str(),
            &self.write_opts(),
        )?;
        Ok(())
    }

    pub fn delete_membership(&self, world_id: Uuid, user_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_MEMBERSHIPS)?;
        self.db.delete_cf_opt(
            &cf,
            Self::membership_key(world_id, user_id),
            &self.write_opts(),
        )?;
        Ok(())
    }

    /// All membership records of one world.
    pub fn load_memberships(&self, world_id: Uuid) -> Result<Vec<(String, Role)>, StoreError> {
        let cf = self.cf(CF_MEMBERSHIPS)?;
        let prefix = world_id.as_bytes();
        let mut members = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            let user_id = String::from_utf8(key[16..].to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            let role = std::str::from_utf8(&value)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?
                .parse::<Role>()
                .map_err(StoreError::DeserializationError)?;
            members.push((user_id, role));
        }
        Ok(members)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// world_id (16 bytes) + version (8 bytes big-endian)
    fn delta_key(world_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(world_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Version of a delta key, `None` once past this world's prefix.
    fn delta_version(world_id: Uuid, key: &[u8]) -> Option<u64> {
        if key.len() != 24 || &key[..16] != world_id.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        Some(u64::from_be_bytes(buf))
    }

    fn membership_key(world_id: Uuid, user_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + user_id.len());
        key.extend_from_slice(world_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RoomStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let world = Uuid::new_v4();
        let data = b"room state room state room state room state".to_vec();

        let meta = store.save_snapshot(world, &data).unwrap();
        assert_eq!(meta.world_id, world);
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert_eq!(store.load_snapshot(world).unwrap(), data);
        assert!(matches!(
            store.load_snapshot(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_delta_versions_are_per_world() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(store.append_delta(a, b"a1").unwrap(), 1);
        assert_eq!(store.append_delta(a, b"a2").unwrap(), 2);
        assert_eq!(store.append_delta(b, b"b1").unwrap(), 1);

        let deltas = store.load_deltas_since(a, 0).unwrap();
        assert_eq!(deltas, vec![(1, b"a1".to_vec()), (2, b"a2".to_vec())]);
        assert_eq!(store.load_deltas_since(b, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_load_world_uses_trailing_deltas() {
        let (_dir, store) = open_temp();
        let world = Uuid::new_v4();
        assert!(store.load_world(world).unwrap().is_none());

        store.append_delta(world, b"d1").unwrap();
        store.save_snapshot(world, b"snap").unwrap();
        store.append_delta(world, b"d2").unwrap();

        let (snapshot, deltas) = store.load_world(world).unwrap().unwrap();
        assert_eq!(snapshot.unwrap(), b"snap".to_vec());
        assert_eq!(deltas, vec![b"d2".to_vec()]);
    }

    #[test]
    fn test_compact_deltas() {
        let (_dir, store) = open_temp();
        let world = Uuid::new_v4();
        for n in 0..5u8 {
            store.append_delta(world, &[n]).unwrap();
        }
        assert_eq!(store.compact_deltas(world, 3).unwrap(), 3);
        let left: Vec<u64> = store
            .load_deltas_since(world, 0)
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(left, vec![4, 5]);
        assert_eq!(store.load_metadata(world).unwrap().unwrap().delta_count, 2);
    }

    #[test]
    fn test_list_worlds() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.save_snapshot(a, b"x").unwrap();
        store.append_delta(b, b"y").unwrap();

        let worlds = store.list_worlds().unwrap();
        assert_eq!(worlds.len(), 2);
        assert!(worlds.contains(&a) && worlds.contains(&b));
    }

    #[test]
    fn test_memberships_roundtrip() {
        let (_dir, store) = open_temp();
        let world = Uuid::new_v4();
        let other = Uuid::new_v4();
        store.put_membership(world, "alice", Role::Owner).unwrap();
        store.put_membership(world, "bob", Role::Player).unwrap();
        store.put_membership(other, "carol", Role::Player).unwrap();

        let mut members = store.load_memberships(world).unwrap();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            members,
            vec![("alice".into(), Role::Owner), ("bob".into(), Role::Player)]
        );

        store.delete_membership(world, "bob").unwrap();
        assert_eq!(store.load_memberships(world).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let world = Uuid::new_v4();
        {
            let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save_snapshot(world, b"persisted").unwrap();
        }
        let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_snapshot(world).unwrap(), b"persisted".to_vec());
        assert!(store.path().exists());
    }
}
