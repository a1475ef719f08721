//! RocksDB-backed update log.
//!
//! Column families:
//! - `updates`: one entry per update record, keyed `<room_key> 0x00 <seq:u64 BE>`,
//!   value is a bincode [`StoredRecord`] with the LZ4-compressed update
//! - `meta`: store-wide counters (`next_sequence`)
//!
//! Room keys never contain NUL (see [`RoomKey::derive`]), so the `0x00`
//! separator makes each room a contiguous, prefix-scannable key range, ordered
//! by append sequence. Sequence numbers are global and allocated under a lock
//! held across the write, so a record's sequence order is its commit order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::room::RoomKey;

const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_META];

const NEXT_SEQUENCE_KEY: &[u8] = b"next_sequence";

/// Separates the room key from the sequence number in update keys.
const KEY_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided (usually temporary) directory.
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

/// One persisted update, as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Global append sequence; orders records within a room.
    pub sequence: u64,
    pub room_key: String,
    /// Decompressed update bytes.
    pub update: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Milliseconds since the Unix epoch at append time.
    pub timestamp: u64,
}

/// On-disk value layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    update: Vec<u8>,
    metadata: Vec<u8>,
    timestamp: u64,
}

impl StoredRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Append-only update log for every room.
pub struct UpdateLogStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sequence number; held for the whole write that consumes it.
    next_sequence: Mutex<u64>,
}

impl UpdateLogStore {
    /// Open the store at the configured path, creating it if missing.
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

        let next_sequence = Self::recover_sequence(&db)?;
        log::debug!(
            "Opened update log at {} (next sequence {next_sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_sequence: Mutex::new(next_sequence),
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
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Values are LZ4-compressed already.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{CF_META}' not found")))?;

        match db.get_cf(cf, NEXT_SEQUENCE_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    // ─── Appends ──────────────────────────────────────────────────────

    /// Append one record for `room`. Returns its sequence number.
    pub fn append(&self, room: &RoomKey, update: &[u8], metadata: &[u8]) -> Result<u64, StoreError> {
        self.insert_batch(room, &[(update, metadata)])
            .map(|range| range.start)
    }

    /// Append several records for `room` in one atomic write, in slice order.
    ///
    /// Returns the range of sequence numbers assigned.
    pub fn insert_batch(
        &self,
        room: &RoomKey,
        records: &[(&[u8], &[u8])],
    ) -> Result<std::ops::Range<u64>, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let timestamp = now_millis();

        let mut next = self.lock_sequence();
        let first = *next;

        let mut batch = WriteBatch::default();
        for (offset, (update, metadata)) in records.iter().enumerate() {
            let key = record_key(room, first + offset as u64)?;
            batch.put_cf(cf_updates, key, encode_value(update, metadata, timestamp)?);
        }
        let end = first + records.len() as u64;
        batch.put_cf(cf_meta, NEXT_SEQUENCE_KEY, end.to_be_bytes());

        self.write(batch)?;
        *next = end;

        Ok(first..end)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// All records for `room`, in append order.
    pub fn read_all(&self, room: &RoomKey) -> Result<Vec<UpdateRecord>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = room_prefix(room)?;

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sequence = decode_u64(&key[prefix.len()..])?;
            let stored = StoredRecord::decode(&value)?;
            let update = lz4_flex::decompress_size_prepended(&stored.update)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;

            records.push(UpdateRecord {
                sequence,
                room_key: room.as_str().to_string(),
                update,
                metadata: stored.metadata,
                timestamp: stored.timestamp,
            });
        }

        Ok(records)
    }

    /// Timestamp of the most recently appended record for `room`.
    pub fn newest_timestamp(&self, room: &RoomKey) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = room_prefix(room)?;
        let upper = record_key(room, u64::MAX)?;

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                Ok(Some(StoredRecord::decode(&value)?.timestamp))
            }
            None => Ok(None),
        }
    }

    /// Number of records stored for `room`.
    pub fn record_count(&self, room: &RoomKey) -> Result<usize, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = room_prefix(room)?;

        let mut count = 0;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Every distinct room key with at least one record, in key order.
    pub fn room_keys(&self) -> Result<Vec<RoomKey>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let mut rooms = Vec::new();
        let mut seek: Vec<u8> = Vec::new();

        loop {
            let next = self
                .db
                .iterator_cf(cf, IteratorMode::From(&seek, Direction::Forward))
                .next();
            let Some(item) = next else { break };
            let (key, _) = item?;

            let split = key
                .iter()
                .position(|b| *b == KEY_SEPARATOR)
                .ok_or_else(|| StoreError::InvalidKey(String::from_utf8_lossy(&key).into_owned()))?;
            let name = std::str::from_utf8(&key[..split])
                .map_err(|e| StoreError::InvalidKey(e.to_string()))?;
            match RoomKey::from_stored(name) {
                Some(room) => rooms.push(room),
                None => log::warn!("Skipping records under unexpected room key {name:?}"),
            }

            // Jump past this room: `<room> 0x01` sorts after every `<room> 0x00 <seq>`.
            seek = key[..split].to_vec();
            seek.push(KEY_SEPARATOR + 1);
        }

        Ok(rooms)
    }

    // ─── Replacement ──────────────────────────────────────────────────

    /// Atomically replace the records `folded` of `room` with `snapshot`.
    ///
    /// The snapshot takes the highest folded sequence number, so records
    /// appended after the fold was read (higher sequences) stay after it.
    /// Returns `false` when `folded` is empty.
    pub fn replace_all(
        &self,
        room: &RoomKey,
        folded: &[u64],
        snapshot: &[u8],
    ) -> Result<bool, StoreError> {
        let Some(&last) = folded.iter().max() else {
            return Ok(false);
        };
        let cf = self.cf(CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        for &sequence in folded {
            batch.delete_cf(cf, record_key(room, sequence)?);
        }
        batch.put_cf(
            cf,
            record_key(room, last)?,
            encode_value(snapshot, &[], now_millis())?,
        );

        self.write(batch)?;
        Ok(true)
    }

    /// Delete every record of `room`. Returns how many were removed.
    pub fn delete_room(&self, room: &RoomKey) -> Result<usize, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = room_prefix(room)?;

        let mut batch = WriteBatch::default();
        let mut count = 0;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.write(batch)?;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock_sequence(&self) -> MutexGuard<'_, u64> {
        self.next_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on one room's slice of the log.
#[derive(Clone)]
pub struct RoomLog {
    store: Arc<UpdateLogStore>,
    room: RoomKey,
}

impl RoomLog {
    pub fn new(store: Arc<UpdateLogStore>, room: RoomKey) -> Self {
        Self { store, room }
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn append(&self, update: &[u8], metadata: &[u8]) -> Result<u64, StoreError> {
        self.store.append(&self.room, update, metadata)
    }

    pub fn read_all(&self) -> Result<Vec<UpdateRecord>, StoreError> {
        self.store.read_all(&self.room)
    }

    pub fn newest_timestamp(&self) -> Result<Option<u64>, StoreError> {
        self.store.newest_timestamp(&self.room)
    }
}

fn room_prefix(room: &RoomKey) -> Result<Vec<u8>, StoreError> {
    if room.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(room.to_string()));
    }
    let mut prefix = Vec::with_capacity(room.as_bytes().len() + 1);
    prefix.extend_from_slice(room.as_bytes());
    prefix.push(KEY_SEPARATOR);
    Ok(prefix)
}

fn record_key(room: &RoomKey, sequence: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = room_prefix(room)?;
    key.extend_from_slice(&sequence.to_be_bytes());
    Ok(key)
}

fn encode_value(update: &[u8], metadata: &[u8], timestamp: u64) -> Result<Vec<u8>, StoreError> {
    StoredRecord {
        update: lz4_flex::compress_prepend_size(update),
        metadata: metadata.to_vec(),
        timestamp,
    }
    .encode()
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidKey(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
