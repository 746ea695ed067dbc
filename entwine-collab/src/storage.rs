//! Durable operation log and clock store.
//!
//! Column families:
//! - `ops`    — one record per applied operation, keyed by local op-id
//!              (u64 big-endian) so a forward iteration is clock order
//! - `clocks` — peer-id → observed clock (u64 big-endian)
//! - `meta`   — the op-id counter
//!
//! The log is append-only: deletes get their own record carrying the
//! position they removed, so a patch extracted from any clock range can be
//! replayed into a peer that still holds the atom. Op-id allocation
//! persists the counter on every call and re-derives it from the last log
//! key on open, so ids stay unique and monotonic across restarts.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{OpKind, Operation};

const CF_OPS: &str = "ops";
const CF_CLOCKS: &str = "clocks";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_OPS, CF_CLOCKS, CF_META];

/// Key of the persisted op-id counter in `meta`.
const META_NEXT_OP_ID: &[u8] = b"next_op_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// fsync on every write (default: false — RocksDB's WAL covers us).
    pub sync_writes: bool,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("entwine_data"),
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Config for testing (temp directory, small limits).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Durable record of one operation. The clock is the key, not a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpRecord {
    kind: OpKind,
    atom: char,
    pos: Vec<u8>,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed operation log and clock store.
pub struct OpLog {
    db: DBWithThreadMode<MultiThreaded>,
    config: StoreConfig,
    /// Next op-id to hand out.
    next_op_id: AtomicU64,
}

impl OpLog {
    /// Open (or create) the store at the configured path and recover the
    /// op-id counter.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                // Records are tiny; skip compression, it only costs cycles.
                cf_opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next = Self::recover_next_op_id(&db)?;

        Ok(Self {
            db,
            config,
            next_op_id: AtomicU64::new(next),
        })
    }

    /// Recover the counter: the persisted value, or one past the last log
    /// key, whichever is larger. Op-ids start at 1.
    fn recover_next_op_id(db: &DBWithThreadMode<MultiThreaded>) -> Result<u64, StoreError> {
        let cf_meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database("missing meta column family".into()))?;
        let persisted = match db.get_cf(&cf_meta, META_NEXT_OP_ID)? {
            Some(bytes) if bytes.len() == 8 => u64::from_be_bytes(bytes[..8].try_into().unwrap()),
            _ => 1,
        };

        let cf_ops = db
            .cf_handle(CF_OPS)
            .ok_or_else(|| StoreError::Database("missing ops column family".into()))?;
        let mut iter = db.iterator_cf(&cf_ops, IteratorMode::End);
        let from_log = match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                u64::from_be_bytes(key[..8].try_into().unwrap()) + 1
            }
            _ => 1,
        };

        Ok(persisted.max(from_log).max(1))
    }

    /// Allocate the next op-id: strictly increasing, durable across
    /// restarts. The counter write may block briefly; its failure is
    /// logged, not fatal, because the last log key also bounds recovery.
    pub fn next_op_id(&self) -> u64 {
        let id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.persist_counter(id + 1) {
            log::error!("failed to persist op-id counter: {e}");
        }
        id
    }

    fn persist_counter(&self, next: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        self.db
            .put_cf_opt(&cf, META_NEXT_OP_ID, next.to_be_bytes(), &self.write_opts())?;
        Ok(())
    }

    /// Highest op-id recorded in the log, zero when empty.
    pub fn last_op_id(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() == 8 => {
                Ok(u64::from_be_bytes(key[..8].try_into().unwrap()))
            }
            Some(Err(e)) => Err(StoreError::Database(e.to_string())),
            _ => Ok(0),
        }
    }

    /// Record an applied insert.
    pub fn append_insert(&self, op_id: u64, atom: char, pos: &[u8]) -> Result<(), StoreError> {
        self.append(op_id, OpKind::Insert, atom, pos)
    }

    /// Record an applied delete. The record carries the removed position so
    /// extracted patches can replay the delete on a peer that still holds
    /// the atom.
    pub fn append_delete(&self, op_id: u64, atom: char, pos: &[u8]) -> Result<(), StoreError> {
        self.append(op_id, OpKind::Delete, atom, pos)
    }

    fn append(&self, op_id: u64, kind: OpKind, atom: char, pos: &[u8]) -> Result<(), StoreError> {
        let record = OpRecord { kind, atom, pos: pos.to_vec() };
        let value = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let cf = self.cf(CF_OPS)?;
        self.db
            .put_cf_opt(&cf, op_id.to_be_bytes(), value, &self.write_opts())?;
        Ok(())
    }

    /// All operations with clock in `[lo, hi]` inclusive, ascending.
    pub fn extract_between(&self, lo: u64, hi: u64) -> Result<Vec<Operation>, StoreError> {
        if lo > hi {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_OPS)?;
        let start = lo.to_be_bytes();
        let mut ops = Vec::new();

        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() != 8 {
                continue;
            }
            let clock = u64::from_be_bytes(key[..8].try_into().unwrap());
            if clock > hi {
                break;
            }
            let (record, _): (OpRecord, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ops.push(Operation {
                kind: record.kind,
                atom: record.atom,
                pos: record.pos,
                clock,
            });
        }
        Ok(ops)
    }

    /// Load all persisted peer clocks.
    pub fn load_clocks(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let cf = self.cf(CF_CLOCKS)?;
        let mut clocks = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if value.len() != 8 {
                continue;
            }
            let peer = String::from_utf8_lossy(&key).into_owned();
            let clock = u64::from_be_bytes(value[..8].try_into().unwrap());
            clocks.push((peer, clock));
        }
        Ok(clocks)
    }

    /// Flush dirty clock entries in one atomic batch.
    pub fn flush_clocks(&self, entries: &[(String, u64)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_CLOCKS)?;
        let mut batch = WriteBatch::default();
        for (peer, clock) in entries {
            batch.put_cf(&cf, peer.as_bytes(), clock.to_be_bytes());
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

/// CPU core count for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
