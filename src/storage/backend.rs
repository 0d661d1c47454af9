//! Ordered byte-store backends.
//!
//! The engine never talks to a concrete store directly. Everything it needs from persistence is
//! captured by [`OrderedBackend`]: point reads, lazily iterated range scans in either direction,
//! and atomic batches of puts and deletes over a single lexicographically ordered keyspace.
//!
//! Two implementations ship with the crate:
//!
//! - [`SledBackend`]: durable, one named `sled::Tree` per engine. Several engines can share a sled
//!   database by using different tree names.
//! - [`MemoryBackend`](crate::storage::MemoryBackend): a persistent ordered tree held in memory.

use std::ops::Bound;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A raw key-value pair as stored by a backend.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy iterator returned by [`OrderedBackend::scan`].
pub type BackendIter = Box<dyn Iterator<Item = BackendResult<KvPair>>>;

/// A single mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Puts and deletes applied indivisibly by [`OrderedBackend::atomic_write`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// The ordered byte-store contract the engine is written against.
pub trait OrderedBackend: Send + Sync + 'static {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>>;

    /// Iterates every pair inside `(lower, upper)`, ascending unless `reverse` is set.
    ///
    /// The iterator is lazy and owns whatever it needs, so callers may stop early without
    /// paying for the rest of the range.
    fn scan(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>, reverse: bool) -> BackendIter;

    /// Applies every operation in `batch` or none of them.
    fn atomic_write(&self, batch: WriteBatch) -> BackendResult<()>;

    /// Makes previously applied batches durable.
    fn flush(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Returns true when no key can satisfy both bounds.
///
/// Ordered maps panic on inverted ranges, so backends check this before scanning.
pub(crate) fn is_empty_range(lower: &Bound<Vec<u8>>, upper: &Bound<Vec<u8>>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
    }
}

/// Configuration for the sled backend.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Name of the sled tree holding this engine's keyspace.
    pub tree_name: String,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages in the background. `None` disables periodic flushing.
    pub flush_every_ms: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            tree_name: "mvkv".to_string(),
            cache_size_mb: 256,
            flush_every_ms: Some(500),
        }
    }
}

/// Durable backend storing the whole keyspace in one sled tree.
pub struct SledBackend {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledBackend {
    /// Opens (or creates) the database at `config.data_dir`.
    pub fn open(config: &BackendConfig) -> BackendResult<Self> {
        debug!("Initializing sled backend at {:?}", config.data_dir);

        if config.tree_name.is_empty() {
            return Err(BackendError::ConfigError(
                "tree name must not be empty".to_string(),
            ));
        }

        std::fs::create_dir_all(&config.data_dir)?;

        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(config.flush_every_ms)
            .open()
            .map_err(|e| {
                BackendError::ConfigError(format!("Failed to open sled database: {}", e))
            })?;
        let tree = db.open_tree(config.tree_name.as_bytes())?;

        info!(
            tree = %config.tree_name,
            cache_size_mb = config.cache_size_mb,
            "Sled backend initialized"
        );

        Ok(Self { db, tree })
    }
}

impl OrderedBackend for SledBackend {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn scan(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>, reverse: bool) -> BackendIter {
        if is_empty_range(&lower, &upper) {
            return Box::new(std::iter::empty());
        }

        let iter = self.tree.range((lower, upper));
        let convert = |item: sled::Result<(sled::IVec, sled::IVec)>| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(BackendError::from)
        };

        if reverse {
            Box::new(iter.rev().map(convert))
        } else {
            Box::new(iter.map(convert))
        }
    }

    fn atomic_write(&self, batch: WriteBatch) -> BackendResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => sled_batch.insert(key, value),
                WriteOp::Delete { key } => sled_batch.remove(key),
            }
        }
        self.tree.apply_batch(sled_batch)?;
        Ok(())
    }

    fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
