//! Storage layer: ordered byte backends, the versioned key layout and the garbage collector.
//!
//! The engine stores multi-version data by encoding versions into the key space of an
//! [`OrderedBackend`]. The same layout is used whether the backend is the durable sled store or the
//! in-memory persistent tree, so visibility, commit and collection logic is written once:
//!
//! 1. **Versioned data**: each commit writes `(key, version, tombstone)` entries, never overwrites
//! 2. **Commit log**: one `(version, key)` record per written key, consulted by conflict checks
//! 3. **Active leases**: one record per open snapshot, pinning the versions it may still read
//! 4. **Incremental collection**: bounded sweeps reclaim what no live snapshot can observe

pub mod backend;
pub mod compaction;
pub mod keys;
pub mod memory;
pub mod mvcc;

pub use backend::{
    BackendConfig, BackendError, BackendIter, BackendResult, KvPair, OrderedBackend, SledBackend,
    WriteBatch, WriteOp,
};
pub use compaction::{GarbageCollector, GcCounters, GcEpochCounters, GcReport};
pub use keys::VersionedKey;
pub use memory::MemoryBackend;
pub use mvcc::{LogEntry, VersionedScan, VersionedStore};

use thiserror::Error;

use crate::txn::ConflictError;

/// Engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Conflict(ConflictError),

    #[error("Transaction failed after {attempts} attempts: {}", summarize(.conflicts))]
    RetryExhausted {
        attempts: u32,
        conflicts: Vec<ConflictError>,
    },

    #[error("Transaction {transaction_id:032x} at version {read_version} was aborted: its lease was evicted")]
    TransactionAborted {
        transaction_id: u128,
        read_version: u64,
    },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Corrupt storage: {0}")]
    Corrupt(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// Only serialization conflicts are worth re-running a transaction for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

impl From<ConflictError> for StorageError {
    fn from(err: ConflictError) -> Self {
        StorageError::Conflict(err)
    }
}

fn summarize(conflicts: &[ConflictError]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type StorageResult<T> = Result<T, StorageError>;
