//! # mvkv: a serializable MVCC key-value engine
//!
//! mvkv stores every committed version of every key in one ordered byte keyspace and runs
//! optimistic transactions over it with serializable snapshot isolation. It provides:
//!
//! - **Lock-free snapshots**: readers pin a committed version and never block writers
//! - **Optimistic transactions**: buffered writes, range-precise conflict detection and retry
//! - **Pluggable storage**: an in-memory persistent tree or a durable sled tree
//! - **Incremental GC**: superseded versions and abandoned snapshots are reclaimed in small steps
//!
//! # Usage
//!
//! ```no_run
//! use mvkv::{Condition, Engine, EngineConfig, StorageError};
//!
//! let engine = Engine::in_memory(EngineConfig::default())?;
//! engine.transact(|tx| {
//!     let count = tx.get(b"count")?.map_or(0, |v| v.len());
//!     tx.put("count", vec![b'x'; count + 1])?;
//!     Ok::<_, StorageError>(())
//! })?;
//!
//! let keys = engine.snapshot(|snap| {
//!     snap.query(Condition::gte("")).collect::<Result<Vec<_>, _>>()
//! })?;
//! assert_eq!(keys.len(), 1);
//! # Ok::<(), StorageError>(())
//! ```

pub mod config;
pub mod engine;
pub mod lease;
pub mod storage;
pub mod txn;

pub use config::{EngineConfig, GcConfig, GcMode};
pub use engine::{Engine, EngineStats};
pub use storage::{
    BackendConfig, GcReport, MemoryBackend, OrderedBackend, SledBackend, StorageError,
    StorageResult,
};
pub use txn::{CancelToken, Condition, ConflictError, Snapshot, Transaction};
