//! Snapshots, transactions and the commit path.
//!
//! A [`Snapshot`] pins one committed version and reads it without locks. A [`Transaction`] adds a
//! buffered write set and a log of the ranges it read; at commit the [`CommitCoordinator`] rejects
//! it if anything committed after its read version landed inside one of those ranges.

pub mod commit;
pub mod conflict;
pub mod range;
pub mod snapshot;
pub mod transaction;

pub use commit::CommitCoordinator;
pub use conflict::{ensure_serializable, Conflict, ConflictError};
pub use range::{Condition, ReadLog, ReadRange};
pub use snapshot::{CancelToken, Query, Snapshot};
pub use transaction::{Transaction, TxnQuery, Write, WriteSet};
