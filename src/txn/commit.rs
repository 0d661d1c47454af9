//! The commit coordinator: the only serialization point of the engine.
//!
//! Under one mutex it checks that the committing transaction is still leased, validates its reads
//! against the commit log, writes the batch and advances the version. Readers never take this
//! lock; they read the version published through an atomic after each batch lands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::lease::Lease;
use crate::storage::{LogEntry, OrderedBackend, StorageResult, VersionedStore};
use crate::txn::conflict::ensure_serializable;
use crate::txn::range::ReadRange;
use crate::txn::snapshot::ensure_live;
use crate::txn::transaction::WriteSet;

/// State guarded by the commit lock.
struct CommitState<B: OrderedBackend> {
    version: u64,
    /// In-memory mirror of the persisted log, oldest first.
    log: VecDeque<LogEntry>,
    store: Arc<VersionedStore<B>>,
}

pub struct CommitCoordinator<B: OrderedBackend> {
    state: Mutex<CommitState<B>>,
    published: AtomicU64,
}

impl<B: OrderedBackend> CommitCoordinator<B> {
    /// Restores the version counter and commit log from `store`.
    pub fn load(store: Arc<VersionedStore<B>>) -> StorageResult<Self> {
        let version = store.load_version()?;
        let log: VecDeque<LogEntry> = store.load_log()?.into();
        Ok(Self {
            state: Mutex::new(CommitState {
                version,
                log,
                store,
            }),
            published: AtomicU64::new(version),
        })
    }

    /// Last version whose writes are fully visible.
    pub fn current_version(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Commits `writes` for the transaction holding `lease`.
    ///
    /// Returns the new version, or `None` for an empty write set, which never conflicts but
    /// still fails once the lease is evicted.
    pub fn commit(
        &self,
        lease: &Lease,
        reads: &[ReadRange],
        writes: &WriteSet,
    ) -> StorageResult<Option<u64>> {
        if writes.is_empty() {
            ensure_live(lease)?;
            return Ok(None);
        }

        let mut state = self.state.lock();
        // Log entries this transaction depends on may already be pruned once it is evicted.
        ensure_live(lease)?;

        let read_version = lease.read_version();
        ensure_serializable(
            read_version,
            reads,
            state
                .log
                .iter()
                .rev()
                .take_while(|entry| entry.version > read_version),
        )?;

        let version = state.version + 1;
        let (batch, entries) = state.store.commit_batch(
            version,
            writes.iter().map(|(key, write)| (key.as_slice(), write.value())),
        )?;
        state.store.backend().atomic_write(batch)?;

        state.version = version;
        state.log.extend(entries);
        self.published.store(version, Ordering::SeqCst);

        debug!(
            version,
            read_version,
            writes = writes.len(),
            reads = reads.len(),
            "Committed transaction"
        );
        Ok(Some(version))
    }

    /// Drops up to `limit` of the oldest log entries below `oldest` and returns them.
    pub fn prune_log(&self, oldest: u64, limit: usize) -> StorageResult<Vec<LogEntry>> {
        let mut state = self.state.lock();
        let count = state
            .log
            .iter()
            .take(limit)
            .take_while(|entry| entry.version < oldest)
            .count();
        if count == 0 {
            return Ok(Vec::new());
        }

        state.store.prune_log_below(oldest, count)?;
        let pruned: Vec<LogEntry> = state.log.drain(..count).collect();

        debug!(oldest, pruned = pruned.len(), remaining = state.log.len(), "Pruned commit log");
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeaseTable, Staleness};
    use crate::storage::{MemoryBackend, StorageError};
    use crate::txn::transaction::Write;
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<VersionedStore<MemoryBackend>>, CommitCoordinator<MemoryBackend>) {
        let store = Arc::new(VersionedStore::new(Arc::new(MemoryBackend::new())));
        let commits = CommitCoordinator::load(store.clone()).unwrap();
        (store, commits)
    }

    fn writes(keys: &[&str]) -> WriteSet {
        keys.iter()
            .map(|k| (k.as_bytes().to_vec(), Write::Put(b"v".to_vec())))
            .collect()
    }

    #[test]
    fn test_commit_advances_version() {
        let (store, commits) = setup();
        let table = LeaseTable::new();
        let lease = table.open(1, || commits.current_version());

        assert_eq!(commits.commit(&lease, &[], &WriteSet::new()).unwrap(), None);
        assert_eq!(commits.commit(&lease, &[], &writes(&["a", "b"])).unwrap(), Some(1));
        assert_eq!(commits.current_version(), 1);
        assert_eq!(commits.log_len(), 2);
        assert_eq!(store.load_version().unwrap(), 1);
        assert_eq!(store.get(b"a", 1).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_conflicting_read_is_rejected() {
        let (_store, commits) = setup();
        let table = LeaseTable::new();
        let first = table.open(1, || commits.current_version());
        let second = table.open(2, || commits.current_version());

        commits.commit(&first, &[], &writes(&["k"])).unwrap();
        let err = commits
            .commit(&second, &[ReadRange::point(b"k")], &writes(&["other"]))
            .unwrap_err();
        match err {
            StorageError::Conflict(conflict) => {
                assert_eq!(conflict.read_version, 0);
                assert_eq!(conflict.conflicts.len(), 1);
                assert_eq!(conflict.conflicts[0].version, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(commits.current_version(), 1);
    }

    #[test]
    fn test_evicted_lease_cannot_commit() {
        let (_store, commits) = setup();
        let table = LeaseTable::new();
        let lease = table.open(1, || 0);
        let limits = Staleness {
            max_idle: Duration::ZERO,
            max_version_lag: 0,
        };
        table.sweep(Instant::now() + Duration::from_secs(1), 5, limits);

        assert!(matches!(
            commits.commit(&lease, &[], &writes(&["a"])),
            Err(StorageError::TransactionAborted { .. })
        ));
        assert_eq!(commits.current_version(), 0);
    }

    #[test]
    fn test_prune_log_and_reload() {
        let (store, commits) = setup();
        let table = LeaseTable::new();
        for key in ["a", "b", "c"] {
            let lease = table.open(1, || commits.current_version());
            commits.commit(&lease, &[], &writes(&[key])).unwrap();
        }

        let pruned = commits.prune_log(3, 16).unwrap();
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[0].key, b"a".to_vec());
        assert!(commits.prune_log(3, 16).unwrap().is_empty());

        let reloaded = CommitCoordinator::load(store).unwrap();
        assert_eq!(reloaded.current_version(), 3);
        assert_eq!(reloaded.log_len(), 1);
    }

    #[test]
    fn test_prune_log_respects_limit() {
        let (store, commits) = setup();
        let table = LeaseTable::new();
        for key in ["a", "b", "c", "d", "e"] {
            let lease = table.open(1, || commits.current_version());
            commits.commit(&lease, &[], &writes(&[key])).unwrap();
        }

        let first = commits.prune_log(5, 3).unwrap();
        let keys: Vec<Vec<u8>> = first.iter().map(|entry| entry.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(commits.log_len(), 2);
        assert_eq!(store.load_log().unwrap().len(), 2);

        let second = commits.prune_log(5, 3).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key, b"d".to_vec());
        assert_eq!(store.load_log().unwrap()[0].version, 5);
    }
}
