//! The transactional engine.
//!
//! [`Engine`] ties the pieces together: it opens snapshots against the published version,
//! registers their leases, runs caller closures against them, commits write sets through the
//! coordinator and feeds operation volume to the garbage collector.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, GcMode};
use crate::lease::LeaseTable;
use crate::storage::{
    BackendConfig, GarbageCollector, GcEpochCounters, GcReport, MemoryBackend, OrderedBackend,
    SledBackend, StorageError, StorageResult, VersionedStore,
};
use crate::txn::snapshot::LeaseGuard;
use crate::txn::{CommitCoordinator, Snapshot, Transaction};

/// Operational counters returned by [`Engine::stats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub current_version: u64,
    /// Physical data entries, every version and tombstone included.
    pub total_keys: u64,
    /// Entries the garbage collector could reclaim right now.
    pub stale_keys: u64,
    pub active_transactions: usize,
    /// Open leases the next GC step would evict.
    pub stale_transactions: usize,
    pub oldest_read_version: u64,
    pub commit_log_entries: usize,
    pub gc: GcEpochCounters,
}

struct EngineInner<B: OrderedBackend> {
    config: EngineConfig,
    store: Arc<VersionedStore<B>>,
    leases: Arc<LeaseTable>,
    commits: Arc<CommitCoordinator<B>>,
    gc: Arc<GarbageCollector<B>>,
}

/// A serializable MVCC key-value engine over an ordered backend.
///
/// Cloning is cheap and every clone shares the same engine.
pub struct Engine<B: OrderedBackend> {
    inner: Arc<EngineInner<B>>,
    gc_tx: Option<mpsc::Sender<()>>,
}

impl<B: OrderedBackend> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gc_tx: self.gc_tx.clone(),
        }
    }
}

impl Engine<MemoryBackend> {
    /// An engine whose data lives only as long as the process.
    pub fn in_memory(config: EngineConfig) -> StorageResult<Self> {
        Self::open(MemoryBackend::new(), config)
    }
}

impl Engine<SledBackend> {
    /// Opens (or creates) a durable engine in `backend.data_dir`.
    pub fn open_sled(backend: BackendConfig, config: EngineConfig) -> StorageResult<Self> {
        Self::open(SledBackend::open(&backend)?, config)
    }
}

impl<B: OrderedBackend> Engine<B> {
    /// Opens an engine over `backend`, restoring the version counter, commit log and GC cursors.
    ///
    /// With [`GcMode::Background`] this must run inside a tokio runtime.
    pub fn open(backend: B, config: EngineConfig) -> StorageResult<Self> {
        config.validate()?;

        let store = Arc::new(VersionedStore::new(Arc::new(backend)));
        // Snapshots never outlive the process that opened them.
        let purged = store.purge_leases()?;
        if purged > 0 {
            warn!(purged, "Dropped leases left by a previous process");
        }

        let commits = Arc::new(CommitCoordinator::load(store.clone())?);
        let leases = Arc::new(LeaseTable::new());
        let gc = Arc::new(GarbageCollector::new(
            store.clone(),
            leases.clone(),
            commits.clone(),
            config.gc.clone(),
        )?);
        let gc_tx = match config.gc.mode {
            GcMode::Background => Some(gc.spawn_worker()?),
            GcMode::Sync | GcMode::Disabled => None,
        };

        info!(
            version = commits.current_version(),
            log_entries = commits.log_len(),
            gc_mode = ?config.gc.mode,
            "Opened engine"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                leases,
                commits,
                gc,
            }),
            gc_tx,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<B> {
        self.inner.store.backend()
    }

    /// Last committed version.
    pub fn current_version(&self) -> u64 {
        self.inner.commits.current_version()
    }

    /// Runs `f` in a read-write transaction and commits its writes.
    ///
    /// On a serialization conflict `f` runs again against a fresh snapshot, up to
    /// `transaction_retry_count` extra times, so it must not have side effects outside the
    /// transaction. Errors returned by `f` abort the attempt and are never retried.
    pub fn transact<R, E, F>(&self, mut f: F) -> Result<R, E>
    where
        F: FnMut(&mut Transaction<'_, B>) -> Result<R, E>,
        E: From<StorageError>,
    {
        let retries = self.inner.config.transaction_retry_count;
        let mut conflicts = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut txn = Transaction::new(self.open_snapshot()?);
            let outcome = f(&mut txn);
            let operations = txn.snapshot().operations();

            let committed = match outcome {
                Ok(value) => self
                    .inner
                    .commits
                    .commit(txn.snapshot().lease(), txn.read_ranges(), txn.pending_writes())
                    .map(|_| value),
                Err(e) => {
                    drop(txn);
                    self.record_operations(operations);
                    return Err(e);
                }
            };
            // Release the lease before GC runs so it no longer pins this read version.
            drop(txn);
            self.record_operations(operations);

            match committed {
                Ok(value) => return Ok(value),
                Err(StorageError::Conflict(conflict)) if retries == 0 => {
                    return Err(StorageError::Conflict(conflict).into());
                }
                Err(StorageError::Conflict(conflict)) => {
                    debug!(attempt, read_version = conflict.read_version, "Transaction conflicted");
                    conflicts.push(conflict);
                    if attempt > retries {
                        warn!(attempts = attempt, "Transaction retries exhausted");
                        return Err(StorageError::RetryExhausted {
                            attempts: attempt,
                            conflicts,
                        }
                        .into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs `f` against a read-only snapshot of the current version.
    pub fn snapshot<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Snapshot<'_, B>) -> Result<R, E>,
        E: From<StorageError>,
    {
        let snapshot = self.open_snapshot()?;
        let result = f(&snapshot);
        let operations = snapshot.operations();
        drop(snapshot);
        self.record_operations(operations);
        result
    }

    fn open_snapshot(&self) -> StorageResult<Snapshot<'_, B>> {
        let inner = &*self.inner;
        let transaction_id = Uuid::new_v4().as_u128();
        let lease = inner
            .leases
            .open(transaction_id, || inner.commits.current_version());
        let read_version = lease.read_version();
        let guard = LeaseGuard::new(&inner.leases, &inner.store, lease);

        inner
            .store
            .put_lease(read_version, transaction_id, unix_millis())?;
        Ok(Snapshot::new(&inner.store, guard))
    }

    fn record_operations(&self, operations: u64) {
        let gc = &self.inner.gc;
        match self.inner.config.gc.mode {
            GcMode::Disabled => {}
            GcMode::Sync => {
                if gc.record_volume(operations) {
                    if let Err(e) = gc.step() {
                        warn!("GC step failed: {}", e);
                    }
                }
            }
            GcMode::Background => {
                if gc.record_volume(operations) {
                    if let Some(tx) = &self.gc_tx {
                        match tx.try_send(()) {
                            Ok(()) | Err(TrySendError::Full(())) => {}
                            Err(TrySendError::Closed(())) => {
                                warn!("Background GC worker is gone; skipping step")
                            }
                        }
                    }
                }
            }
        }
    }

    /// Runs one garbage collection step now, whatever the configured mode.
    pub fn collect_garbage(&self) -> StorageResult<GcReport> {
        self.inner.gc.step()
    }

    /// Gathers engine statistics. Counting stale entries scans the whole data namespace.
    pub fn stats(&self) -> StorageResult<EngineStats> {
        let inner = &*self.inner;
        let current_version = inner.commits.current_version();
        let census = inner.gc.census()?;

        Ok(EngineStats {
            current_version,
            total_keys: census.entries,
            stale_keys: census.stale,
            active_transactions: inner.leases.len(),
            stale_transactions: inner.leases.count_stale(
                Instant::now(),
                current_version,
                inner.gc.staleness(),
            ),
            oldest_read_version: inner.leases.oldest_read_version(current_version),
            commit_log_entries: inner.commits.log_len(),
            gc: inner.gc.counters(),
        })
    }

    /// Makes every committed transaction durable.
    pub fn flush(&self) -> StorageResult<()> {
        self.inner.store.backend().flush()?;
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::txn::Condition;

    fn engine(retries: u32) -> Engine<MemoryBackend> {
        let config = EngineConfig {
            transaction_retry_count: retries,
            gc: GcConfig {
                mode: GcMode::Disabled,
                ..GcConfig::default()
            },
        };
        Engine::in_memory(config).unwrap()
    }

    #[test]
    fn test_commit_then_read() {
        let engine = engine(8);
        engine
            .transact(|tx| {
                tx.put("a", "1")?;
                tx.put("b", "2")?;
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert_eq!(engine.current_version(), 1);

        let value = engine.snapshot(|snap| snap.get(b"b")).unwrap();
        assert_eq!(value, Some(b"2".to_vec()));
    }

    #[test]
    fn test_read_only_transaction_does_not_bump_version() {
        let engine = engine(8);
        let seen = engine
            .transact(|tx| Ok::<_, StorageError>(tx.query(Condition::gte("")).count()))
            .unwrap();
        assert_eq!(seen, 0);
        assert_eq!(engine.current_version(), 0);
    }

    #[test]
    fn test_closure_error_is_not_retried() {
        let engine = engine(8);
        let mut calls = 0;
        let result: StorageResult<()> = engine.transact(|tx| {
            calls += 1;
            tx.put("a", "1")?;
            Err(StorageError::InvalidArgument("rejected".to_string()))
        });
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
        assert_eq!(calls, 1);
        assert_eq!(engine.current_version(), 0);
    }

    #[test]
    fn test_leases_are_released() {
        let engine = engine(8);
        engine
            .snapshot(|snap| {
                assert_eq!(engine.stats()?.active_transactions, 1);
                snap.get(b"missing")
            })
            .unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.oldest_read_version, 0);
    }

    #[test]
    fn test_sync_gc_runs_on_volume() {
        let config = EngineConfig {
            transaction_retry_count: 8,
            gc: GcConfig {
                trigger_volume: 2,
                ..GcConfig::default()
            },
        };
        let engine = Engine::in_memory(config).unwrap();
        for i in 0..4 {
            engine.transact(|tx| tx.put("k", format!("v{}", i))).unwrap();
        }
        let stats = engine.stats().unwrap();
        assert!(stats.gc.runs >= 1);
        assert_eq!(stats.total_keys, 1);
        assert_eq!(stats.stale_keys, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            transaction_retry_count: 1,
            gc: GcConfig {
                batch_size: 0,
                ..GcConfig::default()
            },
        };
        assert!(matches!(
            Engine::in_memory(config),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
