//! Incremental garbage collection for the versioned store.
//!
//! Superseded versions, pruned commit-log entries and abandoned leases are reclaimed in small
//! steps so no single pass holds up writers. One step runs, in order:
//!
//! - Lease sweep: evict stale leases and compute the oldest read version still in use
//! - Log sweep: drop up to a batch of commit-log entries older than that version
//! - Hot-key sweep: rescan the keys named by the dropped log entries
//! - Cursor sweep: advance one of several persisted cursors through the data namespace
//!
//! Steps are triggered by read/write volume and run inline or on a tokio worker.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::GcConfig;
use crate::lease::{LeaseTable, Staleness};
use crate::storage::keys::{self, VersionedKey};
use crate::storage::mvcc::DataEntry;
use crate::storage::{OrderedBackend, StorageError, StorageResult, VersionedStore, WriteBatch};
use crate::txn::CommitCoordinator;

/// Outcome of one GC step.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub oldest_read_version: u64,
    pub leases_evicted: usize,
    pub log_entries_pruned: usize,
    pub hot_keys_swept: usize,
    pub cursor: u8,
    pub entries_scanned: usize,
    pub entries_deleted: usize,
    pub cursor_wrapped: bool,
}

/// Cumulative counters since the engine was opened.
#[derive(Debug, Default)]
pub struct GcCounters {
    runs: AtomicU64,
    entries_deleted: AtomicU64,
    log_entries_deleted: AtomicU64,
    leases_evicted: AtomicU64,
    cursor_wraps: AtomicU64,
}

/// Point-in-time copy of [`GcCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcEpochCounters {
    pub runs: u64,
    pub entries_deleted: u64,
    pub log_entries_deleted: u64,
    pub leases_evicted: u64,
    pub cursor_wraps: u64,
}

impl GcCounters {
    fn record(&self, report: &GcReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.entries_deleted
            .fetch_add(report.entries_deleted as u64, Ordering::Relaxed);
        self.log_entries_deleted
            .fetch_add(report.log_entries_pruned as u64, Ordering::Relaxed);
        self.leases_evicted
            .fetch_add(report.leases_evicted as u64, Ordering::Relaxed);
        if report.cursor_wrapped {
            self.cursor_wraps.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> GcEpochCounters {
        GcEpochCounters {
            runs: self.runs.load(Ordering::Relaxed),
            entries_deleted: self.entries_deleted.load(Ordering::Relaxed),
            log_entries_deleted: self.log_entries_deleted.load(Ordering::Relaxed),
            leases_evicted: self.leases_evicted.load(Ordering::Relaxed),
            cursor_wraps: self.cursor_wraps.load(Ordering::Relaxed),
        }
    }
}

/// Physical data entries and how many of them GC could reclaim right now.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataCensus {
    pub entries: u64,
    pub stale: u64,
}

/// Number of leading entries of one key's version chain (ascending) that no live reader can see.
///
/// Everything older than the newest entry at or below `oldest` is superseded for every reader.
/// When `starts_chain` is set nothing older exists, so leading tombstones hide nothing and go too.
pub(crate) fn stale_prefix(chain: &[VersionedKey], oldest: u64, starts_chain: bool) -> usize {
    let mut stale = chain
        .iter()
        .rposition(|entry| entry.version <= oldest)
        .unwrap_or(0);
    if starts_chain {
        while chain.get(stale).is_some_and(|entry| entry.tombstone) {
            stale += 1;
        }
    }
    stale
}

/// Round-robin sweep positions; each is the last data key its cursor processed.
struct Cursors {
    positions: Vec<Vec<u8>>,
    next: usize,
}

/// The garbage collector for one engine.
pub struct GarbageCollector<B: OrderedBackend> {
    store: Arc<VersionedStore<B>>,
    leases: Arc<LeaseTable>,
    commits: Arc<CommitCoordinator<B>>,
    config: GcConfig,
    cursors: Mutex<Cursors>,
    /// Serializes steps.
    running: Mutex<()>,
    volume: AtomicU64,
    counters: GcCounters,
}

impl<B: OrderedBackend> GarbageCollector<B> {
    /// Creates a collector, resuming any cursors persisted by a previous run.
    pub fn new(
        store: Arc<VersionedStore<B>>,
        leases: Arc<LeaseTable>,
        commits: Arc<CommitCoordinator<B>>,
        config: GcConfig,
    ) -> StorageResult<Self> {
        let count = config.cursor_count;
        let mut positions = Vec::with_capacity(count);
        for index in 0..count {
            let index = cursor_index(index)?;
            let position = match store.load_cursor(index)? {
                Some(position) => position,
                None => cursor_seed(index, count),
            };
            positions.push(position);
        }

        Ok(Self {
            store,
            leases,
            commits,
            config,
            cursors: Mutex::new(Cursors { positions, next: 0 }),
            running: Mutex::new(()),
            volume: AtomicU64::new(0),
            counters: GcCounters::default(),
        })
    }

    pub fn counters(&self) -> GcEpochCounters {
        self.counters.snapshot()
    }

    pub fn staleness(&self) -> Staleness {
        Staleness {
            max_idle: self.config.lease_max_age(),
            max_version_lag: self.config.lease_max_version_lag,
        }
    }

    /// Adds `operations` to the volume counter; true when it crossed the trigger and was reset.
    pub fn record_volume(&self, operations: u64) -> bool {
        let trigger = self.config.trigger_volume;
        let mut fired = false;
        let _ = self
            .volume
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |volume| {
                let next = volume.saturating_add(operations);
                fired = next >= trigger;
                Some(if fired { 0 } else { next })
            });
        fired
    }

    /// Runs one bounded GC step.
    pub fn step(&self) -> StorageResult<GcReport> {
        let _running = self.running.lock();
        let mut report = GcReport::default();

        let sweep = self.leases.sweep(
            Instant::now(),
            self.commits.current_version(),
            self.staleness(),
        );
        if !sweep.evicted.is_empty() {
            let evicted: Vec<(u64, u128)> = sweep
                .evicted
                .iter()
                .map(|id| (id.read_version, id.transaction_id))
                .collect();
            self.store.delete_leases(&evicted)?;
        }
        let oldest = sweep.oldest_read_version;
        report.oldest_read_version = oldest;
        report.leases_evicted = sweep.evicted.len();

        let pruned = self.commits.prune_log(oldest, self.config.batch_size)?;
        report.log_entries_pruned = pruned.len();

        let hot: BTreeSet<Vec<u8>> = pruned.into_iter().map(|entry| entry.key).collect();
        let hot: Vec<Vec<u8>> = hot.into_iter().take(self.config.batch_size).collect();
        report.hot_keys_swept = hot.len();
        report.entries_deleted += self.sweep_keys(&hot, oldest)?;

        self.sweep_cursor(oldest, &mut report)?;

        self.counters.record(&report);
        if report.entries_deleted > 0 || report.leases_evicted > 0 {
            info!(
                oldest,
                deleted = report.entries_deleted,
                log_pruned = report.log_entries_pruned,
                evicted = report.leases_evicted,
                cursor = report.cursor,
                "GC step reclaimed storage"
            );
        } else {
            debug!(oldest, cursor = report.cursor, "GC step found nothing to reclaim");
        }
        Ok(report)
    }

    /// Sweeps the whole version chain of each key.
    fn sweep_keys(&self, hot: &[Vec<u8>], oldest: u64) -> StorageResult<usize> {
        let mut batch = WriteBatch::new();
        for key in hot {
            let (lower, upper) = keys::key_versions(key);
            let chain: Vec<DataEntry> = self
                .store
                .entries(lower, upper, false)
                .collect::<StorageResult<_>>()?;
            let versions: Vec<VersionedKey> = chain.iter().map(|e| e.key.clone()).collect();
            let stale = stale_prefix(&versions, oldest, true);
            for entry in chain.into_iter().take(stale) {
                batch.delete(entry.raw);
            }
        }
        let deleted = batch.len();
        if !batch.is_empty() {
            self.store.backend().atomic_write(batch)?;
        }
        Ok(deleted)
    }

    fn sweep_cursor(&self, oldest: u64, report: &mut GcReport) -> StorageResult<()> {
        let batch_size = self.config.batch_size;
        let (index, position) = {
            let mut cursors = self.cursors.lock();
            let index = cursors.next;
            cursors.next = (index + 1) % cursors.positions.len();
            (index, cursors.positions[index].clone())
        };
        report.cursor = cursor_index(index)?;

        let (_, upper) = keys::namespace(keys::DATA);
        let entries: Vec<DataEntry> = self
            .store
            .entries(Bound::Excluded(position), upper, false)
            .take(batch_size)
            .collect::<StorageResult<_>>()?;
        report.entries_scanned = entries.len();

        let starts_chain = match entries.first() {
            Some(first) => self.starts_chain(first)?,
            None => true,
        };

        let mut batch = WriteBatch::new();
        let mut begin = 0;
        while begin < entries.len() {
            let key = &entries[begin].key.key;
            let end = entries[begin..]
                .iter()
                .position(|entry| &entry.key.key != key)
                .map_or(entries.len(), |len| begin + len);
            let versions: Vec<VersionedKey> =
                entries[begin..end].iter().map(|e| e.key.clone()).collect();
            let stale = stale_prefix(&versions, oldest, begin > 0 || starts_chain);
            for entry in &entries[begin..begin + stale] {
                batch.delete(entry.raw.clone());
            }
            begin = end;
        }
        report.entries_deleted += batch.len();
        if !batch.is_empty() {
            self.store.backend().atomic_write(batch)?;
        }

        report.cursor_wrapped = entries.len() < batch_size;
        let next = match entries.last() {
            Some(last) if !report.cursor_wrapped => last.raw.clone(),
            _ => vec![keys::DATA],
        };
        self.store.save_cursor(report.cursor, Some(&next))?;
        self.cursors.lock().positions[index] = next;
        Ok(())
    }

    /// True when nothing older of the same key precedes `first` in the keyspace.
    fn starts_chain(&self, first: &DataEntry) -> StorageResult<bool> {
        let (lower, _) = keys::namespace(keys::DATA);
        let previous = self
            .store
            .entries(lower, Bound::Excluded(first.raw.clone()), true)
            .next()
            .transpose()?;
        Ok(previous.map_or(true, |prev| prev.key.key != first.key.key))
    }

    /// Counts data entries and the stale ones among them with a full scan.
    pub fn census(&self) -> StorageResult<DataCensus> {
        let oldest = self
            .leases
            .oldest_read_version(self.commits.current_version());
        let (lower, upper) = keys::namespace(keys::DATA);

        let mut census = DataCensus::default();
        let mut chain: Vec<VersionedKey> = Vec::new();
        for entry in self.store.entries(lower, upper, false) {
            let entry = entry?;
            census.entries += 1;
            if chain.last().is_some_and(|last| last.key != entry.key.key) {
                census.stale += stale_prefix(&chain, oldest, true) as u64;
                chain.clear();
            }
            chain.push(entry.key);
        }
        census.stale += stale_prefix(&chain, oldest, true) as u64;
        Ok(census)
    }

    /// Starts a tokio task that runs one step per signal on the blocking pool.
    ///
    /// The channel holds one pending signal; further signals while one is queued are dropped,
    /// so a burst of triggers costs a single extra step.
    pub fn spawn_worker(self: &Arc<Self>) -> StorageResult<mpsc::Sender<()>> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            StorageError::InvalidArgument(
                "background GC must be started inside a tokio runtime".to_string(),
            )
        })?;

        let (tx, mut rx) = mpsc::channel::<()>(1);
        let gc = Arc::downgrade(self);
        handle.spawn(async move {
            info!("Started background GC worker");
            while rx.recv().await.is_some() {
                let Some(gc) = gc.upgrade() else { break };
                match tokio::task::spawn_blocking(move || gc.step()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Background GC step failed: {}", e),
                    Err(e) => warn!("Background GC task panicked: {}", e),
                }
            }
            debug!("Background GC worker stopped");
        });
        Ok(tx)
    }
}

fn cursor_index(index: usize) -> StorageResult<u8> {
    u8::try_from(index)
        .map_err(|_| StorageError::InvalidArgument(format!("GC cursor {} out of range", index)))
}

/// Cursor 0 starts at the beginning of the data namespace, the rest at evenly spread first bytes.
fn cursor_seed(index: u8, count: usize) -> Vec<u8> {
    if index == 0 {
        return vec![keys::DATA];
    }
    let byte = usize::from(index) * 256 / count.max(1);
    vec![keys::DATA, u8::try_from(byte).unwrap_or(u8::MAX)]
}
