//! Multi-version store over an ordered byte backend.
//!
//! Every commit writes new `(key, version, tombstone)` entries instead of overwriting, so a reader
//! pinned at version `R` resolves each key to its newest entry with `version <= R`:
//!
//! - Point reads walk one key's versions newest-first and stop at the first visible one
//! - Scans collapse each key's run of versions into at most one visible pair, lazily
//! - Commit batches carry data entries, commit-log entries and the version counter together
//!
//! The store itself is stateless apart from the backend handle; version publication, leases and
//! the commit lock live with the engine.

use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use crate::storage::keys::{self, VersionedKey};
use crate::storage::{BackendIter, OrderedBackend, StorageError, StorageResult, WriteBatch};
use crate::txn::Condition;

/// One key written by one commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub version: u64,
    pub key: Vec<u8>,
}

/// A decoded entry of the data namespace.
#[derive(Clone, Debug)]
pub struct DataEntry {
    pub raw: Vec<u8>,
    pub key: VersionedKey,
}

/// The versioned view of a backend.
pub struct VersionedStore<B: OrderedBackend> {
    backend: Arc<B>,
}

impl<B: OrderedBackend> VersionedStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Last committed version; 0 for an empty store.
    pub fn load_version(&self) -> StorageResult<u64> {
        match self.backend.get(&keys::version_key())? {
            Some(raw) => keys::decode_u64(&raw),
            None => Ok(0),
        }
    }

    /// Value of `key` as of `version`, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8], version: u64) -> StorageResult<Option<Vec<u8>>> {
        let (lower, upper) = keys::key_versions(key);
        for item in self.backend.scan(lower, upper, true) {
            let (raw, value) = item?;
            let entry = VersionedKey::decode(&raw)?;
            if entry.version <= version {
                return Ok(if entry.tombstone { None } else { Some(value) });
            }
        }
        Ok(None)
    }

    /// Lazily scans the logical keys matching `condition` as of `version`.
    pub fn scan(&self, condition: &Condition, version: u64) -> VersionedScan {
        let (data_lo, data_hi) = keys::namespace(keys::DATA);
        let (lower, upper) = match condition {
            Condition::Gt(k) => (Bound::Excluded(keys::key_upper(k)), data_hi),
            Condition::Gte(k) => (Bound::Included(keys::key_prefix(k)), data_hi),
            Condition::Lt(k) => (data_lo, Bound::Excluded(keys::key_prefix(k))),
            Condition::Lte(k) => (data_lo, Bound::Included(keys::key_upper(k))),
        };
        let reverse = condition.is_reverse();
        VersionedScan {
            inner: self.backend.scan(lower, upper, reverse),
            read_version: version,
            reverse,
            pending: None,
            done: false,
        }
    }

    /// Raw data-namespace entries, every version included.
    pub fn entries(
        &self,
        lower: Bound<Vec<u8>>,
        upper: Bound<Vec<u8>>,
        reverse: bool,
    ) -> impl Iterator<Item = StorageResult<DataEntry>> {
        self.backend.scan(lower, upper, reverse).map(|item| {
            let (raw, _) = item?;
            let key = VersionedKey::decode(&raw)?;
            Ok(DataEntry { raw, key })
        })
    }

    /// Builds the atomic batch for a commit at `version`.
    ///
    /// `writes` yields each key once with `Some(value)` for a put and `None` for a delete.
    pub fn commit_batch<'a>(
        &self,
        version: u64,
        writes: impl IntoIterator<Item = (&'a [u8], Option<&'a [u8]>)>,
    ) -> StorageResult<(WriteBatch, Vec<LogEntry>)> {
        let mut batch = WriteBatch::new();
        let mut log = Vec::new();

        for (index, (key, value)) in writes.into_iter().enumerate() {
            let index = u32::try_from(index).map_err(|_| {
                StorageError::InvalidArgument("too many writes in one commit".to_string())
            })?;
            let data_key = VersionedKey::new(key, version, value.is_none()).encode();
            batch.put(data_key, value.unwrap_or_default().to_vec());
            batch.put(keys::log_key(version, index), key.to_vec());
            log.push(LogEntry {
                version,
                key: key.to_vec(),
            });
        }
        batch.put(keys::version_key(), keys::encode_u64(version));

        debug!(version, writes = log.len(), "Assembled commit batch");
        Ok((batch, log))
    }

    /// Reads the persisted commit log, oldest first.
    pub fn load_log(&self) -> StorageResult<Vec<LogEntry>> {
        let (lower, upper) = keys::namespace(keys::LOG);
        let mut log = Vec::new();
        for item in self.backend.scan(lower, upper, false) {
            let (raw, key) = item?;
            let (version, _) = keys::decode_log_key(&raw)?;
            log.push(LogEntry { version, key });
        }
        Ok(log)
    }

    /// Deletes up to `limit` of the oldest persisted log entries with a version below `version`.
    pub fn prune_log_below(&self, version: u64, limit: usize) -> StorageResult<usize> {
        let (lower, _) = keys::namespace(keys::LOG);
        let upper = Bound::Excluded(keys::log_key(version, 0));
        let mut batch = WriteBatch::new();
        for item in self.backend.scan(lower, upper, false).take(limit) {
            let (raw, _) = item?;
            batch.delete(raw);
        }
        let pruned = batch.len();
        if !batch.is_empty() {
            self.backend.atomic_write(batch)?;
        }
        Ok(pruned)
    }

    /// Persists an open lease with its open time.
    ///
    /// The record is written once. Heartbeats live only in the in-memory lease, which is what
    /// staleness is judged on; records left by a previous process are purged at open.
    pub fn put_lease(
        &self,
        read_version: u64,
        transaction_id: u128,
        opened_ms: u64,
    ) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            keys::active_key(read_version, transaction_id),
            keys::encode_u64(opened_ms),
        );
        self.backend.atomic_write(batch)?;
        Ok(())
    }

    /// Removes persisted leases.
    pub fn delete_leases(&self, leases: &[(u64, u128)]) -> StorageResult<()> {
        if leases.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for &(read_version, transaction_id) in leases {
            batch.delete(keys::active_key(read_version, transaction_id));
        }
        self.backend.atomic_write(batch)?;
        Ok(())
    }

    /// Drops every persisted lease; returns how many there were.
    pub fn purge_leases(&self) -> StorageResult<usize> {
        let (lower, upper) = keys::namespace(keys::ACTIVE);
        let mut batch = WriteBatch::new();
        for item in self.backend.scan(lower, upper, false) {
            let (raw, _) = item?;
            batch.delete(raw);
        }
        let purged = batch.len();
        if purged > 0 {
            self.backend.atomic_write(batch)?;
        }
        Ok(purged)
    }

    pub fn load_cursor(&self, index: u8) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.backend.get(&keys::gc_cursor_key(index))?)
    }

    /// Persists a GC cursor, or clears it when `position` is `None`.
    pub fn save_cursor(&self, index: u8, position: Option<&[u8]>) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        match position {
            Some(raw) => batch.put(keys::gc_cursor_key(index), raw.to_vec()),
            None => batch.delete(keys::gc_cursor_key(index)),
        }
        self.backend.atomic_write(batch)?;
        Ok(())
    }
}

/// The run of versions seen so far for one logical key.
struct Group {
    key: Vec<u8>,
    /// `Some(None)` is a visible tombstone.
    visible: Option<Option<Vec<u8>>>,
}

impl Group {
    fn into_pair(self) -> Option<(Vec<u8>, Vec<u8>)> {
        match self.visible {
            Some(Some(value)) => Some((self.key, value)),
            _ => None,
        }
    }
}

/// Iterator of the `(key, value)` pairs visible at one version, in scan order.
///
/// Ascending scans see each key's versions oldest-first and keep the last visible one;
/// descending scans see them newest-first and keep the first.
pub struct VersionedScan {
    inner: BackendIter,
    read_version: u64,
    reverse: bool,
    pending: Option<Group>,
    done: bool,
}

impl Iterator for VersionedScan {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (raw, value) = match self.inner.next() {
                None => {
                    self.done = true;
                    return self.pending.take().and_then(Group::into_pair).map(Ok);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                Some(Ok(pair)) => pair,
            };
            let entry = match VersionedKey::decode(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let visible = (entry.version <= self.read_version)
                .then(|| if entry.tombstone { None } else { Some(value) });

            let same_key = self
                .pending
                .as_ref()
                .is_some_and(|group| group.key == entry.key);
            if same_key {
                let reverse = self.reverse;
                if let Some(group) = self.pending.as_mut() {
                    if visible.is_some() && (!reverse || group.visible.is_none()) {
                        group.visible = visible;
                    }
                }
                continue;
            }

            let finished = self.pending.replace(Group {
                key: entry.key,
                visible,
            });
            if let Some(pair) = finished.and_then(Group::into_pair) {
                return Some(Ok(pair));
            }
        }
    }
}
