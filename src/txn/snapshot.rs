//! Read-only snapshots.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::lease::{Lease, LeaseTable};
use crate::storage::{OrderedBackend, StorageError, StorageResult, VersionedScan, VersionedStore};
use crate::txn::Condition;

/// Shared flag that stops in-flight queries between items.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Releases a lease when the snapshot holding it ends.
pub(crate) struct LeaseGuard<'e, B: OrderedBackend> {
    table: &'e LeaseTable,
    store: &'e VersionedStore<B>,
    lease: Arc<Lease>,
}

impl<'e, B: OrderedBackend> LeaseGuard<'e, B> {
    pub(crate) fn new(table: &'e LeaseTable, store: &'e VersionedStore<B>, lease: Arc<Lease>) -> Self {
        Self { table, store, lease }
    }
}

impl<B: OrderedBackend> Drop for LeaseGuard<'_, B> {
    fn drop(&mut self) {
        let id = self.lease.id();
        // An evicted lease was already removed, persisted record included.
        if self.table.close(&id) {
            if let Err(e) = self
                .store
                .delete_leases(&[(id.read_version, id.transaction_id)])
            {
                warn!(read_version = id.read_version, "Failed to remove lease record: {}", e);
            }
        }
    }
}

/// An immutable view of the store at one version.
///
/// Reads never block and never observe commits newer than [`Snapshot::read_version`]. If the
/// garbage collector evicts this snapshot's lease, every later read fails with
/// [`StorageError::TransactionAborted`].
pub struct Snapshot<'e, B: OrderedBackend> {
    store: &'e VersionedStore<B>,
    guard: LeaseGuard<'e, B>,
    operations: Cell<u64>,
}

impl<'e, B: OrderedBackend> Snapshot<'e, B> {
    pub(crate) fn new(store: &'e VersionedStore<B>, guard: LeaseGuard<'e, B>) -> Self {
        Self {
            store,
            guard,
            operations: Cell::new(0),
        }
    }

    pub fn read_version(&self) -> u64 {
        self.guard.lease.read_version()
    }

    pub fn transaction_id(&self) -> u128 {
        self.guard.lease.transaction_id()
    }

    /// Value of `key` at this snapshot's version.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.lease().touch();
        let value = self.store.get(key, self.read_version())?;
        // Checked after the read: eviction precedes reclamation, so a read that finished before
        // the flag was set could not have seen reclaimed data.
        self.ensure_live()?;
        self.count_operation();
        Ok(value)
    }

    /// Lazily scans the keys matching `condition`, ascending for `Gt`/`Gte` and descending for
    /// `Lt`/`Lte`.
    pub fn query(&self, condition: Condition) -> Query<'_> {
        self.lease().touch();
        Query {
            scan: self.store.scan(&condition, self.read_version()),
            lease: self.lease(),
            operations: &self.operations,
            cancel: None,
            done: false,
        }
    }

    pub(crate) fn lease(&self) -> &Lease {
        &self.guard.lease
    }

    pub(crate) fn ensure_live(&self) -> StorageResult<()> {
        ensure_live(self.lease())
    }

    pub(crate) fn count_operation(&self) {
        self.operations.set(self.operations.get() + 1);
    }

    /// Reads and writes performed through this snapshot so far.
    pub(crate) fn operations(&self) -> u64 {
        self.operations.get()
    }
}

pub(crate) fn ensure_live(lease: &Lease) -> StorageResult<()> {
    if lease.is_evicted() {
        return Err(StorageError::TransactionAborted {
            transaction_id: lease.transaction_id(),
            read_version: lease.read_version(),
        });
    }
    Ok(())
}

/// Lazy scan over a [`Snapshot`].
pub struct Query<'s> {
    scan: VersionedScan,
    lease: &'s Lease,
    operations: &'s Cell<u64>,
    cancel: Option<CancelToken>,
    done: bool,
}

impl Query<'_> {
    /// Stops the scan with [`StorageError::Cancelled`] once `token` fires.
    pub fn cancel_on(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }
}

impl Iterator for Query<'_> {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            self.done = true;
            return Some(Err(StorageError::Cancelled));
        }

        let item = match self.scan.next() {
            Some(Ok(pair)) => pair,
            Some(Err(e)) => {
                self.done = true;
                return Some(Err(e));
            }
            None => {
                self.done = true;
                // An evicted scan may have run out only because its versions were reclaimed.
                return ensure_live(self.lease).err().map(Err);
            }
        };
        if let Err(e) = ensure_live(self.lease) {
            self.done = true;
            return Some(Err(e));
        }
        self.lease.touch();
        self.operations.set(self.operations.get() + 1);
        Some(Ok(item))
    }
}
