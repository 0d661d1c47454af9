//! Read-write transactions.
//!
//! A transaction is a [`Snapshot`] plus two private logs: the buffered writes it will commit and
//! the ranges it has read. Reads see the buffered writes layered over the snapshot; writes stay
//! invisible to everyone else until the commit coordinator applies them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;

use crate::lease::Lease;
use crate::storage::{OrderedBackend, StorageError, StorageResult};
use crate::txn::range::{Condition, ReadLog, ReadRange};
use crate::txn::snapshot::{ensure_live, CancelToken, Query, Snapshot};

/// A buffered mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Put(Vec<u8>),
    Delete,
}

impl Write {
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Write::Put(value) => Some(value),
            Write::Delete => None,
        }
    }
}

/// Pending writes, one per key; the last write to a key wins.
pub type WriteSet = BTreeMap<Vec<u8>, Write>;

/// A snapshot with buffered writes and read tracking.
pub struct Transaction<'e, B: OrderedBackend> {
    snapshot: Snapshot<'e, B>,
    writes: WriteSet,
    reads: ReadLog,
}

impl<'e, B: OrderedBackend> Transaction<'e, B> {
    pub(crate) fn new(snapshot: Snapshot<'e, B>) -> Self {
        Self {
            snapshot,
            writes: WriteSet::new(),
            reads: ReadLog::default(),
        }
    }

    pub fn read_version(&self) -> u64 {
        self.snapshot.read_version()
    }

    pub fn transaction_id(&self) -> u128 {
        self.snapshot.transaction_id()
    }

    /// Reads `key`, preferring this transaction's own pending write.
    ///
    /// A key answered from the write set does not depend on other transactions, so only reads
    /// that reach the snapshot are recorded.
    pub fn get(&mut self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(write) = self.writes.get(key) {
            self.snapshot.ensure_live()?;
            self.snapshot.lease().touch();
            self.snapshot.count_operation();
            return Ok(write.value().map(<[u8]>::to_vec));
        }
        let value = self.snapshot.get(key)?;
        self.reads.record_point(key);
        Ok(value)
    }

    /// Scans `condition` over the snapshot merged with pending writes.
    ///
    /// Only the part of the range actually consumed is recorded as read: the recorded range grows
    /// to each yielded key and reaches the end of the keyspace only once the scan is exhausted.
    /// Callers that stop early and act on what they have not seen get no conflict protection for
    /// the unread tail.
    pub fn query(&mut self, condition: Condition) -> TxnQuery<'_> {
        let Transaction {
            snapshot,
            writes,
            reads,
        } = self;
        let snapshot: &Snapshot<'e, B> = snapshot;

        let reverse = condition.is_reverse();
        let local: Box<dyn Iterator<Item = (&Vec<u8>, &Write)> + '_> = if reverse {
            Box::new(writes.range(condition.bounds()).rev())
        } else {
            Box::new(writes.range(condition.bounds()))
        };

        TxnQuery {
            snapshot: snapshot.query(condition.clone()).peekable(),
            local: local.peekable(),
            lease: snapshot.lease(),
            reads,
            condition,
            reverse,
            slot: None,
            cancel: None,
            done: false,
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> StorageResult<()> {
        self.buffer(key.into(), Write::Put(value.into()))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> StorageResult<()> {
        self.buffer(key.into(), Write::Delete)
    }

    fn buffer(&mut self, key: Vec<u8>, write: Write) -> StorageResult<()> {
        self.snapshot.ensure_live()?;
        self.snapshot.lease().touch();
        self.snapshot.count_operation();
        self.writes.insert(key, write);
        Ok(())
    }

    /// Ranges recorded so far.
    pub fn read_ranges(&self) -> &[ReadRange] {
        self.reads.ranges()
    }

    pub fn pending_writes(&self) -> &WriteSet {
        &self.writes
    }

    pub(crate) fn snapshot(&self) -> &Snapshot<'e, B> {
        &self.snapshot
    }
}

enum Step {
    Snapshot,
    Local,
    Both,
    Failed,
    Exhausted,
}

/// Merge of a snapshot scan and the write set, in scan order.
pub struct TxnQuery<'t> {
    snapshot: Peekable<Query<'t>>,
    local: Peekable<Box<dyn Iterator<Item = (&'t Vec<u8>, &'t Write)> + 't>>,
    lease: &'t Lease,
    reads: &'t mut ReadLog,
    condition: Condition,
    reverse: bool,
    slot: Option<usize>,
    cancel: Option<CancelToken>,
    done: bool,
}

impl TxnQuery<'_> {
    /// Stops the scan with [`StorageError::Cancelled`] once `token` fires. Nothing past the last
    /// yielded key is recorded as read.
    pub fn cancel_on(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    fn slot(&mut self) -> usize {
        match self.slot {
            Some(slot) => slot,
            None => {
                let slot = self.reads.begin_scan(&self.condition);
                self.slot = Some(slot);
                slot
            }
        }
    }

    fn step(&mut self) -> Step {
        match (self.snapshot.peek(), self.local.peek()) {
            (Some(Err(_)), _) => Step::Failed,
            (None, None) => Step::Exhausted,
            (Some(Ok(_)), None) => Step::Snapshot,
            (None, Some(_)) => Step::Local,
            (Some(Ok((snap_key, _))), Some((local_key, _))) => {
                let order = snap_key.as_slice().cmp(local_key.as_slice());
                let order = if self.reverse { order.reverse() } else { order };
                match order {
                    Ordering::Less => Step::Snapshot,
                    Ordering::Greater => Step::Local,
                    Ordering::Equal => Step::Both,
                }
            }
        }
    }
}

impl Iterator for TxnQuery<'_> {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                self.done = true;
                return Some(Err(StorageError::Cancelled));
            }

            let pair = match self.step() {
                Step::Failed => {
                    self.done = true;
                    return self.snapshot.next();
                }
                Step::Exhausted => {
                    self.done = true;
                    if let Err(e) = ensure_live(self.lease) {
                        return Some(Err(e));
                    }
                    let slot = self.slot();
                    self.reads.widen_to_end(slot, self.reverse);
                    return None;
                }
                Step::Snapshot => match self.snapshot.next() {
                    Some(Ok(pair)) => pair,
                    other => {
                        self.done = true;
                        return other;
                    }
                },
                step @ (Step::Local | Step::Both) => {
                    // Evicted transactions fail even on their own pending writes.
                    if let Err(e) = ensure_live(self.lease) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    if matches!(step, Step::Both) {
                        // Shadowed by the pending write.
                        self.snapshot.next();
                    }
                    match self.local.next() {
                        Some((key, Write::Put(value))) => (key.clone(), value.clone()),
                        _ => continue,
                    }
                }
            };

            let slot = self.slot();
            self.reads.widen_to(slot, self.reverse, &pair.0);
            return Some(Ok(pair));
        }
    }
}
