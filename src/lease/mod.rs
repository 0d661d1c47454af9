//! Lease table for open snapshots and transactions.
//!
//! Every snapshot holds a lease for as long as it is open. The oldest leased read version bounds
//! what garbage collection may reclaim, so the table also decides when a lease has been abandoned:
//!
//! - Leases are keyed by `(read_version, transaction_id)`, so the oldest is always the first entry
//! - Each read or write refreshes the lease's heartbeat without taking the table lock
//! - A lease that is both idle too long and too many versions behind is evicted; the holder finds
//!   out through its evicted flag on its next operation

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of a lease, ordered by read version first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId {
    pub read_version: u64,
    pub transaction_id: u128,
}

/// Staleness thresholds; a lease must exceed both to be evicted.
#[derive(Clone, Copy, Debug)]
pub struct Staleness {
    pub max_idle: Duration,
    pub max_version_lag: u64,
}

/// A registered snapshot.
#[derive(Debug)]
pub struct Lease {
    id: LeaseId,
    epoch: Instant,
    /// Microseconds since `epoch` of the last operation.
    heartbeat_us: AtomicU64,
    evicted: AtomicBool,
}

impl Lease {
    fn new(id: LeaseId, epoch: Instant) -> Self {
        let now = Instant::now();
        Self {
            id,
            epoch,
            heartbeat_us: AtomicU64::new(micros_since(epoch, now)),
            evicted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn read_version(&self) -> u64 {
        self.id.read_version
    }

    pub fn transaction_id(&self) -> u128 {
        self.id.transaction_id
    }

    /// Records activity.
    pub fn touch(&self) {
        self.heartbeat_us
            .store(micros_since(self.epoch, Instant::now()), Ordering::Relaxed);
    }

    /// Time between the last heartbeat and `now`.
    pub fn idle(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_micros(self.heartbeat_us.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub fn is_stale(&self, now: Instant, current_version: u64, limits: Staleness) -> bool {
        let lag = current_version.saturating_sub(self.id.read_version);
        self.idle(now) > limits.max_idle && lag > limits.max_version_lag
    }
}

fn micros_since(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_micros()).unwrap_or(u64::MAX)
}

/// Outcome of [`LeaseTable::sweep`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseSweep {
    pub evicted: Vec<LeaseId>,
    /// Oldest read version among the leases that survived, or the current version if none did.
    pub oldest_read_version: u64,
}

/// Registry of open leases.
pub struct LeaseTable {
    leases: RwLock<BTreeMap<LeaseId, Arc<Lease>>>,
    epoch: Instant,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(BTreeMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Registers a lease at the version returned by `read_version`.
    ///
    /// The version is read while the table is write-locked, so a concurrent sweep either sees the
    /// new lease or finished computing its oldest version before this version was read.
    pub fn open(&self, transaction_id: u128, read_version: impl FnOnce() -> u64) -> Arc<Lease> {
        let mut leases = self.leases.write();
        let id = LeaseId {
            read_version: read_version(),
            transaction_id,
        };
        let lease = Arc::new(Lease::new(id, self.epoch));
        leases.insert(id, lease.clone());

        debug!(
            read_version = id.read_version,
            transaction_id,
            "Lease opened"
        );
        lease
    }

    /// Removes a lease; false if it was already gone (closed or evicted).
    pub fn close(&self, id: &LeaseId) -> bool {
        let removed = self.leases.write().remove(id).is_some();
        if removed {
            debug!(read_version = id.read_version, "Lease closed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.leases.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.read().is_empty()
    }

    /// Oldest read version still leased, or `current_version` when nothing is open.
    pub fn oldest_read_version(&self, current_version: u64) -> u64 {
        self.leases
            .read()
            .keys()
            .next()
            .map_or(current_version, |id| id.read_version.min(current_version))
    }

    /// Counts leases the next sweep would evict.
    pub fn count_stale(&self, now: Instant, current_version: u64, limits: Staleness) -> usize {
        self.leases
            .read()
            .values()
            .filter(|lease| lease.is_stale(now, current_version, limits))
            .count()
    }

    /// Evicts stale leases and returns the oldest version the survivors still need.
    pub fn sweep(&self, now: Instant, current_version: u64, limits: Staleness) -> LeaseSweep {
        let mut leases = self.leases.write();

        let stale: Vec<LeaseId> = leases
            .values()
            .filter(|lease| lease.is_stale(now, current_version, limits))
            .map(|lease| lease.id)
            .collect();

        for id in &stale {
            if let Some(lease) = leases.remove(id) {
                lease.evicted.store(true, Ordering::SeqCst);
                warn!(
                    read_version = id.read_version,
                    lag = current_version.saturating_sub(id.read_version),
                    idle_ms = lease.idle(now).as_millis() as u64,
                    "Evicted stale lease"
                );
            }
        }

        let oldest_read_version = leases
            .keys()
            .next()
            .map_or(current_version, |id| id.read_version.min(current_version));

        LeaseSweep {
            evicted: stale,
            oldest_read_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Staleness = Staleness {
        max_idle: Duration::from_secs(10),
        max_version_lag: 5,
    };

    fn later(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_open_close() {
        let table = LeaseTable::new();
        let lease = table.open(1, || 7);
        assert_eq!(lease.read_version(), 7);
        assert_eq!(table.len(), 1);

        assert!(table.close(&lease.id()));
        assert!(!table.close(&lease.id()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_oldest_read_version() {
        let table = LeaseTable::new();
        assert_eq!(table.oldest_read_version(10), 10);

        let a = table.open(1, || 4);
        let _b = table.open(2, || 9);
        assert_eq!(table.oldest_read_version(10), 4);

        table.close(&a.id());
        assert_eq!(table.oldest_read_version(10), 9);
    }

    #[test]
    fn test_stale_needs_both_idle_and_lag() {
        let table = LeaseTable::new();
        let lagging = table.open(1, || 1);
        let recent = table.open(2, || 18);

        // Idle but within the version lag: kept.
        assert!(!recent.is_stale(later(60), 20, LIMITS));
        // Lagging but recently active: kept.
        assert!(!lagging.is_stale(Instant::now(), 20, LIMITS));
        assert!(lagging.is_stale(later(60), 20, LIMITS));
        assert_eq!(table.count_stale(later(60), 20, LIMITS), 1);
    }

    #[test]
    fn test_sweep_evicts_and_flags() {
        let table = LeaseTable::new();
        let lagging = table.open(1, || 1);
        let recent = table.open(2, || 18);

        let sweep = table.sweep(later(60), 20, LIMITS);
        assert_eq!(sweep.evicted, vec![lagging.id()]);
        assert_eq!(sweep.oldest_read_version, 18);
        assert!(lagging.is_evicted());
        assert!(!recent.is_evicted());

        // The holder closing afterwards is harmless.
        assert!(!table.close(&lagging.id()));
    }

    #[test]
    fn test_touch_resets_idle() {
        let table = LeaseTable::new();
        let lease = table.open(1, || 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(lease.idle(Instant::now()) >= Duration::from_millis(5));
        lease.touch();
        assert!(lease.idle(Instant::now()) < Duration::from_millis(5));
    }

    #[test]
    fn test_sweep_without_leases_reports_current_version() {
        let table = LeaseTable::new();
        let sweep = table.sweep(Instant::now(), 42, LIMITS);
        assert!(sweep.evicted.is_empty());
        assert_eq!(sweep.oldest_read_version, 42);
    }
}
