//! Query conditions and the read ranges a transaction records.

use std::fmt;
use std::ops::Bound;

/// A single-bound scan condition. The bound also fixes the direction: `Gt`/`Gte` scan ascending
/// from the key, `Lt`/`Lte` scan descending from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Gt(Vec<u8>),
    Gte(Vec<u8>),
    Lt(Vec<u8>),
    Lte(Vec<u8>),
}

impl Condition {
    pub fn gt(key: impl Into<Vec<u8>>) -> Self {
        Condition::Gt(key.into())
    }

    pub fn gte(key: impl Into<Vec<u8>>) -> Self {
        Condition::Gte(key.into())
    }

    pub fn lt(key: impl Into<Vec<u8>>) -> Self {
        Condition::Lt(key.into())
    }

    pub fn lte(key: impl Into<Vec<u8>>) -> Self {
        Condition::Lte(key.into())
    }

    /// Descending scans start at the upper bound.
    pub fn is_reverse(&self) -> bool {
        matches!(self, Condition::Lt(_) | Condition::Lte(_))
    }

    /// The bound the scan starts from, as a `std::ops::Bound`.
    pub fn start_bound(&self) -> Bound<Vec<u8>> {
        match self {
            Condition::Gt(k) | Condition::Lt(k) => Bound::Excluded(k.clone()),
            Condition::Gte(k) | Condition::Lte(k) => Bound::Included(k.clone()),
        }
    }

    /// Logical-key range `(lower, upper)` covered by the whole condition.
    pub fn bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        if self.is_reverse() {
            (Bound::Unbounded, self.start_bound())
        } else {
            (self.start_bound(), Bound::Unbounded)
        }
    }
}

/// A span of logical keys a transaction has observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl ReadRange {
    /// The degenerate range recorded by a point read.
    pub fn point(key: &[u8]) -> Self {
        Self {
            lower: Bound::Included(key.to_vec()),
            upper: Bound::Included(key.to_vec()),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let above_lower = match &self.lower {
            Bound::Included(lo) => key >= lo.as_slice(),
            Bound::Excluded(lo) => key > lo.as_slice(),
            Bound::Unbounded => true,
        };
        let below_upper = match &self.upper {
            Bound::Included(hi) => key <= hi.as_slice(),
            Bound::Excluded(hi) => key < hi.as_slice(),
            Bound::Unbounded => true,
        };
        above_lower && below_upper
    }
}

impl fmt::Display for ReadRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Bound::Included(k) => write!(f, "[{}", String::from_utf8_lossy(k))?,
            Bound::Excluded(k) => write!(f, "({}", String::from_utf8_lossy(k))?,
            Bound::Unbounded => write!(f, "(-inf")?,
        }
        match &self.upper {
            Bound::Included(k) => write!(f, ", {}]", String::from_utf8_lossy(k)),
            Bound::Excluded(k) => write!(f, ", {})", String::from_utf8_lossy(k)),
            Bound::Unbounded => write!(f, ", +inf)"),
        }
    }
}

/// Every range a transaction has read, in the order it read them.
#[derive(Clone, Debug, Default)]
pub struct ReadLog {
    ranges: Vec<ReadRange>,
}

impl ReadLog {
    pub fn record_point(&mut self, key: &[u8]) {
        self.ranges.push(ReadRange::point(key));
    }

    /// Opens a scan range that initially covers nothing past its start; returns its slot so the
    /// scan can widen it as it yields keys.
    pub(crate) fn begin_scan(&mut self, condition: &Condition) -> usize {
        let start = condition.start_bound();
        self.ranges.push(ReadRange {
            lower: start.clone(),
            upper: start,
        });
        self.ranges.len() - 1
    }

    /// Extends the far end of scan `slot` to include `key`.
    pub(crate) fn widen_to(&mut self, slot: usize, reverse: bool, key: &[u8]) {
        if let Some(range) = self.ranges.get_mut(slot) {
            let bound = Bound::Included(key.to_vec());
            if reverse {
                range.lower = bound;
            } else {
                range.upper = bound;
            }
        }
    }

    /// Marks scan `slot` as having consumed everything up to the end of the keyspace.
    pub(crate) fn widen_to_end(&mut self, slot: usize, reverse: bool) {
        if let Some(range) = self.ranges.get_mut(slot) {
            if reverse {
                range.lower = Bound::Unbounded;
            } else {
                range.upper = Bound::Unbounded;
            }
        }
    }

    pub fn ranges(&self) -> &[ReadRange] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_respects_inclusivity() {
        let range = ReadRange {
            lower: Bound::Excluded(b"b".to_vec()),
            upper: Bound::Included(b"d".to_vec()),
        };
        assert!(!range.contains(b"b"));
        assert!(range.contains(b"b\x00"));
        assert!(range.contains(b"d"));
        assert!(!range.contains(b"d\x00"));

        let point = ReadRange::point(b"k");
        assert!(point.contains(b"k"));
        assert!(!point.contains(b"k\x00"));
        assert!(!point.contains(b"j"));
    }

    #[test]
    fn test_scan_range_widens_with_consumption() {
        let mut log = ReadLog::default();
        let slot = log.begin_scan(&Condition::gte(b"b".to_vec()));

        // Nothing past the start has been consumed yet.
        assert!(log.ranges()[slot].contains(b"b"));
        assert!(!log.ranges()[slot].contains(b"c"));

        log.widen_to(slot, false, b"e");
        assert!(log.ranges()[slot].contains(b"c"));
        assert!(!log.ranges()[slot].contains(b"f"));

        log.widen_to_end(slot, false);
        assert!(log.ranges()[slot].contains(b"zzz"));
        assert!(!log.ranges()[slot].contains(b"a"));
    }

    #[test]
    fn test_reverse_scan_range() {
        let mut log = ReadLog::default();
        let slot = log.begin_scan(&Condition::lt(b"m".to_vec()));
        assert!(!log.ranges()[slot].contains(b"m"));
        assert!(!log.ranges()[slot].contains(b"l"));

        log.widen_to(slot, true, b"c");
        assert!(log.ranges()[slot].contains(b"l"));
        assert!(log.ranges()[slot].contains(b"c"));
        assert!(!log.ranges()[slot].contains(b"b"));
        assert!(!log.ranges()[slot].contains(b"m"));
    }

    #[test]
    fn test_condition_bounds() {
        assert_eq!(
            Condition::gt(b"a".to_vec()).bounds(),
            (Bound::Excluded(b"a".to_vec()), Bound::Unbounded)
        );
        assert_eq!(
            Condition::lte(b"a".to_vec()).bounds(),
            (Bound::Unbounded, Bound::Included(b"a".to_vec()))
        );
        assert!(Condition::lt(b"a".to_vec()).is_reverse());
        assert!(!Condition::gte(b"a".to_vec()).is_reverse());
    }
}
