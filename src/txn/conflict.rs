//! Serializability check run by the commit coordinator.
//!
//! A transaction reading at version `V` is serializable iff nothing committed after `V` wrote a
//! key inside any range it read. Every match is collected so the error names all of them.

use std::fmt;

use crate::storage::LogEntry;
use crate::txn::range::ReadRange;

/// One read range invalidated by one later write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub range: ReadRange,
    pub key: Vec<u8>,
    pub version: u64,
}

/// A commit was rejected because its reads overlap newer commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictError {
    pub read_version: u64,
    pub conflicts: Vec<Conflict>,
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Serialization conflict for reads at version {}:",
            self.read_version
        )?;
        for (i, c) in self.conflicts.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(
                f,
                "{}range {} saw key '{}' rewritten at version {}",
                sep,
                c.range,
                String::from_utf8_lossy(&c.key),
                c.version
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ConflictError {}

/// Checks `reads` against every log entry newer than `read_version`.
///
/// Entries at or below `read_version` are skipped, so callers may pass the whole log tail.
pub fn ensure_serializable<'a>(
    read_version: u64,
    reads: &[ReadRange],
    log: impl IntoIterator<Item = &'a LogEntry>,
) -> Result<(), ConflictError> {
    if reads.is_empty() {
        return Ok(());
    }

    let mut conflicts = Vec::new();
    for entry in log {
        if entry.version <= read_version {
            continue;
        }
        for range in reads {
            if range.contains(&entry.key) {
                conflicts.push(Conflict {
                    range: range.clone(),
                    key: entry.key.clone(),
                    version: entry.version,
                });
            }
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(ConflictError {
            read_version,
            conflicts,
        })
    }
}
