//! Physical key layout.
//!
//! Every record the engine persists lives in one ordered keyspace. The first byte selects a
//! namespace:
//!
//! | tag | namespace | key                                              | value                 |
//! |-----|-----------|--------------------------------------------------|-----------------------|
//! | `d` | data      | `escape(key) 00 00` · version (BE u64) · flag    | value bytes           |
//! | `v` | version   | (single key)                                     | current version (BE)  |
//! | `l` | log       | version (BE u64) · write index (BE u32)          | logical key           |
//! | `a` | active    | read version (BE u64) · transaction id (BE u128) | opened at, unix ms    |
//! | `g` | gc        | cursor index (u8)                                | last data key swept   |
//!
//! Logical keys are escaped (`00` becomes `00 FF`) and terminated by `00 00`, so data keys sort by
//! logical key first and version second, and no logical key's entries interleave with another's.

use std::ops::Bound;

use crate::storage::{StorageError, StorageResult};

pub(crate) const DATA: u8 = b'd';
pub(crate) const VERSION: u8 = b'v';
pub(crate) const LOG: u8 = b'l';
pub(crate) const ACTIVE: u8 = b'a';
pub(crate) const GC_CURSOR: u8 = b'g';

const FLAG_VALUE: u8 = 0;
const FLAG_TOMBSTONE: u8 = 1;

/// Bytes trailing the escaped logical key: version plus flag.
const SUFFIX_LEN: usize = 9;

/// A logical key at one version, as stored in the data namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedKey {
    pub key: Vec<u8>,
    pub version: u64,
    pub tombstone: bool,
}

impl VersionedKey {
    pub fn new(key: impl Into<Vec<u8>>, version: u64, tombstone: bool) -> Self {
        Self {
            key: key.into(),
            version,
            tombstone,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = key_prefix(&self.key);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.push(if self.tombstone {
            FLAG_TOMBSTONE
        } else {
            FLAG_VALUE
        });
        out
    }

    pub fn decode(raw: &[u8]) -> StorageResult<Self> {
        if raw.first() != Some(&DATA) || raw.len() < 1 + 2 + SUFFIX_LEN {
            return Err(corrupt("data key too short or wrong namespace", raw));
        }
        let (body, suffix) = raw[1..].split_at(raw.len() - 1 - SUFFIX_LEN);
        let key = unescape(body).ok_or_else(|| corrupt("bad key escaping", raw))?;

        let version = u64::from_be_bytes(
            suffix[..8]
                .try_into()
                .map_err(|_| corrupt("bad version", raw))?,
        );
        let tombstone = match suffix[8] {
            FLAG_VALUE => false,
            FLAG_TOMBSTONE => true,
            _ => return Err(corrupt("bad tombstone flag", raw)),
        };

        Ok(Self {
            key,
            version,
            tombstone,
        })
    }
}

/// `d · escape(key) · 00 00`: the shared prefix of every version of `key`.
pub(crate) fn key_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 3 + SUFFIX_LEN);
    out.push(DATA);
    for &b in key {
        out.push(b);
        if b == 0 {
            out.push(0xff);
        }
    }
    out.extend_from_slice(&[0, 0]);
    out
}

/// Sorts after every version of `key` and before every greater logical key.
pub(crate) fn key_upper(key: &[u8]) -> Vec<u8> {
    let mut out = key_prefix(key);
    out.extend_from_slice(&[0xff; SUFFIX_LEN]);
    out
}

/// Range covering every version of exactly `key`.
pub(crate) fn key_versions(key: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    (
        Bound::Included(key_prefix(key)),
        Bound::Included(key_upper(key)),
    )
}

fn unescape(body: &[u8]) -> Option<Vec<u8>> {
    let (body, terminator) = body.split_at(body.len().checked_sub(2)?);
    if terminator != [0, 0] {
        return None;
    }
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter();
    while let Some(&b) = iter.next() {
        out.push(b);
        if b == 0 && iter.next() != Some(&0xff) {
            return None;
        }
    }
    Some(out)
}

/// Whole-namespace bounds for `tag`.
pub(crate) fn namespace(tag: u8) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    (Bound::Included(vec![tag]), Bound::Excluded(vec![tag + 1]))
}

pub(crate) fn version_key() -> Vec<u8> {
    vec![VERSION]
}

pub(crate) fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub(crate) fn decode_u64(raw: &[u8]) -> StorageResult<u64> {
    raw.try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| corrupt("expected 8 byte integer", raw))
}

pub(crate) fn log_key(version: u64, write_index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(LOG);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&write_index.to_be_bytes());
    out
}

/// First log key with a version strictly greater than `version`.
pub(crate) fn log_after(version: u64) -> Bound<Vec<u8>> {
    match version.checked_add(1) {
        Some(next) => Bound::Included(log_key(next, 0)),
        None => Bound::Excluded(vec![LOG + 1]),
    }
}

pub(crate) fn decode_log_key(raw: &[u8]) -> StorageResult<(u64, u32)> {
    if raw.len() != 13 || raw[0] != LOG {
        return Err(corrupt("bad log key", raw));
    }
    let version = decode_u64(&raw[1..9])?;
    let index = u32::from_be_bytes(
        raw[9..13]
            .try_into()
            .map_err(|_| corrupt("bad log index", raw))?,
    );
    Ok((version, index))
}

pub(crate) fn active_key(read_version: u64, transaction_id: u128) -> Vec<u8> {
    let mut out = Vec::with_capacity(25);
    out.push(ACTIVE);
    out.extend_from_slice(&read_version.to_be_bytes());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out
}

pub(crate) fn gc_cursor_key(index: u8) -> Vec<u8> {
    vec![GC_CURSOR, index]
}

fn corrupt(what: &str, raw: &[u8]) -> StorageError {
    StorageError::Corrupt(format!("{}: {:02x?}", what, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_key_round_trip() {
        let cases = [
            VersionedKey::new(Vec::new(), 0, false),
            VersionedKey::new(vec![0], 1, true),
            VersionedKey::new(vec![0, 0, 0xff, 0], u64::MAX, false),
            VersionedKey::new(b"plain".to_vec(), 42, true),
            VersionedKey::new(vec![0xff, 0xff], 7, false),
        ];
        for case in cases {
            assert_eq!(VersionedKey::decode(&case.encode()).unwrap(), case);
        }
    }

    #[test]
    fn test_ordering_is_key_then_version() {
        let mut encoded = vec![
            VersionedKey::new(b"b".to_vec(), 1, false).encode(),
            VersionedKey::new(b"a".to_vec(), 9, false).encode(),
            VersionedKey::new(b"a\x00".to_vec(), 1, false).encode(),
            VersionedKey::new(b"a".to_vec(), 2, true).encode(),
            VersionedKey::new(Vec::new(), 5, false).encode(),
        ];
        encoded.sort();
        let decoded: Vec<(Vec<u8>, u64)> = encoded
            .iter()
            .map(|raw| {
                let vk = VersionedKey::decode(raw).unwrap();
                (vk.key, vk.version)
            })
            .collect();
        assert_eq!(
            decoded,
            vec![
                (Vec::new(), 5),
                (b"a".to_vec(), 2),
                (b"a".to_vec(), 9),
                (b"a\x00".to_vec(), 1),
                (b"b".to_vec(), 1),
            ]
        );
    }

    #[test]
    fn test_key_bounds_bracket_all_versions() {
        let key = b"k\x00y".to_vec();
        let lowest = VersionedKey::new(key.clone(), 0, false).encode();
        let highest = VersionedKey::new(key.clone(), u64::MAX, true).encode();
        assert!(key_prefix(&key) <= lowest);
        assert!(highest < key_upper(&key));

        let next = VersionedKey::new(b"k\x00y\x00".to_vec(), 0, false).encode();
        assert!(key_upper(&key) < next);
        let next = VersionedKey::new(b"k\x01".to_vec(), 0, false).encode();
        assert!(key_upper(&key) < next);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(VersionedKey::decode(b"").is_err());
        assert!(VersionedKey::decode(&log_key(1, 0)).is_err());

        let mut raw = VersionedKey::new(b"x".to_vec(), 3, false).encode();
        *raw.last_mut().unwrap() = 7;
        assert!(matches!(
            VersionedKey::decode(&raw),
            Err(StorageError::Corrupt(_))
        ));

        // Unescaped zero inside the logical key.
        let mut raw = vec![DATA, b'x', 0, b'y', 0, 0];
        raw.extend_from_slice(&[0; SUFFIX_LEN]);
        assert!(VersionedKey::decode(&raw).is_err());
    }

    #[test]
    fn test_log_keys() {
        let raw = log_key(17, 3);
        assert_eq!(decode_log_key(&raw).unwrap(), (17, 3));
        assert!(log_key(17, u32::MAX) < log_key(18, 0));
        assert_eq!(log_after(16), Bound::Included(log_key(17, 0)));
    }
}
