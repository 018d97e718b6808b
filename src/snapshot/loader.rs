//! Snapshot parser.
//!
//! Lengths in this subset are single bytes and the only value type is a plain
//! string (0x00). Entries are inserted as soon as they are parsed.

use crate::snapshot::SnapshotError;
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

mod opcode {
    pub const SELECT_DB: u8 = 0xFE;
    pub const EXPIRE_MS: u8 = 0xFC;
    pub const EXPIRE_SECS: u8 = 0xFD;
    pub const END: u8 = 0xFF;
    pub const STRING: u8 = 0x00;
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Entries whose deadline had already passed
    pub skipped_expired: usize,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(SnapshotError::Truncated { offset: self.buf.len() });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u64_le(&mut self) -> Result<u64, SnapshotError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn u32_le(&mut self) -> Result<u32, SnapshotError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    /// One length byte followed by that many bytes.
    fn string(&mut self) -> Result<Bytes, SnapshotError> {
        let len = self.byte()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

fn now_millis() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i128)
        .unwrap_or(0)
}

/// Parses `data` and inserts its entries into `store`.
///
/// On error the entries parsed so far remain in the store.
pub fn load(data: &[u8], store: &StorageEngine) -> Result<LoadReport, SnapshotError> {
    let start = data
        .iter()
        .position(|&b| b == opcode::SELECT_DB)
        .ok_or(SnapshotError::MissingDatabase)?;

    let mut cursor = Cursor { buf: data, pos: start + 1 };
    let db = cursor.byte()?;
    let _reserved = cursor.byte()?;
    let hash_hint = cursor.byte()?;
    let expire_hint = cursor.byte()?;
    debug!(db, hash_hint, expire_hint, "Snapshot database section");

    let mut report = LoadReport::default();
    let mut terminated = false;
    let now = now_millis();

    while let Some(op) = cursor.peek() {
        if op == opcode::END {
            terminated = true;
            break;
        }

        let deadline_ms = match op {
            opcode::EXPIRE_MS => {
                cursor.pos += 1;
                Some(cursor.u64_le()? as i128)
            }
            opcode::EXPIRE_SECS => {
                cursor.pos += 1;
                Some(cursor.u32_le()? as i128 * 1000)
            }
            _ => None,
        };

        let type_offset = cursor.pos;
        let value_type = cursor.byte()?;
        if value_type != opcode::STRING {
            return Err(SnapshotError::UnsupportedValueType {
                offset: type_offset,
                value_type,
            });
        }

        let key = cursor.string()?;
        let value = cursor.string()?;

        match deadline_ms {
            Some(deadline) => {
                let ttl = deadline - now;
                if ttl <= 0 {
                    report.skipped_expired += 1;
                    continue;
                }
                store.set(key, value, Some(Duration::from_millis(ttl as u64)));
            }
            None => {
                store.set(key, value, None);
            }
        }
        report.loaded += 1;
    }

    if !terminated {
        debug!("Snapshot ended without an end marker");
    }

    Ok(report)
}

/// Reads and loads the snapshot at `path`.
///
/// Returns the raw file bytes so they can be served to replicas, or `None`
/// if the file does not exist. Parse errors are logged and leave a partial
/// store; only I/O errors other than "not found" are returned.
pub fn load_file(path: &Path, store: &StorageEngine) -> Result<Option<Bytes>, SnapshotError> {
    let data = match std::fs::read(path) {
        Ok(data) => Bytes::from(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No snapshot file, starting empty");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    match load(&data, store) {
        Ok(report) => info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped_expired = report.skipped_expired,
            "Snapshot loaded"
        ),
        Err(SnapshotError::MissingDatabase) => {
            info!(path = %path.display(), "Snapshot has no database section")
        }
        Err(e) => warn!(
            path = %path.display(),
            error = %e,
            keys = store.len(),
            "Snapshot partially loaded"
        ),
    }

    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EMPTY_SNAPSHOT;

    const HEADER: &[u8] = b"REDIS0011\xfa\x09redis-ver\x057.2.0";

    fn section(entries: &[u8]) -> Vec<u8> {
        let mut buf = HEADER.to_vec();
        buf.extend_from_slice(&[0xFE, 0x00, 0x00, 0x03, 0x01]);
        buf.extend_from_slice(entries);
        buf
    }

    fn plain(key: &str, value: &str) -> Vec<u8> {
        let mut buf = vec![0x00, key.len() as u8];
        buf.extend_from_slice(key.as_bytes());
        buf.push(value.len() as u8);
        buf.extend_from_slice(value.as_bytes());
        buf
    }

    fn with_ms_expiry(deadline_ms: u64, key: &str, value: &str) -> Vec<u8> {
        let mut buf = vec![0xFC];
        buf.extend_from_slice(&deadline_ms.to_le_bytes());
        buf.extend(plain(key, value));
        buf
    }

    fn now_ms() -> u64 {
        now_millis() as u64
    }

    #[test]
    fn test_load_plain_entries() {
        let store = StorageEngine::new();
        let mut entries = plain("foo", "bar");
        entries.extend(plain("baz", "qux"));
        entries.push(0xFF);
        entries.extend_from_slice(&[0u8; 8]);

        let report = load(&section(&entries), &store).unwrap();
        assert_eq!(report, LoadReport { loaded: 2, skipped_expired: 0 });
        assert_eq!(store.get(&Bytes::from("foo")), Some(Bytes::from("bar")));
        assert_eq!(
            store.keys("*").unwrap(),
            vec![Bytes::from("foo"), Bytes::from("baz")]
        );
    }

    #[test]
    fn test_expired_entries_are_not_inserted() {
        let store = StorageEngine::new();
        let mut entries = with_ms_expiry(now_ms() - 10_000, "old", "gone");
        entries.extend(with_ms_expiry(now_ms() + 60_000, "fresh", "here"));
        entries.push(0xFF);

        let report = load(&section(&entries), &store).unwrap();
        assert_eq!(report, LoadReport { loaded: 1, skipped_expired: 1 });
        assert_eq!(store.get(&Bytes::from("old")), None);
        assert_eq!(store.get(&Bytes::from("fresh")), Some(Bytes::from("here")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_seconds_expiry() {
        let store = StorageEngine::new();
        let deadline = (now_ms() / 1000 + 120) as u32;
        let mut entries = vec![0xFD];
        entries.extend_from_slice(&deadline.to_le_bytes());
        entries.extend(plain("k", "v"));
        entries.push(0xFF);

        assert_eq!(load(&section(&entries), &store).unwrap().loaded, 1);
        assert_eq!(store.get(&Bytes::from("k")), Some(Bytes::from("v")));
    }

    #[test]
    fn test_missing_database_section() {
        let store = StorageEngine::new();
        assert!(matches!(
            load(HEADER, &store),
            Err(SnapshotError::MissingDatabase)
        ));
    }

    #[test]
    fn test_empty_snapshot_loads_nothing() {
        let store = StorageEngine::new();
        let report = load(EMPTY_SNAPSHOT, &store).unwrap();
        assert_eq!(report.loaded, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_truncated_keeps_earlier_entries() {
        let store = StorageEngine::new();
        let mut entries = plain("first", "1");
        entries.extend_from_slice(&[0x00, 0x05, b's', b'e']);

        let err = load(&section(&entries), &store).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated { .. }));
        assert_eq!(store.get(&Bytes::from("first")), Some(Bytes::from("1")));
    }

    #[test]
    fn test_unsupported_value_type() {
        let store = StorageEngine::new();
        let mut entries = plain("a", "1");
        entries.extend_from_slice(&[0x02, 0x01, b'l', 0x00]);
        let data = section(&entries);
        let type_offset = data.len() - 4;

        match load(&data, &store) {
            Err(SnapshotError::UnsupportedValueType { offset, value_type }) => {
                assert_eq!(offset, type_offset);
                assert_eq!(value_type, 0x02);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_file_missing_is_not_an_error() {
        let store = StorageEngine::new();
        let path = std::env::temp_dir().join("relaykv-does-not-exist.rdb");
        assert!(load_file(&path, &store).unwrap().is_none());
    }

    #[test]
    fn test_load_file_returns_raw_bytes() {
        let store = StorageEngine::new();
        let mut entries = plain("disk", "value");
        entries.push(0xFF);
        let data = section(&entries);

        let path = std::env::temp_dir().join(format!("relaykv-load-{}.rdb", std::process::id()));
        std::fs::write(&path, &data).unwrap();

        let raw = load_file(&path, &store).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(raw.as_deref(), Some(&data[..]));
        assert_eq!(store.get(&Bytes::from("disk")), Some(Bytes::from("value")));
    }
}
