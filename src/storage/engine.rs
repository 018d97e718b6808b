//! Thread-Safe Storage Engine with Expiry Support
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: Instead of one big lock, keys are spread over 64 shards.
//! 2. **Lazy Expiry**: Every read checks the entry's deadline; an expired entry
//!    is removed on the spot and reported absent. The background sweeper only
//!    reclaims memory sooner.
//! 3. **Insertion Order**: Each entry carries a sequence number taken when the
//!    key was first inserted; enumeration sorts by it.
//! 4. **Reserved Keys**: Replication metadata lives next to user data but is
//!    hidden from `KEYS`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐            │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │            │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │            │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │            │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// Reserved key holding the replication id.
pub const REPLICATION_ID_KEY: &[u8] = b"replication-id";

/// Reserved key holding the replication offset (decimal).
pub const REPLICATION_OFFSET_KEY: &[u8] = b"replication-offset";

/// Returns true for keys that hold process metadata rather than user data.
#[inline]
pub fn is_reserved(key: &[u8]) -> bool {
    key == REPLICATION_ID_KEY || key == REPLICATION_OFFSET_KEY
}

/// Errors returned by storage operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    /// KEYS only understands `*`
    #[error("pattern '{0}' is not supported, only '*' is")]
    UnsupportedPattern(String),

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("increment or decrement would overflow")]
    Overflow,
}

/// Represents a stored value with optional expiry time.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// Insertion sequence number, kept across overwrites of a live key
    pub seq: u64,
}

impl Entry {
    fn new(value: Bytes, ttl: Option<Duration>, seq: u64) -> Self {
        Self {
            value,
            // A deadline past what `Instant` can hold never arrives.
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            seq,
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

/// The key-value store shared by every connection and the replication link.
///
/// # Example
///
/// ```
/// use relaykv::storage::StorageEngine;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
///
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"), None);
/// assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("Ariz")));
///
/// engine.set(Bytes::from("session"), Bytes::from("abc123"), Some(Duration::from_secs(60)));
/// assert_eq!(engine.keys("*").unwrap(), vec![Bytes::from("name"), Bytes::from("session")]);
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,

    /// Approximate number of stored entries (reserved keys included)
    key_count: AtomicU64,

    /// Source of insertion sequence numbers
    next_seq: AtomicU64,

    /// Number of expired entries removed, lazily or by the sweeper
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .field("expired_count", &self.expired_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            key_count: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Sets a key, replacing any previous value and expiry.
    ///
    /// `ttl = None` clears an existing expiry. Overwriting a live key keeps its
    /// position in `KEYS` order; overwriting an expired one counts as a new key.
    ///
    /// # Returns
    ///
    /// Returns `true` if a new key was created, `false` if an existing key was updated.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> bool {
        let shard = self.get_shard(&key);
        let mut data = shard.data.write().unwrap();

        let (is_new, seq) = match data.get(&key) {
            Some(existing) if !existing.is_expired() => (false, existing.seq),
            Some(_) => {
                // Replacing an expired entry: same slot, fresh identity.
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                (false, self.next_seq.fetch_add(1, Ordering::Relaxed))
            }
            None => (true, self.next_seq.fetch_add(1, Ordering::Relaxed)),
        };

        data.insert(key, Entry::new(value, ttl, seq));

        if is_new {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        is_new
    }

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    /// Expired keys are detected and removed here regardless of the sweeper.
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        let shard = self.get_shard(key);

        {
            let data = shard.data.read().unwrap();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired - need the write lock to remove it
        let mut data = shard.data.write().unwrap();
        if let Some(entry) = data.get(key) {
            if entry.is_expired() {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            // Race: another writer replaced the key between the two locks
            return Some(entry.value.clone());
        }

        None
    }

    /// Returns all live, non-reserved keys in insertion order.
    ///
    /// Only the pattern `*` is supported.
    pub fn keys(&self, pattern: &str) -> Result<Vec<Bytes>, StorageError> {
        if pattern != "*" {
            return Err(StorageError::UnsupportedPattern(pattern.to_string()));
        }

        let mut found: Vec<(u64, Bytes)> = Vec::new();
        for shard in &self.shards {
            let data = shard.data.read().unwrap();
            found.extend(
                data.iter()
                    .filter(|(key, entry)| !entry.is_expired() && !is_reserved(key))
                    .map(|(key, entry)| (entry.seq, key.clone())),
            );
        }

        found.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, key)| key).collect())
    }

    /// Adds `delta` to an integer value, creating it at 0 when absent.
    ///
    /// The existing expiry, if any, is preserved.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StorageError> {
        let shard = self.get_shard(key);
        let mut data = shard.data.write().unwrap();

        let live = data.get(key).filter(|entry| !entry.is_expired());
        let current = match live {
            Some(entry) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StorageError::NotAnInteger)?,
            None => 0,
        };

        let new_value = current.checked_add(delta).ok_or(StorageError::Overflow)?;

        let (expires_at, seq) = match live {
            Some(entry) => (entry.expires_at, entry.seq),
            None => (None, self.next_seq.fetch_add(1, Ordering::Relaxed)),
        };

        let previous = data.insert(
            key.clone(),
            Entry {
                value: Bytes::from(new_value.to_string()),
                expires_at,
                seq,
            },
        );
        if previous.is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(new_value)
    }

    /// Returns the approximate number of stored entries, reserved keys included.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of expired entries removed so far.
    pub fn expired_total(&self) -> u64 {
        self.expired_count.load(Ordering::Relaxed)
    }

    /// Removes every expired entry and returns how many were removed.
    ///
    /// Each entry is judged by its own current deadline while the shard is
    /// write-locked, so a key rewritten after an old TTL is never removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut data = shard.data.write().unwrap();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired());
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }

        cleaned
    }

    // ========================================================================
    // REPLICATION METADATA
    // ========================================================================

    /// The replication id stored under the reserved key, if any.
    pub fn replication_id(&self) -> Option<String> {
        self.get(&Bytes::from_static(REPLICATION_ID_KEY))
            .map(|id| String::from_utf8_lossy(&id).into_owned())
    }

    /// The replication offset stored under the reserved key (0 when unset).
    pub fn replication_offset(&self) -> u64 {
        self.get(&Bytes::from_static(REPLICATION_OFFSET_KEY))
            .and_then(|raw| std::str::from_utf8(&raw).ok()?.parse().ok())
            .unwrap_or(0)
    }

    /// Overwrites both replication metadata keys.
    pub fn set_replication_meta(&self, id: &str, offset: u64) {
        self.set(
            Bytes::from_static(REPLICATION_ID_KEY),
            Bytes::copy_from_slice(id.as_bytes()),
            None,
        );
        self.set(
            Bytes::from_static(REPLICATION_OFFSET_KEY),
            Bytes::from(offset.to_string()),
            None,
        );
    }

    /// Advances the replication offset by `bytes` and returns the new offset.
    pub fn advance_replication_offset(&self, bytes: usize) -> Result<u64, StorageError> {
        let delta = i64::try_from(bytes).map_err(|_| StorageError::Overflow)?;
        let offset = self.incr_by(&Bytes::from_static(REPLICATION_OFFSET_KEY), delta)?;
        Ok(offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_set_and_get() {
        let engine = StorageEngine::new();
        assert!(engine.set(b("key"), b("value"), None));
        assert_eq!(engine.get(&b("key")), Some(b("value")));
        assert!(!engine.set(b("key"), b("other"), None));
        assert_eq!(engine.get(&b("key")), Some(b("other")));
    }

    #[test]
    fn test_get_nonexistent() {
        let engine = StorageEngine::new();
        assert_eq!(engine.get(&b("missing")), None);
    }

    #[test]
    fn test_binary_keys_and_values() {
        let engine = StorageEngine::new();
        let key = Bytes::from_static(b"\x00\xffkey");
        let value = Bytes::from_static(b"*\r\n\xff");
        engine.set(key.clone(), value.clone(), None);
        assert_eq!(engine.get(&key), Some(value));
    }

    #[test]
    fn test_unrepresentable_deadline_never_expires() {
        let engine = StorageEngine::new();
        engine.set(b("forever"), b("value"), Some(Duration::MAX));
        assert_eq!(engine.get(&b("forever")), Some(b("value")));
        assert_eq!(engine.keys("*").unwrap(), vec![b("forever")]);
    }

    #[test]
    fn test_expiry_is_lazy() {
        let engine = StorageEngine::new();
        engine.set(b("temp"), b("value"), Some(Duration::from_millis(50)));
        assert_eq!(engine.get(&b("temp")), Some(b("value")));

        thread::sleep(Duration::from_millis(80));

        // No sweeper is running; the read alone must hide the entry.
        assert_eq!(engine.get(&b("temp")), None);
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.expired_total(), 1);
    }

    #[test]
    fn test_set_without_ttl_clears_expiry() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("v1"), Some(Duration::from_millis(30)));
        engine.set(b("k"), b("v2"), None);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(engine.get(&b("k")), Some(b("v2")));
    }

    #[test]
    fn test_overwrite_not_blanked_by_stale_expiry() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("old"), Some(Duration::from_millis(30)));
        engine.set(b("k"), b("new"), Some(Duration::from_secs(60)));

        thread::sleep(Duration::from_millis(60));
        assert_eq!(engine.cleanup_expired(), 0);
        assert_eq!(engine.get(&b("k")), Some(b("new")));
    }

    #[test]
    fn test_keys_in_insertion_order() {
        let engine = StorageEngine::new();
        for name in ["zeta", "alpha", "mid", "beta"] {
            engine.set(Bytes::from(name), b("v"), None);
        }
        // Overwriting a live key keeps its original position.
        engine.set(b("zeta"), b("v2"), None);

        assert_eq!(
            engine.keys("*").unwrap(),
            vec![b("zeta"), b("alpha"), b("mid"), b("beta")]
        );
    }

    #[test]
    fn test_keys_skips_expired_and_reserved() {
        let engine = StorageEngine::new();
        engine.set_replication_meta("abc", 0);
        engine.set(b("live"), b("v"), None);
        engine.set(b("dying"), b("v"), Some(Duration::from_millis(20)));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.keys("*").unwrap(), vec![b("live")]);
    }

    #[test]
    fn test_keys_rejects_other_patterns() {
        let engine = StorageEngine::new();
        assert_eq!(
            engine.keys("user:*"),
            Err(StorageError::UnsupportedPattern("user:*".to_string()))
        );
    }

    #[test]
    fn test_incr_by() {
        let engine = StorageEngine::new();
        assert_eq!(engine.incr_by(&b("counter"), 5), Ok(5));
        assert_eq!(engine.incr_by(&b("counter"), -2), Ok(3));

        engine.set(b("text"), b("abc"), None);
        assert_eq!(engine.incr_by(&b("text"), 1), Err(StorageError::NotAnInteger));

        engine.set(b("big"), Bytes::from(i64::MAX.to_string()), None);
        assert_eq!(engine.incr_by(&b("big"), 1), Err(StorageError::Overflow));
    }

    #[test]
    fn test_replication_meta() {
        let engine = StorageEngine::new();
        assert_eq!(engine.replication_id(), None);
        assert_eq!(engine.replication_offset(), 0);

        engine.set_replication_meta("8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb", 0);
        assert_eq!(engine.advance_replication_offset(31), Ok(31));
        assert_eq!(engine.advance_replication_offset(14), Ok(45));

        assert_eq!(
            engine.replication_id().as_deref(),
            Some("8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb")
        );
        assert_eq!(engine.replication_offset(), 45);
        assert!(engine.keys("*").unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let engine = StorageEngine::new();
        for i in 0..10 {
            engine.set(
                Bytes::from(format!("temp{}", i)),
                b("v"),
                Some(Duration::from_millis(10)),
            );
        }
        engine.set(b("keep"), b("v"), None);
        assert_eq!(engine.len(), 11);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.cleanup_expired(), 10);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        let engine = Arc::new(StorageEngine::new());
        let mut handles = vec![];

        for t in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = Bytes::from(format!("t{}:k{}", t, i));
                    engine.set(key.clone(), Bytes::from(format!("{}", i)), None);
                    assert!(engine.get(&key).is_some());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 4000);
        assert_eq!(engine.keys("*").unwrap().len(), 4000);
    }
}
