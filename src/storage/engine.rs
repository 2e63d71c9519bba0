//! Thread-Safe Storage Engine with Expiry Support
//!
//! A sharded string-to-string map with optional per-key expiry.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲                         ▲
//!        │ one timer task per      │ periodic scan
//!        │ expiring write          │
//!   schedule_removal()       ExpirySweeper
//! ```
//!
//! Every operation touches exactly one key under exactly one shard lock, so
//! operations on the same key are linearizable and a reader always sees a
//! value written in full by a single writer.
//!
//! ## Expiry
//!
//! An entry whose deadline has passed is treated as absent by every read,
//! whether or not it has been physically removed yet. Removal happens on
//! access (lazy), when the entry's timer fires, or when the sweeper runs.

use crate::storage::expiry::{schedule_removal, ExpiryMode};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// A stored value with optional expiry time.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// Identifies the write that produced this entry
    pub generation: u64,
}

impl Entry {
    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

/// Precondition for a write, as used by `SET ... NX|XX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// Only write if the key does not currently exist (NX)
    IfAbsent,
    /// Only write if the key currently exists (XX)
    IfPresent,
}

impl SetCondition {
    #[inline]
    fn allows(self, exists: bool) -> bool {
        match self {
            SetCondition::Always => true,
            SetCondition::IfAbsent => !exists,
            SetCondition::IfPresent => exists,
        }
    }
}

/// A single shard containing a portion of the key-value pairs.
#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<Bytes, Entry>>,
}

/// State shared between the engine and the expiry tasks it spawns.
#[derive(Debug)]
pub(crate) struct Keyspace {
    shards: Vec<Shard>,
    key_count: AtomicU64,
    expired_count: AtomicU64,
    next_generation: AtomicU64,
}

impl Keyspace {
    fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            key_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn record_expired(&self, count: u64) {
        self.key_count.fetch_sub(count, Ordering::Relaxed);
        self.expired_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Removal requested by a timer scheduled for the write `generation`.
    ///
    /// In `Detached` mode the key is removed whatever was written since. In
    /// `Tracked` mode only the entry produced by that exact write is removed.
    pub(crate) fn remove_scheduled(&self, key: &Bytes, generation: u64, mode: ExpiryMode) -> bool {
        let mut data = self.shard(key).data.write();
        let due = match (data.get(key), mode) {
            (None, _) => false,
            (Some(_), ExpiryMode::Detached) => true,
            (Some(entry), ExpiryMode::Tracked) => entry.generation == generation,
        };
        if due {
            data.remove(key);
            self.record_expired(1);
        }
        due
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Physically stored keys, including expired ones not yet removed
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    pub expired: u64,
}

/// The main storage engine.
///
/// Designed to be wrapped in an `Arc` and shared by every connection.
///
/// # Example
///
/// ```
/// use tidekv::storage::StorageEngine;
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// engine.set(Bytes::from("name"), Bytes::from("tide"), None);
/// assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("tide")));
/// assert!(engine.delete(&Bytes::from("name")));
/// assert!(!engine.exists(&Bytes::from("name")));
/// ```
pub struct StorageEngine {
    keyspace: Arc<Keyspace>,
    mode: ExpiryMode,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.keyspace.shards.len())
            .field("mode", &self.mode)
            .field("key_count", &self.len())
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    /// Creates an engine whose expiry timers run in [`ExpiryMode::Detached`].
    pub fn new() -> Self {
        Self::with_mode(ExpiryMode::default())
    }

    pub fn with_mode(mode: ExpiryMode) -> Self {
        Self {
            keyspace: Arc::new(Keyspace::new()),
            mode,
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ExpiryMode {
        self.mode
    }

    /// Unconditionally writes a key, optionally expiring after `ttl`.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        self.set_if(key, value, SetCondition::Always, ttl);
    }

    /// Writes a key if `condition` holds, checked and applied atomically.
    ///
    /// Without a `ttl`, an existing deadline is kept in `Detached` mode (the
    /// timer behind it is still armed) and cleared in `Tracked` mode.
    ///
    /// # Returns
    ///
    /// Returns `true` if the value was written.
    pub fn set_if(
        &self,
        key: Bytes,
        value: Bytes,
        condition: SetCondition,
        ttl: Option<Duration>,
    ) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        let generation = self.keyspace.next_generation.fetch_add(1, Ordering::Relaxed);

        let timer = {
            let mut data = self.keyspace.shard(&key).data.write();

            let live_deadline = data
                .get(&key)
                .filter(|entry| !entry.is_expired())
                .map(|entry| entry.expires_at);

            if !condition.allows(live_deadline.is_some()) {
                return false;
            }

            let expires_at = match (ttl, self.mode) {
                // Too far out to represent: never expires
                (Some(ttl), _) => Instant::now().checked_add(ttl),
                (None, ExpiryMode::Detached) => live_deadline.flatten(),
                (None, ExpiryMode::Tracked) => None,
            };

            let entry = Entry {
                value,
                expires_at,
                generation,
            };
            if data.insert(key.clone(), entry).is_none() {
                self.keyspace.key_count.fetch_add(1, Ordering::Relaxed);
            }

            ttl.filter(|_| expires_at.is_some())
        };

        if let Some(ttl) = timer {
            schedule_removal(Arc::downgrade(&self.keyspace), key, generation, ttl, self.mode);
        }

        true
    }

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired. Expired
    /// entries found here are removed on the spot.
    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.keyspace.shard(key);

        {
            let data = shard.data.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired - take the write lock to remove it
        let mut data = shard.data.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.keyspace.record_expired(1);
                None
            }
            // Rewritten between the two locks
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Gets the full entry for a key, if it is live.
    pub fn get_entry(&self, key: &Bytes) -> Option<Entry> {
        let data = self.keyspace.shard(key).data.read();
        data.get(key).filter(|e| !e.is_expired()).cloned()
    }

    /// Deletes a key.
    ///
    /// # Returns
    ///
    /// Returns `true` if a live key was removed. An expired entry is dropped
    /// as well but does not count as deleted.
    pub fn delete(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut data = self.keyspace.shard(key).data.write();
        match data.remove(key) {
            Some(entry) if entry.is_expired() => {
                self.keyspace.record_expired(1);
                false
            }
            Some(_) => {
                self.keyspace.key_count.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Deletes multiple keys, returning how many were removed.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|key| self.delete(key)).count() as u64
    }

    /// Checks if a key exists (and is not expired).
    pub fn exists(&self, key: &Bytes) -> bool {
        let data = self.keyspace.shard(key).data.read();
        data.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    /// Returns the number of physically stored keys.
    ///
    /// Expired entries that have not been removed yet are included.
    pub fn len(&self) -> u64 {
        self.keyspace.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.len(),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.keyspace.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Cleans up expired keys from all shards.
    ///
    /// This is called by the background expiry sweeper.
    ///
    /// # Returns
    ///
    /// Returns the number of keys that were cleaned up.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.keyspace.shards {
            let mut data = shard.data.write();
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired());
            cleaned += (before - data.len()) as u64;
        }

        if cleaned > 0 {
            self.keyspace.record_expired(cleaned);
        }

        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_set_and_get() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"), None);
        assert_eq!(engine.get(&b("key")), Some(b("value")));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let engine = StorageEngine::new();
        assert_eq!(engine.get(&b("missing")), None);
    }

    #[test]
    fn test_overwrite_keeps_single_key() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("one"), None);
        engine.set(b("key"), b("two"), None);
        assert_eq!(engine.get(&b("key")), Some(b("two")));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_delete() {
        let engine = StorageEngine::new();
        engine.set(b("key"), b("value"), None);
        assert!(engine.delete(&b("key")));
        assert!(!engine.delete(&b("key")));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_delete_many_counts_only_live_keys() {
        let engine = StorageEngine::new();
        engine.set(b("a"), b("1"), None);
        engine.set(b("c"), b("3"), None);
        assert_eq!(engine.delete_many(&[b("a"), b("b"), b("c"), b("a")]), 2);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_conditional_set() {
        let engine = StorageEngine::new();
        assert!(!engine.set_if(b("k"), b("v"), SetCondition::IfPresent, None));
        assert!(!engine.exists(&b("k")));

        assert!(engine.set_if(b("k"), b("v1"), SetCondition::IfAbsent, None));
        assert!(!engine.set_if(b("k"), b("v2"), SetCondition::IfAbsent, None));
        assert_eq!(engine.get(&b("k")), Some(b("v1")));

        assert!(engine.set_if(b("k"), b("v3"), SetCondition::IfPresent, None));
        assert_eq!(engine.get(&b("k")), Some(b("v3")));
    }

    // No runtime here, so no timer is spawned: absence comes from the
    // deadline alone.
    #[test]
    fn test_expired_key_is_absent_before_removal() {
        let engine = StorageEngine::new();
        engine.set(b("temp"), b("value"), Some(Duration::from_millis(20)));
        assert!(engine.exists(&b("temp")));

        thread::sleep(Duration::from_millis(40));

        assert_eq!(engine.len(), 1);
        assert!(!engine.exists(&b("temp")));
        assert!(engine.get_entry(&b("temp")).is_none());
        assert_eq!(engine.get(&b("temp")), None);
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.stats().expired, 1);
    }

    #[test]
    fn test_expired_key_allows_nx_and_blocks_xx() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("old"), Some(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(30));

        assert!(!engine.set_if(b("k"), b("x"), SetCondition::IfPresent, None));
        assert!(engine.set_if(b("k"), b("new"), SetCondition::IfAbsent, None));
        assert_eq!(engine.get(&b("k")), Some(b("new")));
    }

    #[test]
    fn test_delete_of_expired_key_is_not_counted() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("v"), Some(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(30));
        assert!(!engine.delete(&b("k")));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_detached_set_without_ttl_keeps_deadline() {
        let engine = StorageEngine::with_mode(ExpiryMode::Detached);
        engine.set(b("k"), b("v1"), Some(Duration::from_millis(20)));
        engine.set(b("k"), b("v2"), None);
        assert!(engine.get_entry(&b("k")).unwrap().expires_at.is_some());

        thread::sleep(Duration::from_millis(40));
        assert_eq!(engine.get(&b("k")), None);
    }

    #[test]
    fn test_tracked_set_without_ttl_clears_deadline() {
        let engine = StorageEngine::with_mode(ExpiryMode::Tracked);
        engine.set(b("k"), b("v1"), Some(Duration::from_millis(20)));
        engine.set(b("k"), b("v2"), None);
        assert!(engine.get_entry(&b("k")).unwrap().expires_at.is_none());

        thread::sleep(Duration::from_millis(40));
        assert_eq!(engine.get(&b("k")), Some(b("v2")));
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("v"), Some(Duration::from_secs(u64::MAX)));
        assert!(engine.get_entry(&b("k")).unwrap().expires_at.is_none());
        assert_eq!(engine.get(&b("k")), Some(b("v")));
    }

    #[test]
    fn test_cleanup_expired() {
        let engine = StorageEngine::new();
        for i in 0..10 {
            engine.set(
                b(&format!("temp{}", i)),
                b("v"),
                Some(Duration::from_millis(10)),
            );
        }
        engine.set(b("keep"), b("v"), None);
        assert_eq!(engine.len(), 11);

        thread::sleep(Duration::from_millis(30));

        assert_eq!(engine.cleanup_expired(), 10);
        assert_eq!(engine.len(), 1);
        assert!(engine.exists(&b("keep")));
    }

    #[test]
    fn test_generations_increase() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("1"), None);
        let first = engine.get_entry(&b("k")).unwrap().generation;
        engine.set(b("k"), b("2"), None);
        assert!(engine.get_entry(&b("k")).unwrap().generation > first);
    }

    #[test]
    fn test_concurrent_access() {
        let engine = Arc::new(StorageEngine::new());
        let mut handles = vec![];

        for t in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = b(&format!("key-{}-{}", t, i));
                    engine.set(key.clone(), b(&format!("value-{}", i)), None);
                    assert_eq!(engine.get(&key), Some(b(&format!("value-{}", i))));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.len(), 4000);
    }

    #[test]
    fn test_concurrent_writes_to_one_key_never_tear() {
        let engine = Arc::new(StorageEngine::new());
        let key = b("shared");
        // Each writer uses a distinct fill byte and length
        let values: Vec<Bytes> = (0..4u8)
            .map(|i| Bytes::from(vec![b'a' + i; 1024 * (i as usize + 1)]))
            .collect();

        let writers: Vec<_> = values
            .iter()
            .cloned()
            .map(|value| {
                let engine = Arc::clone(&engine);
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        engine.set(key.clone(), value.clone(), None);
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let key = key.clone();
                let values = values.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        if let Some(seen) = engine.get(&key) {
                            assert!(values.contains(&seen), "observed a torn value");
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(engine.len(), 1);
    }
}
