//! Two-tier cache with per-entry TTL.
//!
//! # Tiers
//!
//! - Memory: a map of [`CacheEntry`] values, capped at a configured number of
//!   entries. When the cap is exceeded the oldest 20% by write time are
//!   evicted. Reads do not refresh write time.
//! - Persisted: a [`PersistentStorage`] backend holding the same entries as
//!   JSON under `cache_<key>`. Valid persisted entries are promoted to memory
//!   on read; expired or unreadable ones are deleted when touched.
//!
//! Persisted writes are best effort. On a quota failure the oldest 20% of
//! persisted cache entries are dropped and the write is retried once; a second
//! failure is logged and the value stays memory-only.

mod storage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

pub use storage::{FileStorage, MemoryStorage, PersistentStorage, StorageError};

use crate::clock::Clock;
use crate::config::CacheConfig;

/// Prefix of every key the cache writes to persisted storage.
pub const STORAGE_KEY_PREFIX: &str = "cache_";

/// A cached value with its write time and lifetime, both in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: i64,
    pub ttl: u64,
}

impl CacheEntry {
    /// Valid while `now - timestamp < ttl`.
    #[must_use]
    pub fn is_valid_at(&self, now: i64) -> bool {
        let ttl = i64::try_from(self.ttl).unwrap_or(i64::MAX);
        now.saturating_sub(self.timestamp) < ttl
    }
}

/// Entry counts per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub persisted_entries: usize,
}

/// Memory + persisted cache.
#[derive(Debug)]
pub struct CacheManager {
    memory: Mutex<HashMap<String, CacheEntry>>,
    storage: Arc<dyn PersistentStorage>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    default_ttl: Duration,
}

fn storage_key(key: &str) -> String {
    format!("{STORAGE_KEY_PREFIX}{key}")
}

fn duration_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Number of entries to drop when shrinking a tier of `len` entries.
const fn eviction_count(len: usize) -> usize {
    let fifth = len / 5;
    if fifth == 0 { 1 } else { fifth }
}

impl CacheManager {
    /// Create a cache over `storage`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn PersistentStorage>,
        clock: Arc<dyn Clock>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            storage,
            clock,
            capacity: config.memory_capacity.max(1),
            default_ttl: config.default_ttl,
        }
    }

    /// TTL applied by [`Self::set_default`].
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up `key`, memory first, then persisted storage.
    ///
    /// Returns `None` on a miss, on expiry, or if the cached value does not
    /// decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now_millis();

        let from_memory = {
            let mut memory = self.memory.lock();
            match memory.get(key) {
                Some(entry) if entry.is_valid_at(now) => Some(entry.data.clone()),
                Some(_) => {
                    memory.remove(key);
                    None
                }
                None => None,
            }
        };

        let data = match from_memory {
            Some(data) => data,
            None => self.load_persisted(key, now)?,
        };

        match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Read a persisted entry, promoting it to memory if still valid.
    fn load_persisted(&self, key: &str, now: i64) -> Option<Value> {
        let skey = storage_key(key);
        let raw = match self.storage.get_item(&skey) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read persisted cache entry");
                return None;
            }
        };

        let entry = match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Dropping unreadable persisted cache entry");
                self.remove_persisted(&skey);
                return None;
            }
        };

        if !entry.is_valid_at(now) {
            debug!(key, "Persisted cache entry expired");
            self.remove_persisted(&skey);
            return None;
        }

        debug!(key, "Promoting persisted cache entry");
        let data = entry.data.clone();
        self.insert_memory(key.to_owned(), entry);
        Some(data)
    }

    /// Store `data` under `key` for `ttl` in both tiers.
    ///
    /// Never fails: persistence problems are logged and the value remains
    /// cached in memory.
    #[instrument(skip(self, data), fields(ttl_ms = duration_millis(ttl)))]
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Value is not cacheable");
                return;
            }
        };

        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
            ttl: duration_millis(ttl),
        };

        match serde_json::to_string(&entry) {
            Ok(raw) => self.persist(key, &raw),
            Err(e) => warn!(error = %e, "Failed to encode cache entry"),
        }
        self.insert_memory(key.to_owned(), entry);
    }

    /// Store `data` under `key` with the configured default TTL.
    pub fn set_default<T: Serialize + ?Sized>(&self, key: &str, data: &T) {
        self.set(key, data, self.default_ttl);
    }

    fn insert_memory(&self, key: String, entry: CacheEntry) {
        let mut memory = self.memory.lock();
        memory.insert(key, entry);

        if memory.len() > self.capacity {
            let mut by_age: Vec<(String, i64)> = memory
                .iter()
                .map(|(k, e)| (k.clone(), e.timestamp))
                .collect();
            by_age.sort_by_key(|(_, timestamp)| *timestamp);

            let count = eviction_count(by_age.len());
            for (key, _) in by_age.into_iter().take(count) {
                memory.remove(&key);
            }
            debug!(evicted = count, remaining = memory.len(), "Evicted oldest memory cache entries");
        }
    }

    fn persist(&self, key: &str, raw: &str) {
        let skey = storage_key(key);
        match self.storage.set_item(&skey, raw) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded { .. }) => {
                let evicted = self.evict_oldest_persisted();
                if let Err(e) = self.storage.set_item(&skey, raw) {
                    warn!(key, evicted, error = %e, "Cache storage still full after eviction, keeping entry in memory only");
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to persist cache entry"),
        }
    }

    /// Drop the oldest 20% of persisted cache entries. Unreadable entries go
    /// first.
    fn evict_oldest_persisted(&self) -> usize {
        let mut by_age: Vec<(String, i64)> = self
            .persisted_keys()
            .into_iter()
            .map(|skey| {
                let timestamp = self
                    .storage
                    .get_item(&skey)
                    .ok()
                    .flatten()
                    .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
                    .map_or(i64::MIN, |entry| entry.timestamp);
                (skey, timestamp)
            })
            .collect();

        if by_age.is_empty() {
            return 0;
        }
        by_age.sort_by_key(|(_, timestamp)| *timestamp);

        let count = eviction_count(by_age.len());
        let oldest: Vec<String> = by_age.into_iter().take(count).map(|(skey, _)| skey).collect();
        if let Err(e) = self.storage.remove_items(&oldest) {
            warn!(error = %e, "Failed to evict persisted cache entries");
            return 0;
        }
        debug!(evicted = count, "Evicted oldest persisted cache entries");
        count
    }

    fn persisted_keys(&self) -> Vec<String> {
        match self.storage.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| k.starts_with(STORAGE_KEY_PREFIX))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list persisted cache keys");
                Vec::new()
            }
        }
    }

    fn remove_persisted(&self, storage_key: &str) {
        if let Err(e) = self.storage.remove_item(storage_key) {
            warn!(key = storage_key, error = %e, "Failed to remove persisted cache entry");
        }
    }

    /// Remove every key containing `pattern` from both tiers.
    ///
    /// Returns the number of distinct keys removed.
    #[instrument(skip(self))]
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut removed: Vec<String> = {
            let mut memory = self.memory.lock();
            let keys: Vec<String> = memory
                .keys()
                .filter(|k| k.contains(pattern))
                .cloned()
                .collect();
            for key in &keys {
                memory.remove(key);
            }
            keys
        };

        for skey in self.persisted_keys() {
            let Some(key) = skey.strip_prefix(STORAGE_KEY_PREFIX) else {
                continue;
            };
            if key.contains(pattern) {
                self.remove_persisted(&skey);
                if !removed.iter().any(|k| k == key) {
                    removed.push(key.to_owned());
                }
            }
        }

        debug!(removed = removed.len(), "Invalidated cache entries");
        removed.len()
    }

    /// Empty both tiers. Persisted keys without the cache prefix are left
    /// alone.
    pub fn clear(&self) {
        self.memory.lock().clear();
        if let Err(e) = self.storage.remove_items(&self.persisted_keys()) {
            warn!(error = %e, "Failed to clear persisted cache entries");
        }
        debug!("Cache cleared");
    }

    /// Delete expired and unreadable entries from both tiers.
    ///
    /// Returns the number of entries removed across tiers.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();

        let from_memory = {
            let mut memory = self.memory.lock();
            let before = memory.len();
            memory.retain(|_, entry| entry.is_valid_at(now));
            before - memory.len()
        };

        let mut from_storage = 0;
        for skey in self.persisted_keys() {
            let keep = self
                .storage
                .get_item(&skey)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
                .is_some_and(|entry| entry.is_valid_at(now));
            if !keep {
                self.remove_persisted(&skey);
                from_storage += 1;
            }
        }

        debug!(from_memory, from_storage, "Purged expired cache entries");
        from_memory + from_storage
    }

    /// Current entry counts.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_entries: self.memory.lock().len(),
            persisted_entries: self.persisted_keys().len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;

    const START: i64 = 1_700_000_000_000;

    fn cache_with(storage: Arc<MemoryStorage>, clock: &ManualClock, capacity: usize) -> CacheManager {
        let config = CacheConfig {
            memory_capacity: capacity,
            ..CacheConfig::default()
        };
        CacheManager::new(storage, Arc::new(clock.clone()), &config)
    }

    fn cache() -> (CacheManager, Arc<MemoryStorage>, ManualClock) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::new(START);
        (cache_with(Arc::clone(&storage), &clock, 1000), storage, clock)
    }

    #[test]
    fn test_unknown_key_misses() {
        let (cache, _, _) = cache();
        assert!(cache.get::<Value>("never-set").is_none());
    }

    #[test]
    fn test_set_then_get_within_ttl() {
        let (cache, _, clock) = cache();
        let value = json!({"coupons": [{"id": "c1"}], "hasMore": false});
        cache.set("coupons_abc", &value, Duration::from_secs(60));

        clock.advance(59_999);
        assert_eq!(cache.get::<Value>("coupons_abc"), Some(value));
    }

    #[test]
    fn test_expired_entry_misses_and_is_deleted() {
        let (cache, storage, clock) = cache();
        cache.set("k", &7, Duration::from_millis(1000));

        clock.advance(1000);
        assert!(cache.get::<i32>("k").is_none());
        assert!(storage.get_item("cache_k").unwrap().is_none());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_persisted_entry_promoted_after_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::new(START);

        let first = cache_with(Arc::clone(&storage), &clock, 1000);
        first.set("customer_phone_27832091122", "c9", Duration::from_secs(600));
        drop(first);

        let second = cache_with(Arc::clone(&storage), &clock, 1000);
        assert_eq!(second.stats().memory_entries, 0);
        assert_eq!(
            second.get::<String>("customer_phone_27832091122").as_deref(),
            Some("c9")
        );
        assert_eq!(second.stats().memory_entries, 1);
    }

    #[test]
    fn test_promoted_entry_keeps_original_timestamp() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::new(START);
        cache_with(Arc::clone(&storage), &clock, 1000).set("k", &1, Duration::from_millis(500));

        let cache = cache_with(Arc::clone(&storage), &clock, 1000);
        clock.advance(400);
        assert_eq!(cache.get::<i32>("k"), Some(1));
        clock.advance(100);
        assert!(cache.get::<i32>("k").is_none());
    }

    #[test]
    fn test_unreadable_persisted_entry_removed() {
        let (cache, storage, _) = cache();
        storage.set_item("cache_broken", "{not json").unwrap();
        assert!(cache.get::<Value>("broken").is_none());
        assert!(storage.get_item("cache_broken").unwrap().is_none());
    }

    #[test]
    fn test_wrong_shape_is_a_miss() {
        let (cache, _, _) = cache();
        cache.set("k", &json!({"a": 1}), Duration::from_secs(1));
        assert!(cache.get::<Vec<String>>("k").is_none());
    }

    #[test]
    fn test_invalidate_matches_substrings_only() {
        let (cache, storage, _) = cache();
        let ttl = Duration::from_secs(60);
        cache.set("customer_coupons_c1_true", &1, ttl);
        cache.set("customer_coupons_c2_true", &2, ttl);
        cache.set("coupons_b1", &3, ttl);
        // Persisted-only entry from an earlier run
        storage
            .set_item(
                "cache_old_customer_coupons_c1",
                &serde_json::to_string(&CacheEntry {
                    data: json!(0),
                    timestamp: START,
                    ttl: 60_000,
                })
                .unwrap(),
            )
            .unwrap();

        assert_eq!(cache.invalidate("_c1"), 2);
        assert!(cache.get::<i32>("customer_coupons_c1_true").is_none());
        assert!(cache.get::<i32>("old_customer_coupons_c1").is_none());
        assert_eq!(cache.get::<i32>("customer_coupons_c2_true"), Some(2));
        assert_eq!(cache.get::<i32>("coupons_b1"), Some(3));
    }

    #[test]
    fn test_clear_wipes_cache_keys_only() {
        let (cache, storage, _) = cache();
        storage.set_item("viewMode", "grid").unwrap();
        cache.set("a", &1, Duration::from_secs(60));
        cache.set("b", &2, Duration::from_secs(60));

        cache.clear();
        assert!(cache.get::<i32>("a").is_none());
        assert_eq!(cache.stats(), CacheStats::default());
        assert_eq!(storage.get_item("viewMode").unwrap().as_deref(), Some("grid"));
    }

    #[test]
    fn test_memory_eviction_drops_oldest_fifth() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::new(START);
        let cache = cache_with(storage, &clock, 10);

        for i in 0..11 {
            cache.set(&format!("k{i}"), &i, Duration::from_secs(60));
            clock.advance(1);
        }

        // 11 entries over a cap of 10: 11 / 5 = 2 evicted
        let memory = cache.memory.lock();
        assert_eq!(memory.len(), 9);
        assert!(!memory.contains_key("k0"));
        assert!(!memory.contains_key("k1"));
        assert!(memory.contains_key("k2"));
        assert!(memory.contains_key("k10"));
    }

    #[test]
    fn test_quota_failure_evicts_oldest_persisted_and_retries() {
        let clock = ManualClock::new(START);

        // Measure one persisted entry
        let probe = Arc::new(MemoryStorage::new());
        cache_with(Arc::clone(&probe), &clock, 1000).set("k0", &0, Duration::from_secs(60));
        let entry_bytes = probe.used_bytes();

        let storage = Arc::new(MemoryStorage::with_quota(entry_bytes * 5));
        let cache = cache_with(Arc::clone(&storage), &clock, 1000);
        for i in 0..6 {
            cache.set(&format!("k{i}"), &i, Duration::from_secs(60));
            clock.advance(1);
        }

        let keys = storage.keys().unwrap();
        assert_eq!(keys.len(), 5);
        assert!(!keys.contains(&"cache_k0".to_string()));
        assert!(keys.contains(&"cache_k5".to_string()));
    }

    #[test]
    fn test_second_quota_failure_is_swallowed() {
        let storage = Arc::new(MemoryStorage::with_quota(8));
        let clock = ManualClock::new(START);
        let cache = cache_with(Arc::clone(&storage), &clock, 1000);

        cache.set("too_big", &json!({"payload": "x".repeat(64)}), Duration::from_secs(60));

        assert!(storage.keys().unwrap().is_empty());
        assert!(cache.get::<Value>("too_big").is_some());
    }

    #[test]
    fn test_purge_expired_sweeps_both_tiers() {
        let (cache, storage, clock) = cache();
        cache.set("short", &1, Duration::from_millis(100));
        cache.set("long", &2, Duration::from_secs(60));
        storage.set_item("cache_garbage", "???").unwrap();

        clock.advance(200);
        // short: memory + storage, garbage: storage
        assert_eq!(cache.purge_expired(), 3);
        assert_eq!(
            cache.stats(),
            CacheStats {
                memory_entries: 1,
                persisted_entries: 1
            }
        );
    }

    #[test]
    fn test_set_default_uses_configured_ttl() {
        let (cache, _, clock) = cache();
        cache.set_default("k", "v");
        clock.advance(299_999);
        assert!(cache.get::<String>("k").is_some());
        clock.advance(1);
        assert!(cache.get::<String>("k").is_none());
    }

    #[test]
    fn test_default_capacity_evicts_oldest_fifth() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::new(START);
        let cache = CacheManager::new(
            Arc::clone(&storage) as Arc<dyn PersistentStorage>,
            Arc::new(clock.clone()),
            &CacheConfig::default(),
        );

        for i in 0..=1000 {
            cache.set(&format!("k{i}"), &i, Duration::from_secs(60));
            clock.advance(1);
        }

        assert_eq!(
            cache.stats(),
            CacheStats {
                memory_entries: 801,
                persisted_entries: 1001
            }
        );
        // Evicted from memory, still served from storage
        assert_eq!(cache.get::<i32>("k0"), Some(0));
        assert_eq!(cache.get::<i32>("k1000"), Some(1000));
    }

    #[test]
    fn test_clear_removes_persisted_entries_in_one_pass() {
        let (cache, storage, _) = cache();
        cache.set("a", &1, Duration::from_secs(60));
        cache.set("b", &2, Duration::from_secs(60));
        storage.set_item("unrelated", "keep").unwrap();

        cache.clear();

        assert_eq!(storage.keys().unwrap(), vec!["unrelated".to_string()]);
        assert!(cache.get::<i32>("a").is_none());
    }
}
