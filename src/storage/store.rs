use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::storage::error::StorageError;
use crate::storage::expiry::ExpiryEvent;
use crate::storage::types::{now_ms, Entry, SetOptions};

/// A key is rejected if any byte is an ASCII space (0x20), a C0 control
/// (0x00-0x1F) or DEL (0x7F). Bytes above 0x7F pass, so multi-byte UTF-8 is
/// fine. Length limits are enforced separately in `set`.
fn validate_key(key: &str) -> Result<(), StorageError> {
    for &b in key.as_bytes() {
        if b == 0x20 || b <= 0x1F || b == 0x7F {
            return Err(StorageError::KeyInvalid);
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Stats {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    cmd_del: AtomicU64,
    cmd_incr: AtomicU64,
    expired_total: AtomicU64,
    evicted_total: AtomicU64,
}

/// The in-memory store: one map of key to [`Entry`] plus a min-heap of
/// pending expiries and command counters.
///
/// All operations are synchronous and never block while holding a lock.
/// Lock order is map before heap; no method takes them the other way round.
#[derive(Debug)]
pub struct Store {
    map: RwLock<HashMap<String, Entry>>,
    expiry: Mutex<BinaryHeap<ExpiryEvent>>,
    stats: Stats,
    start_ms: i64,
    max_key_bytes: usize,
    max_value_bytes: usize,
}

impl Store {
    pub fn new(cfg: &Config) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            expiry: Mutex::new(BinaryHeap::new()),
            stats: Stats::default(),
            start_ms: now_ms(),
            max_key_bytes: cfg.max_key_bytes,
            max_value_bytes: cfg.max_value_bytes,
        }
    }

    /// Look up a live entry. An expired hit is removed on the spot (lazy
    /// deletion) and reported as `KeyNotFound`.
    pub fn get(&self, key: &str) -> Result<Entry, StorageError> {
        validate_key(key)?;
        self.stats.cmd_get.fetch_add(1, Ordering::Relaxed);

        {
            let map = self.map.read();
            match map.get(key) {
                None => return Err(StorageError::KeyNotFound),
                Some(entry) if !entry.is_expired() => return Ok(entry.clone()),
                Some(_) => {}
            }
        }

        // Expired: retake the lock for writing and re-check, since another
        // writer may have replaced the entry in between.
        let mut map = self.map.write();
        if map.get(key).is_some_and(|e| e.is_expired()) {
            map.remove(key);
            self.stats.expired_total.fetch_add(1, Ordering::Relaxed);
        }
        Err(StorageError::KeyNotFound)
    }

    /// Store a value, honoring NX/XX/VER conditions. Returns the new version
    /// and the absolute expiry written. An existing entry that has expired
    /// counts as absent for every condition and for the version rule.
    pub fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        opts: SetOptions,
    ) -> Result<(u64, i64), StorageError> {
        if key.len() > self.max_key_bytes {
            return Err(StorageError::KeyTooLarge);
        }
        validate_key(key)?;
        if value.len() > self.max_value_bytes {
            return Err(StorageError::ValueTooLarge);
        }

        self.stats.cmd_set.fetch_add(1, Ordering::Relaxed);

        let mut map = self.map.write();

        let live_version = map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.version);

        if opts.nx && live_version.is_some() {
            return Err(StorageError::KeyExists);
        }
        if opts.xx && live_version.is_none() {
            return Err(StorageError::KeyNotFound);
        }
        if opts.check_version {
            if let Some(version) = live_version {
                if version != opts.version {
                    return Err(StorageError::VersionMismatch);
                }
            }
        }

        let new_version = live_version.map_or(1, |v| v + 1);

        let expiry_ms = if opts.expiry_ms > 0 {
            now_ms() + opts.expiry_ms
        } else if opts.absolute_expiry_ms > 0 {
            opts.absolute_expiry_ms
        } else {
            -1
        };

        map.insert(key.to_string(), Entry::new(value, new_version, expiry_ms));

        if expiry_ms > 0 {
            self.expiry.lock().push(ExpiryEvent {
                key: key.to_string(),
                expiry_ms,
            });
        }

        Ok((new_version, expiry_ms))
    }

    /// Remove a live key. Returns the removed entry's version, or `None` if
    /// the key was invalid, missing or already expired. An expired entry is
    /// left for the sweeper rather than removed here, so DEL on it reports 0
    /// without producing a tombstone.
    pub fn delete(&self, key: &str) -> Option<u64> {
        if validate_key(key).is_err() {
            return None;
        }
        self.stats.cmd_del.fetch_add(1, Ordering::Relaxed);

        let mut map = self.map.write();
        match map.get(key) {
            Some(entry) if !entry.is_expired() => {
                let version = entry.version;
                map.remove(key);
                Some(version)
            }
            _ => None,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        let map = self.map.read();
        map.get(key).is_some_and(|e| !e.is_expired())
    }

    /// Set a relative TTL on a live key. The expiry mutates in place; the
    /// version does not change. Returns the absolute expiry written and the
    /// entry's version (the WAL record carries both).
    pub fn expire(&self, key: &str, ttl_ms: i64) -> Result<(i64, u64), StorageError> {
        validate_key(key)?;

        let mut map = self.map.write();
        let entry = match map.get_mut(key) {
            Some(e) if !e.is_expired() => e,
            _ => return Err(StorageError::KeyNotFound),
        };

        let expiry_ms = now_ms() + ttl_ms;
        entry.expiry_ms = expiry_ms;
        let version = entry.version;

        self.expiry.lock().push(ExpiryEvent {
            key: key.to_string(),
            expiry_ms,
        });

        Ok((expiry_ms, version))
    }

    /// TTL in milliseconds: -2 if the key is invalid or missing, otherwise
    /// per [`Entry::ttl`].
    pub fn ttl(&self, key: &str) -> i64 {
        if validate_key(key).is_err() {
            return -2;
        }
        let map = self.map.read();
        match map.get(key) {
            None => -2,
            Some(entry) => entry.ttl(),
        }
    }

    /// Add `delta` to the integer value at `key`. A missing or expired key
    /// counts as 0. The result is stored as decimal ASCII with no expiry.
    /// Returns the new value and the new version.
    pub fn incr(&self, key: &str, delta: i64) -> Result<(i64, u64), StorageError> {
        validate_key(key)?;
        self.stats.cmd_incr.fetch_add(1, Ordering::Relaxed);

        let mut map = self.map.write();

        let live = map.get(key).filter(|e| !e.is_expired());
        let current = match live {
            None => 0,
            Some(entry) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StorageError::NotInteger)?,
        };

        let new_version = live.map_or(1, |e| e.version + 1);
        let new_val = current.wrapping_add(delta);

        map.insert(
            key.to_string(),
            Entry::new(new_val.to_string().into_bytes(), new_version, -1),
        );

        Ok((new_val, new_version))
    }

    /// Runtime counters, keyed for the STATS response.
    pub fn stats(&self) -> BTreeMap<String, String> {
        let uptime = now_ms() - self.start_ms;
        let keys = self.live_count();

        let mut out = BTreeMap::new();
        out.insert("uptime_ms".to_string(), uptime.to_string());
        out.insert("keys".to_string(), keys.to_string());
        out.insert(
            "expired_total".to_string(),
            self.stats.expired_total.load(Ordering::Relaxed).to_string(),
        );
        out.insert(
            "evicted_total".to_string(),
            self.stats.evicted_total.load(Ordering::Relaxed).to_string(),
        );
        out.insert(
            "cmd_get".to_string(),
            self.stats.cmd_get.load(Ordering::Relaxed).to_string(),
        );
        out.insert(
            "cmd_set".to_string(),
            self.stats.cmd_set.load(Ordering::Relaxed).to_string(),
        );
        out.insert(
            "cmd_del".to_string(),
            self.stats.cmd_del.load(Ordering::Relaxed).to_string(),
        );
        out.insert(
            "cmd_incr".to_string(),
            self.stats.cmd_incr.load(Ordering::Relaxed).to_string(),
        );
        out
    }

    /// Count of entries that have not expired.
    pub fn live_count(&self) -> usize {
        let map = self.map.read();
        map.values().filter(|e| !e.is_expired()).count()
    }

    /// Total entries in the map, expired included. Used for the snapshot
    /// trigger's size estimate.
    pub fn entry_count(&self) -> usize {
        self.map.read().len()
    }

    /// Visit every live entry under the read lock. The snapshot writer uses
    /// this to serialize a point-in-time image.
    pub fn for_each_live<E>(
        &self,
        mut f: impl FnMut(&str, &Entry) -> Result<(), E>,
    ) -> Result<(), E> {
        let map = self.map.read();
        for (key, entry) in map.iter() {
            if !entry.is_expired() {
                f(key, entry)?;
            }
        }
        Ok(())
    }

    /// Pop up to `batch` due expiry events and remove the entries that are
    /// genuinely expired, returning `(key, version)` for each removal so the
    /// caller can append tombstones. Events whose entry gained a newer
    /// expiry are re-pushed; events for missing keys are dropped.
    pub fn sweep_expired(&self, batch: usize) -> Vec<(String, u64)> {
        let now = now_ms();
        let mut evicted = Vec::new();

        let mut map = self.map.write();
        let mut heap = self.expiry.lock();

        for _ in 0..batch {
            let due = matches!(heap.peek(), Some(ev) if ev.expiry_ms <= now);
            if !due {
                break;
            }
            let Some(ev) = heap.pop() else { break };

            match map.get(&ev.key) {
                Some(entry) if entry.is_expired() => {
                    let version = entry.version;
                    map.remove(&ev.key);
                    self.stats.expired_total.fetch_add(1, Ordering::Relaxed);
                    evicted.push((ev.key, version));
                }
                Some(entry) if entry.expiry_ms > 0 => {
                    // TTL was updated since this event was queued
                    let expiry_ms = entry.expiry_ms;
                    heap.push(ExpiryEvent {
                        key: ev.key,
                        expiry_ms,
                    });
                }
                _ => {}
            }
        }

        evicted
    }

    // Recovery-path primitives. These bypass the command path: no counters,
    // no condition checks, versions taken verbatim from the log.

    pub(crate) fn insert_recovered(&self, key: String, entry: Entry) {
        self.map.write().insert(key, entry);
    }

    pub(crate) fn remove_recovered(&self, key: &str) {
        self.map.write().remove(key);
    }

    pub(crate) fn apply_recovered_expiry(&self, key: &str, expiry_ms: i64) {
        if let Some(entry) = self.map.write().get_mut(key) {
            entry.expiry_ms = expiry_ms;
        }
    }

    /// Drop and repopulate the expiry heap from the map. Run once after
    /// recovery, before the sweeper starts.
    pub(crate) fn rebuild_expiry_heap(&self) {
        let map = self.map.read();
        let mut heap = self.expiry.lock();
        heap.clear();
        for (key, entry) in map.iter() {
            if entry.expiry_ms > 0 {
                heap.push(ExpiryEvent {
                    key: key.clone(),
                    expiry_ms: entry.expiry_ms,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn test_store() -> Store {
        Store::new(&Config::default())
    }

    #[test]
    fn set_get_delete_round_trip() {
        let store = test_store();

        let (version, expiry) = store
            .set("hello", b"world".to_vec(), SetOptions::default())
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(expiry, -1);

        let entry = store.get("hello").unwrap();
        assert_eq!(entry.value, b"world");
        assert_eq!(entry.version, 1);

        assert_eq!(store.delete("hello"), Some(1));
        assert!(matches!(
            store.get("hello"),
            Err(StorageError::KeyNotFound)
        ));
        assert_eq!(store.delete("hello"), None);
    }

    #[test]
    fn versions_increment_on_overwrite() {
        let store = test_store();
        for expected in 1..=5u64 {
            let (version, _) = store
                .set("k", vec![expected as u8], SetOptions::default())
                .unwrap();
            assert_eq!(version, expected);
        }
    }

    #[test]
    fn nx_and_xx_conditions() {
        let store = test_store();

        let opts_nx = SetOptions {
            nx: true,
            ..Default::default()
        };
        let opts_xx = SetOptions {
            xx: true,
            ..Default::default()
        };

        assert!(matches!(
            store.set("a", b"x".to_vec(), opts_xx),
            Err(StorageError::KeyNotFound)
        ));
        assert_eq!(store.set("a", b"x".to_vec(), opts_nx).unwrap().0, 1);
        assert!(matches!(
            store.set("a", b"y".to_vec(), opts_nx),
            Err(StorageError::KeyExists)
        ));
        assert_eq!(store.set("a", b"z".to_vec(), opts_xx).unwrap().0, 2);
    }

    #[test]
    fn version_guarded_set() {
        let store = test_store();
        store.set("a", b"x".to_vec(), SetOptions::default()).unwrap();

        let guard = |version| SetOptions {
            check_version: true,
            version,
            ..Default::default()
        };

        assert_eq!(store.set("a", b"y".to_vec(), guard(1)).unwrap().0, 2);
        assert!(matches!(
            store.set("a", b"z".to_vec(), guard(1)),
            Err(StorageError::VersionMismatch)
        ));
        // A guard against a missing key behaves like an unconditional insert
        assert_eq!(store.set("b", b"q".to_vec(), guard(99)).unwrap().0, 1);
    }

    #[test]
    fn expired_entry_counts_as_absent() {
        let store = test_store();
        let opts = SetOptions {
            expiry_ms: 20,
            ..Default::default()
        };
        store.set("t", b"v".to_vec(), opts).unwrap();
        sleep(Duration::from_millis(50));

        // NX succeeds against the expired entry, and the version restarts
        let opts_nx = SetOptions {
            nx: true,
            ..Default::default()
        };
        let (version, _) = store.set("t", b"w".to_vec(), opts_nx).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn get_lazily_deletes_expired_entries() {
        let store = test_store();
        let opts = SetOptions {
            expiry_ms: 20,
            ..Default::default()
        };
        store.set("t", b"v".to_vec(), opts).unwrap();
        sleep(Duration::from_millis(50));

        assert!(matches!(store.get("t"), Err(StorageError::KeyNotFound)));
        assert!(!store.exists("t"));
        assert_eq!(store.stats()["expired_total"], "1");
    }

    #[test]
    fn ttl_reporting() {
        let store = test_store();
        store.set("plain", b"v".to_vec(), SetOptions::default()).unwrap();
        let opts = SetOptions {
            expiry_ms: 60_000,
            ..Default::default()
        };
        store.set("timed", b"v".to_vec(), opts).unwrap();

        assert_eq!(store.ttl("missing"), -2);
        assert_eq!(store.ttl("plain"), -1);
        let ttl = store.ttl("timed");
        assert!(ttl > 55_000 && ttl <= 60_000);
    }

    #[test]
    fn expire_keeps_version() {
        let store = test_store();
        store.set("k", b"v".to_vec(), SetOptions::default()).unwrap();
        let (expiry_ms, version) = store.expire("k", 60_000).unwrap();
        assert!(expiry_ms > now_ms());
        assert_eq!(version, 1);
        assert_eq!(store.get("k").unwrap().version, 1);

        assert!(matches!(
            store.expire("missing", 1000),
            Err(StorageError::KeyNotFound)
        ));
    }

    #[test]
    fn incr_semantics() {
        let store = test_store();

        assert_eq!(store.incr("n", 1).unwrap(), (1, 1));
        assert_eq!(store.incr("n", 5).unwrap(), (6, 2));
        assert_eq!(store.incr("n", -10).unwrap(), (-4, 3));
        assert_eq!(store.get("n").unwrap().value, b"-4");

        store.set("s", b"hello".to_vec(), SetOptions::default()).unwrap();
        assert!(matches!(
            store.incr("s", 1),
            Err(StorageError::NotInteger)
        ));
    }

    #[test]
    fn incr_clears_expiry() {
        let store = test_store();
        let opts = SetOptions {
            expiry_ms: 60_000,
            ..Default::default()
        };
        store.set("n", b"7".to_vec(), opts).unwrap();
        store.incr("n", 1).unwrap();
        assert_eq!(store.get("n").unwrap().expiry_ms, -1);
    }

    #[test]
    fn key_validation() {
        let store = test_store();
        for bad in ["has space", "tab\there", "nul\0", "del\x7f"] {
            assert!(matches!(
                store.set(bad, b"v".to_vec(), SetOptions::default()),
                Err(StorageError::KeyInvalid)
            ));
        }
        // Multi-byte UTF-8 is fine
        store.set("clé", b"v".to_vec(), SetOptions::default()).unwrap();
        assert!(store.exists("clé"));
        // The validator accepts empty keys
        store.set("", b"v".to_vec(), SetOptions::default()).unwrap();
    }

    #[test]
    fn size_limits() {
        let store = test_store();
        let long_key = "k".repeat(257);
        assert!(matches!(
            store.set(&long_key, b"v".to_vec(), SetOptions::default()),
            Err(StorageError::KeyTooLarge)
        ));

        let cfg = Config {
            max_value_bytes: 8,
            ..Default::default()
        };
        let small = Store::new(&cfg);
        assert!(matches!(
            small.set("k", vec![0u8; 9], SetOptions::default()),
            Err(StorageError::ValueTooLarge)
        ));
    }

    #[test]
    fn sweep_removes_due_entries_and_keeps_refreshed_ones() {
        let store = test_store();
        let short = SetOptions {
            expiry_ms: 20,
            ..Default::default()
        };
        store.set("gone", b"v".to_vec(), short).unwrap();
        store.set("kept", b"v".to_vec(), short).unwrap();
        // Refresh one key so its original heap event goes stale
        store.expire("kept", 60_000).unwrap();

        sleep(Duration::from_millis(50));

        let evicted = store.sweep_expired(100);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "gone");
        assert!(store.exists("kept"));
        assert!(!store.exists("gone"));
    }

    #[test]
    fn sweep_ignores_deleted_keys() {
        let store = test_store();
        let short = SetOptions {
            expiry_ms: 20,
            ..Default::default()
        };
        store.set("x", b"v".to_vec(), short).unwrap();
        store.delete("x").unwrap();
        sleep(Duration::from_millis(50));

        assert!(store.sweep_expired(100).is_empty());
    }

    #[test]
    fn heap_rebuild_after_recovery() {
        let store = test_store();
        store.insert_recovered(
            "timed".to_string(),
            Entry::new(b"v".to_vec(), 3, now_ms() + 50),
        );
        store.insert_recovered("plain".to_string(), Entry::new(b"v".to_vec(), 1, -1));
        store.rebuild_expiry_heap();

        sleep(Duration::from_millis(80));
        let evicted = store.sweep_expired(100);
        assert_eq!(evicted, vec![("timed".to_string(), 3)]);
        assert!(store.exists("plain"));
    }
}
