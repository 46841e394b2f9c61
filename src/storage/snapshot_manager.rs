use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::Config;
use crate::storage::error::StorageError;
use crate::storage::snapshot::{
    read_manifest, snapshot_file_name, write_manifest, Manifest, SnapshotReader, SnapshotWriter,
};
use crate::storage::store::Store;
use crate::storage::types::now_ms;

const SNAP_PREFIX: &str = "snap-";
const SNAP_SUFFIX: &str = ".osnap";

/// Take a snapshot at least this often even if the WAL stays small.
const SNAPSHOT_INTERVAL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug)]
struct State {
    snap_index: u64,
    last_snapshot_ms: i64,
}

/// Decides when a snapshot is due and owns the create / load / cleanup
/// machinery around `snap-NNNNNNNN.osnap` files and the manifest.
#[derive(Debug)]
pub struct SnapshotManager {
    data_dir: PathBuf,
    wal_max_bytes: u64,
    state: Mutex<State>,
    snapshotting: AtomicBool,
}

impl SnapshotManager {
    pub fn new(cfg: &Config) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&cfg.data_dir)?;

        let existing = list_snapshot_files(&cfg.data_dir)?;
        let snap_index = match existing.last() {
            Some(name) => extract_index(name)? + 1,
            None => 1,
        };

        Ok(Self {
            data_dir: cfg.data_dir.clone(),
            wal_max_bytes: cfg.wal_max_bytes,
            state: Mutex::new(State {
                snap_index,
                last_snapshot_ms: now_ms(),
            }),
            snapshotting: AtomicBool::new(false),
        })
    }

    /// A snapshot is due when the WAL outgrew its size limit, when dead
    /// bytes dominate live ones, or when enough wall time has passed.
    pub fn needs_snapshot(&self, wal_size: u64, live_bytes: i64, dead_bytes: i64) -> bool {
        if wal_size > self.wal_max_bytes {
            return true;
        }
        if dead_bytes > 0 && (live_bytes as f64) / (dead_bytes as f64) < 0.5 {
            return true;
        }
        let last = self.state.lock().last_snapshot_ms;
        now_ms() - last > SNAPSHOT_INTERVAL_MS
    }

    /// Write a point-in-time image of the store and publish a manifest
    /// pointing at it. `current_wal` becomes the manifest's `next_wal`:
    /// recovery replays that segment and everything after it.
    ///
    /// Single-shot: a second call while one is running fails with
    /// `SnapshotInProgress`. A failed attempt leaves the previous manifest
    /// in place.
    pub fn create_snapshot(&self, store: &Store, current_wal: &str) -> Result<(), StorageError> {
        if self
            .snapshotting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StorageError::SnapshotInProgress);
        }
        let result = self.create_snapshot_inner(store, current_wal);
        self.snapshotting.store(false, Ordering::Release);
        result
    }

    fn create_snapshot_inner(&self, store: &Store, current_wal: &str) -> Result<(), StorageError> {
        let snap_index = self.state.lock().snap_index;
        let started = std::time::Instant::now();

        let snap_file = snapshot_file_name(snap_index);
        let final_path = self.data_dir.join(&snap_file);
        let temp_path = self.data_dir.join(format!("{snap_file}.tmp"));

        let mut writer = SnapshotWriter::create(&temp_path)?;
        let write_result =
            store.for_each_live(|key, entry| writer.write_entry(key, entry));

        let count = match write_result.and_then(|_| writer.close()) {
            Ok(count) => count,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        if let Err(e) = std::fs::rename(&temp_path, &final_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        write_manifest(
            &self.data_dir,
            &Manifest {
                version: 1,
                snap: snap_file.clone(),
                next_wal: current_wal.to_string(),
                created_ms: now_ms(),
            },
        )?;

        let mut state = self.state.lock();
        state.snap_index += 1;
        state.last_snapshot_ms = now_ms();

        tracing::info!(
            snapshot = %snap_file,
            entries = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "snapshot completed"
        );
        Ok(())
    }

    /// Load the snapshot the manifest names straight into the store's map,
    /// skipping entries that expired on disk. Returns the manifest's
    /// `next_wal`, or an empty string when there is no snapshot yet.
    pub fn load_snapshot(&self, store: &Store) -> Result<String, StorageError> {
        let Some(manifest) = read_manifest(&self.data_dir)? else {
            return Ok(String::new());
        };

        let path = self.data_dir.join(&manifest.snap);
        let mut reader = SnapshotReader::open(&path)?;

        let mut loaded = 0u64;
        while let Some((key, entry)) = reader.next_entry()? {
            if !entry.is_expired() {
                store.insert_recovered(key, entry);
                loaded += 1;
            }
        }

        tracing::info!(snapshot = %manifest.snap, entries = loaded, "snapshot loaded");
        Ok(manifest.next_wal)
    }

    /// Remove every snapshot except the newest.
    pub fn cleanup_old(&self) -> Result<(), StorageError> {
        let files = list_snapshot_files(&self.data_dir)?;
        if files.len() <= 1 {
            return Ok(());
        }
        for file in &files[..files.len() - 1] {
            let path = self.data_dir.join(file);
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(snapshot = %file, "removed old snapshot"),
                Err(e) => tracing::warn!(snapshot = %file, error = %e, "failed to remove old snapshot"),
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let total = list_snapshot_files(&self.data_dir)
            .map(|f| f.len())
            .unwrap_or(0);
        out.insert("snapshots_total".to_string(), total.to_string());
        out.insert(
            "last_snapshot_ms".to_string(),
            self.state.lock().last_snapshot_ms.to_string(),
        );
        out
    }
}

fn list_snapshot_files(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(SNAP_PREFIX) && name.ends_with(SNAP_SUFFIX) {
                files.push(name.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}

fn extract_index(name: &str) -> Result<u64, StorageError> {
    name.strip_prefix(SNAP_PREFIX)
        .and_then(|s| s.strip_suffix(SNAP_SUFFIX))
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| StorageError::InvalidSnapshot(format!("bad filename: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::SetOptions;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn trigger_conditions() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            wal_max_bytes: 1000,
            ..config_for(&dir)
        };
        let manager = SnapshotManager::new(&cfg).unwrap();

        // Fresh manager: nothing due
        assert!(!manager.needs_snapshot(100, 500, 100));
        // WAL over its size limit
        assert!(manager.needs_snapshot(1001, 500, 100));
        // Dead bytes dominate
        assert!(manager.needs_snapshot(100, 100, 300));
        // Time-based trigger
        manager.state.lock().last_snapshot_ms = now_ms() - SNAPSHOT_INTERVAL_MS - 1;
        assert!(manager.needs_snapshot(0, 0, 0));
    }

    #[test]
    fn create_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);
        let manager = SnapshotManager::new(&cfg).unwrap();

        let store = Store::new(&cfg);
        store.set("a", b"one".to_vec(), SetOptions::default()).unwrap();
        store.set("b", b"two".to_vec(), SetOptions::default()).unwrap();
        store.set("b", b"three".to_vec(), SetOptions::default()).unwrap();

        manager
            .create_snapshot(&store, "wal-00000004.oswal")
            .unwrap();
        assert!(dir.path().join("snap-00000001.osnap").exists());

        let restored = Store::new(&cfg);
        let next_wal = manager.load_snapshot(&restored).unwrap();
        assert_eq!(next_wal, "wal-00000004.oswal");
        assert_eq!(restored.get("a").unwrap().value, b"one");
        let b = restored.get("b").unwrap();
        assert_eq!(b.value, b"three");
        assert_eq!(b.version, 2);
    }

    #[test]
    fn load_without_manifest_returns_empty_next_wal() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);
        let manager = SnapshotManager::new(&cfg).unwrap();
        let store = Store::new(&cfg);
        assert_eq!(manager.load_snapshot(&store).unwrap(), "");
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn cleanup_keeps_only_newest() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);
        let manager = SnapshotManager::new(&cfg).unwrap();
        let store = Store::new(&cfg);
        store.set("k", b"v".to_vec(), SetOptions::default()).unwrap();

        manager.create_snapshot(&store, "wal-00000001.oswal").unwrap();
        manager.create_snapshot(&store, "wal-00000002.oswal").unwrap();
        manager.create_snapshot(&store, "wal-00000003.oswal").unwrap();

        manager.cleanup_old().unwrap();
        let left = list_snapshot_files(dir.path()).unwrap();
        assert_eq!(left, vec!["snap-00000003.osnap"]);

        // The manifest still points at the survivor
        let manifest = read_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.snap, "snap-00000003.osnap");
    }

    #[test]
    fn index_resumes_past_existing_snapshots() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("snap-00000009.osnap"), b"").unwrap();
        let manager = SnapshotManager::new(&config_for(&dir)).unwrap();
        assert_eq!(manager.state.lock().snap_index, 10);
    }
}
