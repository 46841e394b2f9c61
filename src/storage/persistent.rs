use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::config::Config;
use crate::storage::error::StorageError;
use crate::storage::snapshot_manager::SnapshotManager;
use crate::storage::store::Store;
use crate::storage::types::{Entry, SetOptions};
use crate::wal::{OpType, WalManager, WalReader, WalRecord};

/// How often the snapshot worker re-evaluates the trigger.
const SNAPSHOT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// [`Store`] plus durability: every mutation commits to memory and appends a
/// WAL record under one mutation mutex, recovery replays snapshot + WAL at
/// startup, and two background tasks (expiry sweeper, snapshot worker) run
/// until shutdown.
///
/// Memory commits first, then the log. If the append fails the in-memory
/// change is rolled back best-effort; see DESIGN.md for the DELETE caveat.
pub struct PersistentStore {
    cfg: Config,
    store: Arc<Store>,
    wal: Arc<WalManager>,
    snapshots: Arc<SnapshotManager>,

    /// Serializes all mutations so memory order and WAL order agree.
    mutation: tokio::sync::Mutex<()>,

    sweeping: AtomicBool,
    snapshot_paused: AtomicBool,
    shutdown: parking_lot::Mutex<Vec<oneshot::Sender<()>>>,
}

impl PersistentStore {
    /// Open the data directory, run recovery and start the background
    /// tasks.
    pub async fn open(cfg: Config) -> Result<Arc<Self>, StorageError> {
        let wal = Arc::new(WalManager::new(&cfg)?);
        let snapshots = Arc::new(SnapshotManager::new(&cfg)?);
        let store = Arc::new(Store::new(&cfg));

        let ps = Arc::new(Self {
            cfg,
            store,
            wal,
            snapshots,
            mutation: tokio::sync::Mutex::new(()),
            sweeping: AtomicBool::new(false),
            snapshot_paused: AtomicBool::new(false),
            shutdown: parking_lot::Mutex::new(Vec::new()),
        });

        ps.recover()?;

        let sweeper_tx = ps.spawn_sweeper();
        let snapshot_tx = ps.spawn_snapshot_worker();
        {
            let mut shutdown = ps.shutdown.lock();
            shutdown.push(sweeper_tx);
            shutdown.push(snapshot_tx);
        }

        Ok(ps)
    }

    // ----- reads (no WAL involvement) -----

    pub fn get(&self, key: &str) -> Result<Entry, StorageError> {
        self.store.get(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.store.exists(key)
    }

    pub fn ttl(&self, key: &str) -> i64 {
        self.store.ttl(key)
    }

    pub fn stats(&self) -> BTreeMap<String, String> {
        self.store.stats()
    }

    pub async fn wal_stats(&self) -> BTreeMap<String, String> {
        let mut out = self.snapshots.stats();
        out.insert("wal_current".to_string(), self.wal.current_name().await);
        out
    }

    /// True while the snapshot worker holds writers off; the dispatcher
    /// answers BUSY instead of mutating.
    pub fn is_snapshot_paused(&self) -> bool {
        self.snapshot_paused.load(Ordering::Acquire)
    }

    // ----- mutations -----

    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        opts: SetOptions,
    ) -> Result<u64, StorageError> {
        let _guard = self.mutation.lock().await;

        let (version, expiry_ms) = self.store.set(key, value.clone(), opts)?;

        let record = WalRecord {
            op: OpType::Set,
            key: key.to_string(),
            value,
            expiry_ms,
            version,
        };
        if let Err(e) = self.wal.append(&record).await {
            self.store.delete(key);
            return Err(e.into());
        }

        Ok(version)
    }

    /// Returns whether a live key was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.mutation.lock().await;

        let Some(version) = self.store.delete(key) else {
            return false;
        };

        let record = WalRecord {
            op: OpType::Del,
            key: key.to_string(),
            value: Vec::new(),
            expiry_ms: -1,
            version,
        };
        if let Err(e) = self.wal.append(&record).await {
            // The in-memory delete stands; the missing tombstone can
            // resurrect the key if we crash before the next snapshot.
            tracing::error!(key, error = %e, "WAL append failed for DEL");
        }

        true
    }

    pub async fn expire(&self, key: &str, ttl_ms: i64) -> Result<(), StorageError> {
        let _guard = self.mutation.lock().await;

        let (expiry_ms, version) = self.store.expire(key, ttl_ms)?;

        let record = WalRecord {
            op: OpType::Expire,
            key: key.to_string(),
            value: Vec::new(),
            expiry_ms,
            version,
        };
        if let Err(e) = self.wal.append(&record).await {
            self.store.apply_recovered_expiry(key, -1);
            return Err(e.into());
        }

        Ok(())
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, StorageError> {
        let _guard = self.mutation.lock().await;

        let (new_val, version) = self.store.incr(key, delta)?;

        // Logged as a plain SET of the resulting integer
        let record = WalRecord {
            op: OpType::Set,
            key: key.to_string(),
            value: new_val.to_string().into_bytes(),
            expiry_ms: -1,
            version,
        };
        if let Err(e) = self.wal.append(&record).await {
            self.store.delete(key);
            return Err(e.into());
        }

        Ok(new_val)
    }

    /// Signal the background tasks and flush the WAL. Safe to call once at
    /// shutdown; mutations issued afterwards still work but are no longer
    /// swept or snapshotted.
    pub async fn close(&self) {
        for tx in self.shutdown.lock().drain(..) {
            let _ = tx.send(());
        }
        if let Err(e) = self.wal.close().await {
            tracing::error!(error = %e, "failed to sync WAL on close");
        }
    }

    // ----- recovery -----

    fn recover(&self) -> Result<(), StorageError> {
        let next_wal = self.snapshots.load_snapshot(&self.store)?;

        let segments = self.wal.segments_from(&next_wal)?;
        tracing::info!(segments = segments.len(), "recovering from WAL");

        for path in &segments {
            self.replay_segment(path);
        }

        self.store.rebuild_expiry_heap();
        Ok(())
    }

    /// Apply every readable record of one segment. The first unreadable
    /// record truncates replay of this segment only: a crash mid-append
    /// leaves garbage after the last fsync'd record, and everything before
    /// it is still good.
    fn replay_segment(&self, path: &Path) {
        let mut reader = match WalReader::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot open WAL segment");
                return;
            }
        };

        let mut count = 0usize;
        loop {
            match reader.next_record() {
                Ok(Some(record)) => {
                    self.apply_record(record);
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        records = count,
                        error = %e,
                        "truncating WAL replay"
                    );
                    break;
                }
            }
        }

        tracing::info!(path = %path.display(), records = count, "replayed WAL segment");
    }

    fn apply_record(&self, record: WalRecord) {
        match record.op {
            OpType::Set => {
                let entry = Entry::new(record.value, record.version, record.expiry_ms);
                self.store.insert_recovered(record.key, entry);
            }
            OpType::Del => self.store.remove_recovered(&record.key),
            OpType::Expire => self
                .store
                .apply_recovered_expiry(&record.key, record.expiry_ms),
        }
    }

    // ----- background tasks -----

    fn spawn_sweeper(self: &Arc<Self>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        let ps = Arc::clone(self);
        let interval = ps.cfg.sweep_interval();

        tokio::spawn(async move {
            tokio::pin!(rx);
            loop {
                tokio::select! {
                    _ = sleep(interval) => ps.sweep_expired().await,
                    _ = &mut rx => {
                        tracing::info!("expiry sweeper shutting down");
                        break;
                    }
                }
            }
        });

        tx
    }

    /// One sweep tick. A CAS guard keeps ticks from piling up if a sweep
    /// outlives the interval. Tombstones are appended after the store lock
    /// is released; a tombstone lost to a crash only means replay restores
    /// an expired entry that the next sweep reaps again.
    async fn sweep_expired(&self) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let evicted = self.store.sweep_expired(self.cfg.sweep_batch);
        if !evicted.is_empty() {
            let _guard = self.mutation.lock().await;
            for (key, version) in &evicted {
                let record = WalRecord {
                    op: OpType::Del,
                    key: key.clone(),
                    value: Vec::new(),
                    expiry_ms: -1,
                    version: *version,
                };
                if let Err(e) = self.wal.append(&record).await {
                    tracing::error!(key = %key, error = %e, "failed to log expiry deletion");
                }
            }
            tracing::debug!(deleted = evicted.len(), "expiry sweep");
        }

        self.sweeping.store(false, Ordering::Release);
    }

    fn spawn_snapshot_worker(self: &Arc<Self>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        let ps = Arc::clone(self);

        tokio::spawn(async move {
            tokio::pin!(rx);
            loop {
                tokio::select! {
                    _ = sleep(SNAPSHOT_CHECK_INTERVAL) => ps.maybe_snapshot().await,
                    _ = &mut rx => {
                        tracing::info!("snapshot worker shutting down");
                        break;
                    }
                }
            }
        });

        tx
    }

    async fn maybe_snapshot(&self) {
        if !self.cfg.enable_snapshot {
            return;
        }

        let wal_size = self.wal.current_size().await;
        // Coarse occupancy estimate: entry count times a nominal record size
        let live_bytes = self.store.entry_count() as i64 * 1000;
        let dead_bytes = wal_size as i64 - live_bytes;

        if !self.snapshots.needs_snapshot(wal_size, live_bytes, dead_bytes) {
            return;
        }

        if let Err(e) = self.run_snapshot().await {
            tracing::error!(error = %e, "snapshot failed");
        }
    }

    /// Full compaction cycle: pause writers, image the store, rotate the
    /// WAL, drop files recovery no longer needs. A failure anywhere leaves
    /// the previous manifest in charge; the next tick retries.
    pub async fn run_snapshot(&self) -> Result<(), StorageError> {
        self.snapshot_paused.store(true, Ordering::Release);
        let result = self.snapshot_cycle().await;
        self.snapshot_paused.store(false, Ordering::Release);
        result
    }

    async fn snapshot_cycle(&self) -> Result<(), StorageError> {
        let pause_start = Instant::now();
        let current_wal = self.wal.current_name().await;

        let store = Arc::clone(&self.store);
        let snapshots = Arc::clone(&self.snapshots);
        let wal_name = current_wal.clone();
        let created = tokio::task::spawn_blocking(move || {
            snapshots.create_snapshot(&store, &wal_name)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        let paused = pause_start.elapsed();
        if paused > self.cfg.busy_warn() {
            tracing::warn!(
                paused_ms = paused.as_millis() as u64,
                "snapshot pause exceeded threshold"
            );
        }

        created?;

        self.wal.rotate().await?;

        if let Err(e) = self.snapshots.cleanup_old() {
            tracing::warn!(error = %e, "failed to clean up old snapshots");
        }
        if let Err(e) = self.wal.delete_older_than(&current_wal) {
            tracing::warn!(error = %e, "failed to delete old WAL segments");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::SyncPolicy;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Always,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mutations_survive_restart() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            ps.set("a", b"one".to_vec(), SetOptions::default()).await.unwrap();
            ps.set("b", b"two".to_vec(), SetOptions::default()).await.unwrap();
            ps.set("a", b"three".to_vec(), SetOptions::default()).await.unwrap();
            assert!(ps.delete("b").await);
            ps.incr("counter", 5).await.unwrap();
            ps.close().await;
        }

        let ps = PersistentStore::open(cfg).await.unwrap();
        let a = ps.get("a").unwrap();
        assert_eq!(a.value, b"three");
        assert_eq!(a.version, 2);
        assert!(!ps.exists("b"));
        assert_eq!(ps.get("counter").unwrap().value, b"5");
    }

    #[tokio::test]
    async fn expire_survives_restart() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            ps.set("k", b"v".to_vec(), SetOptions::default()).await.unwrap();
            ps.expire("k", 60_000).await.unwrap();
            ps.close().await;
        }

        let ps = PersistentStore::open(cfg).await.unwrap();
        let ttl = ps.ttl("k");
        assert!(ttl > 0 && ttl <= 60_000);
        // EXPIRE leaves the version alone
        assert_eq!(ps.get("k").unwrap().version, 1);
    }

    #[tokio::test]
    async fn truncated_wal_tail_recovers_earlier_records() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            for i in 0..10 {
                ps.set(&format!("k{i}"), vec![i as u8], SetOptions::default())
                    .await
                    .unwrap();
            }
            ps.close().await;
        }

        // Chop 4 bytes off the tail of the only populated segment
        let wal_path = dir.path().join("wal-00000001.oswal");
        let len = std::fs::metadata(&wal_path).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&wal_path)
            .unwrap()
            .set_len(len - 4)
            .unwrap();

        let ps = PersistentStore::open(cfg).await.unwrap();
        for i in 0..9 {
            assert!(ps.exists(&format!("k{i}")), "k{i} should have survived");
        }
        assert!(!ps.exists("k9"), "the damaged record must not apply");
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            ps.set("x", b"1".to_vec(), SetOptions::default()).await.unwrap();
            ps.incr("n", 7).await.unwrap();
            ps.close().await;
        }

        let first = {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            let out = (ps.get("x").unwrap(), ps.get("n").unwrap());
            ps.close().await;
            out
        };
        let second = {
            let ps = PersistentStore::open(cfg).await.unwrap();
            let out = (ps.get("x").unwrap(), ps.get("n").unwrap());
            ps.close().await;
            out
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn snapshot_cycle_compacts_and_preserves_state() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        let ps = PersistentStore::open(cfg.clone()).await.unwrap();
        for i in 0..50 {
            ps.set(&format!("key{i}"), format!("value{i}").into_bytes(), SetOptions::default())
                .await
                .unwrap();
        }
        ps.run_snapshot().await.unwrap();
        assert!(!ps.is_snapshot_paused());

        // One snapshot, and only the post-rotation segment remains
        let mut snaps = 0;
        let mut wals = 0;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            if name.ends_with(".osnap") {
                snaps += 1;
            }
            if name.ends_with(".oswal") {
                wals += 1;
            }
        }
        assert_eq!(snaps, 1);
        assert_eq!(wals, 2); // the manifest's next_wal plus the fresh one
        ps.close().await;

        let ps = PersistentStore::open(cfg).await.unwrap();
        for i in 0..50 {
            assert_eq!(
                ps.get(&format!("key{i}")).unwrap().value,
                format!("value{i}").into_bytes()
            );
        }
    }

    #[tokio::test]
    async fn writes_after_snapshot_replay_on_top_of_it() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            ps.set("stable", b"snap".to_vec(), SetOptions::default()).await.unwrap();
            ps.run_snapshot().await.unwrap();
            ps.set("later", b"wal".to_vec(), SetOptions::default()).await.unwrap();
            ps.set("stable", b"newer".to_vec(), SetOptions::default()).await.unwrap();
            ps.close().await;
        }

        let ps = PersistentStore::open(cfg).await.unwrap();
        assert_eq!(ps.get("stable").unwrap().value, b"newer");
        assert_eq!(ps.get("stable").unwrap().version, 2);
        assert_eq!(ps.get("later").unwrap().value, b"wal");
    }

    #[tokio::test]
    async fn swept_keys_stay_gone_after_restart() {
        let dir = TempDir::new().unwrap();
        let cfg = config_for(&dir);

        {
            let ps = PersistentStore::open(cfg.clone()).await.unwrap();
            let opts = SetOptions {
                expiry_ms: 20,
                ..Default::default()
            };
            ps.set("ephemeral", b"v".to_vec(), opts).await.unwrap();
            sleep(Duration::from_millis(50)).await;
            ps.sweep_expired().await;
            assert!(!ps.exists("ephemeral"));
            ps.close().await;
        }

        let ps = PersistentStore::open(cfg).await.unwrap();
        assert!(!ps.exists("ephemeral"));
    }
}
