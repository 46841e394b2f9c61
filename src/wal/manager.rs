use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::config::Config;
use crate::wal::error::WalError;
use crate::wal::record::WalRecord;
use crate::wal::segment::{segment_file_name, BatchWindow, SyncPolicy, WalSegment};

const WAL_PREFIX: &str = "wal-";
const WAL_SUFFIX: &str = ".oswal";

struct Current {
    segment: WalSegment,
    index: u64,
}

/// Owns the active segment and the directory of retired ones: discovery at
/// startup, rotation when the active segment fills, enumeration for replay,
/// deletion after a snapshot makes old segments redundant.
pub struct WalManager {
    data_dir: PathBuf,
    max_bytes: u64,
    policy: SyncPolicy,
    batch: BatchWindow,
    current: Mutex<Current>,
}

impl WalManager {
    /// Scan `data_dir` for existing segments and open a fresh one right
    /// after the highest index found (or at index 1 on a clean directory).
    /// Old segments are never appended to again; they exist only for replay.
    pub fn new(cfg: &Config) -> Result<Self, WalError> {
        std::fs::create_dir_all(&cfg.data_dir)?;

        let batch = BatchWindow {
            max_delay: std::time::Duration::from_millis(cfg.batch_fsync_ms),
            max_bytes: cfg.batch_fsync_bytes,
        };

        let existing = list_segment_files(&cfg.data_dir)?;
        let index = match existing.last() {
            Some(name) => extract_index(name)? + 1,
            None => 1,
        };

        let segment = WalSegment::open(&cfg.data_dir, index, cfg.wal_max_bytes, cfg.sync_policy, batch)?;
        tracing::info!(segment = %segment.name(), "opened WAL segment");

        Ok(Self {
            data_dir: cfg.data_dir.clone(),
            max_bytes: cfg.wal_max_bytes,
            policy: cfg.sync_policy,
            batch,
            current: Mutex::new(Current { segment, index }),
        })
    }

    /// Append one record, rotating first if the active segment is full.
    pub async fn append(&self, record: &WalRecord) -> Result<(), WalError> {
        let mut current = self.current.lock().await;
        if current.segment.is_full() {
            self.rotate_locked(&mut current)?;
        }
        current.segment.append(record)
    }

    /// Retire the active segment and open the next one. Returns the new
    /// segment's file name.
    pub async fn rotate(&self) -> Result<String, WalError> {
        let mut current = self.current.lock().await;
        self.rotate_locked(&mut current)?;
        Ok(current.segment.name().to_string())
    }

    fn rotate_locked(&self, current: &mut Current) -> Result<(), WalError> {
        current.segment.seal()?;
        current.index += 1;
        current.segment = WalSegment::open(
            &self.data_dir,
            current.index,
            self.max_bytes,
            self.policy,
            self.batch,
        )?;
        tracing::info!(segment = %current.segment.name(), "rotated WAL segment");
        Ok(())
    }

    pub async fn current_name(&self) -> String {
        self.current.lock().await.segment.name().to_string()
    }

    pub async fn current_size(&self) -> u64 {
        self.current.lock().await.segment.size()
    }

    /// fsync the active segment (per policy) ahead of shutdown.
    pub async fn close(&self) -> Result<(), WalError> {
        self.current.lock().await.segment.seal()
    }

    /// Segment paths to replay, starting at `start_name` inclusive, in index
    /// order. An empty `start_name` means all of them.
    pub fn segments_from(&self, start_name: &str) -> Result<Vec<PathBuf>, WalError> {
        let files = list_segment_files(&self.data_dir)?;

        let skip = if start_name.is_empty() {
            0
        } else {
            files
                .iter()
                .position(|f| f == start_name)
                .ok_or_else(|| WalError::StartNotFound(start_name.to_string()))?
        };

        Ok(files[skip..]
            .iter()
            .map(|f| self.data_dir.join(f))
            .collect())
    }

    /// Delete every segment strictly older than `keep_from_name`. The fixed-
    /// width numbering makes the lexicographic comparison numeric.
    pub fn delete_older_than(&self, keep_from_name: &str) -> Result<(), WalError> {
        for file in list_segment_files(&self.data_dir)? {
            if file.as_str() < keep_from_name {
                let path = self.data_dir.join(&file);
                std::fs::remove_file(&path)?;
                tracing::info!(segment = %file, "deleted old WAL segment");
            }
        }
        Ok(())
    }
}

fn list_segment_files(dir: &Path) -> Result<Vec<String>, WalError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(WAL_PREFIX) && name.ends_with(WAL_SUFFIX) {
                files.push(name.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}

fn extract_index(name: &str) -> Result<u64, WalError> {
    name.strip_prefix(WAL_PREFIX)
        .and_then(|s| s.strip_suffix(WAL_SUFFIX))
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| WalError::InvalidFileName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::OpType;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Os,
            ..Default::default()
        }
    }

    fn record(key: &str) -> WalRecord {
        WalRecord {
            op: OpType::Set,
            key: key.to_string(),
            value: b"value".to_vec(),
            expiry_ms: -1,
            version: 1,
        }
    }

    #[tokio::test]
    async fn starts_at_index_one_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        let manager = WalManager::new(&config_for(&dir)).unwrap();
        assert_eq!(manager.current_name().await, "wal-00000001.oswal");
    }

    #[tokio::test]
    async fn resumes_after_highest_existing_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("wal-00000003.oswal"), b"").unwrap();
        std::fs::write(dir.path().join("wal-00000007.oswal"), b"").unwrap();

        let manager = WalManager::new(&config_for(&dir)).unwrap();
        assert_eq!(manager.current_name().await, "wal-00000008.oswal");
    }

    #[tokio::test]
    async fn rotates_when_full() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            wal_max_bytes: 32,
            ..config_for(&dir)
        };
        let manager = WalManager::new(&cfg).unwrap();

        manager.append(&record("a")).await.unwrap();
        // Segment is now past max_bytes, so the next append rotates first
        manager.append(&record("b")).await.unwrap();
        assert_eq!(manager.current_name().await, "wal-00000002.oswal");
        assert!(dir.path().join("wal-00000001.oswal").exists());
    }

    #[tokio::test]
    async fn replay_enumeration_and_cleanup() {
        let dir = TempDir::new().unwrap();
        for i in 1..=4u64 {
            std::fs::write(dir.path().join(segment_file_name(i)), b"").unwrap();
        }
        let manager = WalManager::new(&config_for(&dir)).unwrap();

        let all = manager.segments_from("").unwrap();
        assert_eq!(all.len(), 5); // four on disk plus the freshly opened one

        let tail = manager.segments_from("wal-00000003.oswal").unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("wal-00000003.oswal"));

        assert!(matches!(
            manager.segments_from("wal-99999999.oswal"),
            Err(WalError::StartNotFound(_))
        ));

        manager.delete_older_than("wal-00000003.oswal").unwrap();
        let left = manager.segments_from("").unwrap();
        assert_eq!(left.len(), 3);
        assert!(left[0].ends_with("wal-00000003.oswal"));
    }
}
