use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::wal::error::WalError;
use crate::wal::record::WalRecord;

/// When the segment fsyncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every record.
    Always,
    /// fsync once enough time has passed or enough bytes accumulated.
    Batch,
    /// Never fsync explicitly; the OS flushes on its own schedule.
    Os,
}

/// Knobs for the `batch` policy.
#[derive(Debug, Clone, Copy)]
pub struct BatchWindow {
    pub max_delay: Duration,
    pub max_bytes: u64,
}

impl Default for BatchWindow {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_millis(100),
            max_bytes: 1024 * 1024,
        }
    }
}

/// One append-only log file, `wal-NNNNNNNN.oswal`.
#[derive(Debug)]
pub struct WalSegment {
    file: File,
    name: String,
    path: PathBuf,
    size: u64,
    max_bytes: u64,
    policy: SyncPolicy,
    batch: BatchWindow,
    last_sync: Instant,
    bytes_since_sync: u64,
}

pub fn segment_file_name(index: u64) -> String {
    format!("wal-{index:08}.oswal")
}

impl WalSegment {
    /// Open (or create) the segment at `index`, appending at the end if it
    /// already has content.
    pub fn open(
        dir: &Path,
        index: u64,
        max_bytes: u64,
        policy: SyncPolicy,
        batch: BatchWindow,
    ) -> Result<Self, WalError> {
        let name = segment_file_name(index);
        let path = dir.join(&name);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            file,
            name,
            path,
            size,
            max_bytes,
            policy,
            batch,
            last_sync: Instant::now(),
            bytes_since_sync: 0,
        })
    }

    /// Serialize and write one record, then apply the sync policy. Returns
    /// once the bytes (and the fsync, if the policy demanded one) are done.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let data = record.encode();
        self.file.write_all(&data)?;
        self.size += data.len() as u64;
        self.bytes_since_sync += data.len() as u64;
        self.maybe_sync()
    }

    fn maybe_sync(&mut self) -> Result<(), WalError> {
        match self.policy {
            SyncPolicy::Always => {
                self.file.sync_all()?;
                self.last_sync = Instant::now();
                self.bytes_since_sync = 0;
            }
            SyncPolicy::Batch => {
                if self.last_sync.elapsed() > self.batch.max_delay
                    || self.bytes_since_sync > self.batch.max_bytes
                {
                    self.file.sync_all()?;
                    self.last_sync = Instant::now();
                    self.bytes_since_sync = 0;
                }
            }
            SyncPolicy::Os => {}
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_bytes
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush outstanding writes before the segment is retired or the store
    /// shuts down. Skipped under the `os` policy.
    pub fn seal(&mut self) -> Result<(), WalError> {
        if self.policy != SyncPolicy::Os {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::OpType;
    use tempfile::TempDir;

    fn record(key: &str, value: &[u8]) -> WalRecord {
        WalRecord {
            op: OpType::Set,
            key: key.to_string(),
            value: value.to_vec(),
            expiry_ms: -1,
            version: 1,
        }
    }

    #[test]
    fn append_tracks_size() {
        let dir = TempDir::new().unwrap();
        let mut seg = WalSegment::open(
            dir.path(),
            1,
            1024,
            SyncPolicy::Os,
            BatchWindow::default(),
        )
        .unwrap();

        let rec = record("k", b"value");
        seg.append(&rec).unwrap();
        assert_eq!(seg.size(), rec.encoded_len() as u64);
        assert!(!seg.is_full());
    }

    #[test]
    fn reopen_resumes_at_existing_size() {
        let dir = TempDir::new().unwrap();
        let rec = record("k", b"value");
        {
            let mut seg = WalSegment::open(
                dir.path(),
                1,
                1024,
                SyncPolicy::Always,
                BatchWindow::default(),
            )
            .unwrap();
            seg.append(&rec).unwrap();
        }
        let seg = WalSegment::open(
            dir.path(),
            1,
            1024,
            SyncPolicy::Always,
            BatchWindow::default(),
        )
        .unwrap();
        assert_eq!(seg.size(), rec.encoded_len() as u64);
    }

    #[test]
    fn reports_full_at_max_bytes() {
        let dir = TempDir::new().unwrap();
        let mut seg = WalSegment::open(
            dir.path(),
            1,
            16,
            SyncPolicy::Os,
            BatchWindow::default(),
        )
        .unwrap();
        seg.append(&record("k", b"0123456789")).unwrap();
        assert!(seg.is_full());
    }

    #[test]
    fn segment_names_are_zero_padded() {
        assert_eq!(segment_file_name(1), "wal-00000001.oswal");
        assert_eq!(segment_file_name(42), "wal-00000042.oswal");
    }
}
