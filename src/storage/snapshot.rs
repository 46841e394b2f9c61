use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::storage::error::StorageError;
use crate::storage::types::Entry;

pub const SNAP_MAGIC: u32 = 0x4F53_5053; // 'OSPS'
pub const SNAP_VERSION: u16 = 1;

/// magic(4) + version(2) + count(8). The count sits at offset 6 and is
/// patched when the writer closes.
const SNAP_HEADER_LEN: usize = 14;
const COUNT_OFFSET: u64 = 6;

/// Points recovery at the newest snapshot and the first WAL segment whose
/// records are not fully contained in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub snap: String,
    pub next_wal: String,
    pub created_ms: i64,
}

/// Serializes live entries into a `snap-NNNNNNNN.osnap` file.
///
/// Records share the WAL layout minus the per-record magic and type tag;
/// the single file header stands in for both.
pub struct SnapshotWriter {
    writer: BufWriter<File>,
    count: u64,
}

impl SnapshotWriter {
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = BytesMut::with_capacity(SNAP_HEADER_LEN);
        header.put_u32_le(SNAP_MAGIC);
        header.put_u16_le(SNAP_VERSION);
        header.put_u64_le(0); // patched on close
        writer.write_all(&header)?;

        Ok(Self { writer, count: 0 })
    }

    /// Write one entry, unless it has expired since the iteration started.
    pub fn write_entry(&mut self, key: &str, entry: &Entry) -> Result<(), StorageError> {
        if entry.is_expired() {
            return Ok(());
        }

        let key_bytes = key.as_bytes();
        let record_len = 4 + 4 + 8 + 8 + key_bytes.len() + entry.value.len();
        let mut record = BytesMut::with_capacity(record_len + 4);

        record.put_u32_le(key_bytes.len() as u32);
        record.put_u32_le(entry.value.len() as u32);
        record.put_i64_le(entry.expiry_ms);
        record.put_u64_le(entry.version);
        record.put_slice(key_bytes);
        record.put_slice(&entry.value);

        let crc = crc32c::crc32c(&record);
        record.put_u32_le(crc);

        self.writer.write_all(&record)?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Patch the entry count into the header, fsync and close.
    pub fn close(self) -> Result<u64, StorageError> {
        let count = self.count;
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;

        file.seek(SeekFrom::Start(COUNT_OFFSET))?;
        file.write_all(&count.to_le_bytes())?;
        file.sync_all()?;
        Ok(count)
    }
}

/// Streams `(key, Entry)` pairs back out of a snapshot file, verifying each
/// record's checksum. Exactly `count` records are yielded.
pub struct SnapshotReader {
    reader: BufReader<File>,
    count: u64,
    read: u64,
}

impl SnapshotReader {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; SNAP_HEADER_LEN];
        reader.read_exact(&mut header)?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != SNAP_MAGIC {
            return Err(StorageError::InvalidSnapshot(format!(
                "bad magic: {magic:#x}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != SNAP_VERSION {
            return Err(StorageError::InvalidSnapshot(format!(
                "unsupported version: {version}"
            )));
        }

        let count = u64::from_le_bytes([
            header[6], header[7], header[8], header[9], header[10], header[11], header[12],
            header[13],
        ]);

        Ok(Self {
            reader,
            count,
            read: 0,
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<(String, Entry)>, StorageError> {
        if self.read >= self.count {
            return Ok(None);
        }

        let mut lengths = [0u8; 8];
        self.reader.read_exact(&mut lengths)?;
        let key_len = u32::from_le_bytes([lengths[0], lengths[1], lengths[2], lengths[3]]) as usize;
        let value_len =
            u32::from_le_bytes([lengths[4], lengths[5], lengths[6], lengths[7]]) as usize;

        let mut meta = [0u8; 16];
        self.reader.read_exact(&mut meta)?;
        let expiry_ms = i64::from_le_bytes([
            meta[0], meta[1], meta[2], meta[3], meta[4], meta[5], meta[6], meta[7],
        ]);
        let version = u64::from_le_bytes([
            meta[8], meta[9], meta[10], meta[11], meta[12], meta[13], meta[14], meta[15],
        ]);

        let mut key = vec![0u8; key_len];
        self.reader.read_exact(&mut key)?;
        let mut value = vec![0u8; value_len];
        if value_len > 0 {
            self.reader.read_exact(&mut value)?;
        }

        let mut crc_bytes = [0u8; 4];
        self.reader.read_exact(&mut crc_bytes)?;
        let expected = u32::from_le_bytes(crc_bytes);

        let mut body = BytesMut::with_capacity(8 + 16 + key_len + value_len);
        body.put_slice(&lengths);
        body.put_slice(&meta);
        body.put_slice(&key);
        body.put_slice(&value);
        if crc32c::crc32c(&body) != expected {
            return Err(StorageError::CorruptedSnapshot);
        }

        let key = String::from_utf8(key).map_err(|_| StorageError::CorruptedSnapshot)?;
        self.read += 1;
        Ok(Some((key, Entry::new(value, version, expiry_ms))))
    }
}

/// Write the manifest atomically: temp file, directory fsync, rename.
pub fn write_manifest(data_dir: &Path, manifest: &Manifest) -> Result<(), StorageError> {
    let temp_path = data_dir.join("MANIFEST.tmp");
    let final_path = data_dir.join("MANIFEST.json");

    let data = serde_json::to_vec_pretty(manifest)?;

    let mut file = File::create(&temp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    // Make the temp entry durable before the rename swaps it in
    File::open(data_dir)?.sync_all()?;

    std::fs::rename(&temp_path, &final_path)?;
    Ok(())
}

/// Read the manifest. `None` means no snapshot has been taken yet.
pub fn read_manifest(data_dir: &Path) -> Result<Option<Manifest>, StorageError> {
    let path = data_dir.join("MANIFEST.json");
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let manifest = serde_json::from_slice(&data)?;
    Ok(Some(manifest))
}

pub fn snapshot_file_name(index: u64) -> String {
    format!("snap-{index:08}.osnap")
}
