use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::wal::error::WalError;
use crate::wal::record::{self, OpType, WalRecord, HEADER_LEN, WAL_MAGIC, WAL_VERSION};

/// Streams records out of one segment file.
///
/// Every error a read can hit (short file, bad magic, bad version, CRC
/// mismatch) means the same thing to the caller: replay of this segment
/// stops here. The records before the damage were already applied; the
/// bytes after it are unreachable.
#[derive(Debug)]
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// Read the next record. `Ok(None)` signals a clean end of stream: EOF
    /// exactly on a record boundary.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>, WalError> {
        let mut header = [0u8; HEADER_LEN];
        if !read_or_eof(&mut self.reader, &mut header)? {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != WAL_MAGIC {
            return Err(WalError::InvalidMagic);
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != WAL_VERSION {
            return Err(WalError::InvalidVersion(version));
        }

        let op_byte = header[6];
        let op = OpType::from_u8(op_byte).ok_or(WalError::UnknownRecordType(op_byte))?;

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
        let rec_version = u64::from_le_bytes([
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

        let actual = record::body_crc(op_byte, &key, &value, expiry_ms, rec_version);
        if actual != expected {
            return Err(WalError::CorruptedRecord);
        }

        Ok(Some(WalRecord {
            op,
            key: record::parse_key(key)?,
            value,
            expiry_ms,
            version: rec_version,
        }))
    }
}

/// Fill `buf` completely, or report a clean EOF if not even one byte was
/// available. A partial fill is an `UnexpectedEof` I/O error, which the
/// replay loop treats as a truncated trailing record.
fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WalError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(WalError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated record header",
            )));
        }
        filled += n;
    }
    Ok(true)
}
