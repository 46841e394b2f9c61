use bytes::{BufMut, BytesMut};

use crate::wal::error::WalError;

/// First four bytes of every WAL record, little-endian.
pub const WAL_MAGIC: u32 = 0x4F53_5057; // 'OSPW'
pub const WAL_VERSION: u16 = 1;

/// Fixed-size prefix of a record: magic(4) + version(2) + type(1).
pub const HEADER_LEN: usize = 7;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Set = 0,
    Del = 1,
    Expire = 2,
}

impl OpType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpType::Set),
            1 => Some(OpType::Del),
            2 => Some(OpType::Expire),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// One logged mutation. DEL and EXPIRE records carry an empty value; every
/// record carries the entry's version and absolute expiry so replay can
/// reconstruct entries verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub op: OpType,
    pub key: String,
    pub value: Vec<u8>,
    pub expiry_ms: i64,
    pub version: u64,
}

impl WalRecord {
    /// Serialize to the on-disk layout, all fields little-endian:
    ///
    /// ```text
    /// magic(4) version(2) type(1) key_len(4) value_len(4)
    /// expiry_ms(8) version(8) key value crc32c(4)
    /// ```
    ///
    /// The CRC32C covers everything from the type byte through the end of
    /// the value.
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key.as_bytes();
        let total = HEADER_LEN + 4 + 4 + 8 + 8 + key.len() + self.value.len() + 4;
        let mut buf = BytesMut::with_capacity(total);

        buf.put_u32_le(WAL_MAGIC);
        buf.put_u16_le(WAL_VERSION);
        buf.put_u8(self.op.as_u8());
        buf.put_u32_le(key.len() as u32);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_i64_le(self.expiry_ms);
        buf.put_u64_le(self.version);
        buf.put_slice(key);
        buf.put_slice(&self.value);

        let crc = crc32c::crc32c(&buf[6..]);
        buf.put_u32_le(crc);

        buf.to_vec()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + 4 + 4 + 8 + 8 + self.key.len() + self.value.len() + 4
    }
}

/// Recompute the checksum for a record read back from disk. The body slice
/// is everything the CRC covers: type byte, lengths, metadata, key, value.
pub(crate) fn body_crc(
    op: u8,
    key: &[u8],
    value: &[u8],
    expiry_ms: i64,
    version: u64,
) -> u32 {
    let mut buf = BytesMut::with_capacity(1 + 4 + 4 + 8 + 8 + key.len() + value.len());
    buf.put_u8(op);
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    buf.put_i64_le(expiry_ms);
    buf.put_u64_le(version);
    buf.put_slice(key);
    buf.put_slice(value);
    crc32c::crc32c(&buf)
}

pub(crate) fn parse_key(raw: Vec<u8>) -> Result<String, WalError> {
    String::from_utf8(raw).map_err(|_| WalError::CorruptedRecord)
}
