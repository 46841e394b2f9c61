use std::collections::BTreeMap;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writers for the response grammar. Every response line ends with `\r\n`;
/// value payloads are raw bytes followed by their own `\r\n`. Callers flush
/// once per command, not per line.

pub async fn write_pong<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
    w.write_all(b"PONG\r\n").await
}

pub async fn write_ok<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
    w.write_all(b"OK\r\n").await
}

pub async fn write_ok_version<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: u64,
) -> std::io::Result<()> {
    w.write_all(format!("OK {version}\r\n").as_bytes()).await
}

pub async fn write_ok_count<W: AsyncWrite + Unpin>(w: &mut W, count: usize) -> std::io::Result<()> {
    w.write_all(format!("OK {count}\r\n").as_bytes()).await
}

pub async fn write_not_found<W: AsyncWrite + Unpin>(w: &mut W) -> std::io::Result<()> {
    w.write_all(b"NOT_FOUND\r\n").await
}

pub async fn write_not_found_key<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &str,
) -> std::io::Result<()> {
    w.write_all(format!("NOT_FOUND {key}\r\n").as_bytes()).await
}

pub async fn write_value<W: AsyncWrite + Unpin>(
    w: &mut W,
    version: u64,
    expiry_ms: i64,
    value: &[u8],
) -> std::io::Result<()> {
    w.write_all(format!("VALUE {} {} {}\r\n", value.len(), version, expiry_ms).as_bytes())
        .await?;
    w.write_all(value).await?;
    w.write_all(b"\r\n").await
}

/// MGET variant: the key is echoed so responses line up with the request.
pub async fn write_value_for_key<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &str,
    version: u64,
    expiry_ms: i64,
    value: &[u8],
) -> std::io::Result<()> {
    w.write_all(
        format!("VALUE {} {} {} {}\r\n", key, value.len(), version, expiry_ms).as_bytes(),
    )
    .await?;
    w.write_all(value).await?;
    w.write_all(b"\r\n").await
}

pub async fn write_deleted<W: AsyncWrite + Unpin>(w: &mut W, deleted: bool) -> std::io::Result<()> {
    w.write_all(format!("DELETED {}\r\n", deleted as u8).as_bytes())
        .await
}

pub async fn write_exists<W: AsyncWrite + Unpin>(w: &mut W, exists: bool) -> std::io::Result<()> {
    w.write_all(format!("EXISTS {}\r\n", exists as u8).as_bytes())
        .await
}

/// TTL, INCR and DECR responses are a bare integer line.
pub async fn write_int<W: AsyncWrite + Unpin>(w: &mut W, value: i64) -> std::io::Result<()> {
    w.write_all(format!("{value}\r\n").as_bytes()).await
}

pub async fn write_stats<W: AsyncWrite + Unpin>(
    w: &mut W,
    stats: &BTreeMap<String, String>,
) -> std::io::Result<()> {
    for (key, value) in stats {
        w.write_all(format!("{key}={value}\r\n").as_bytes()).await?;
    }
    w.write_all(b"END\r\n").await
}

pub async fn write_error<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: &str,
    message: &str,
) -> std::io::Result<()> {
    w.write_all(format!("ERR {code} {message}\r\n").as_bytes())
        .await
}
