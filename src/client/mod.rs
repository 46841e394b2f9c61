use std::collections::BTreeMap;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("connection closed by server")]
    ConnectionClosed,
}

/// A value returned by GET or MGET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub value: Vec<u8>,
    pub version: u64,
    pub expiry_ms: i64,
}

/// Line-protocol client. One outstanding request at a time; responses are
/// read in request order.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        })
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send_line("PING", &[]).await?;
        let line = self.read_line().await?;
        match line.as_str() {
            "PONG" => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Value>, ClientError> {
        self.send_line("GET", &[key]).await?;
        let line = self.read_line().await?;
        if line == "NOT_FOUND" {
            return Ok(None);
        }
        let (version, expiry_ms, len) = parse_value_header(&line, None)?;
        let value = self.read_payload(len).await?;
        Ok(Some(Value {
            value,
            version,
            expiry_ms,
        }))
    }

    /// SET with raw option tokens (`EX <ms>`, `PXAT <ms>`, `NX`, `XX`,
    /// `VER <n>`). Returns the new version.
    pub async fn set(
        &mut self,
        key: &str,
        value: &[u8],
        options: &[&str],
    ) -> Result<u64, ClientError> {
        let len = value.len().to_string();
        let mut args = vec![key, len.as_str()];
        args.extend_from_slice(options);

        self.send_line_with_payload("SET", &args, value).await?;

        let line = self.read_line().await?;
        match line.strip_prefix("OK ") {
            Some(version) => version.parse().map_err(|_| unexpected(&line)),
            None => Err(unexpected(&line)),
        }
    }

    pub async fn del(&mut self, key: &str) -> Result<bool, ClientError> {
        self.send_line("DEL", &[key]).await?;
        let line = self.read_line().await?;
        match line.as_str() {
            "DELETED 1" => Ok(true),
            "DELETED 0" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool, ClientError> {
        self.send_line("EXISTS", &[key]).await?;
        let line = self.read_line().await?;
        match line.as_str() {
            "EXISTS 1" => Ok(true),
            "EXISTS 0" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Returns false when the key was missing.
    pub async fn expire(&mut self, key: &str, ttl_ms: i64) -> Result<bool, ClientError> {
        let ttl = ttl_ms.to_string();
        self.send_line("EXPIRE", &[key, ttl.as_str()]).await?;
        let line = self.read_line().await?;
        match line.as_str() {
            "OK" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ttl(&mut self, key: &str) -> Result<i64, ClientError> {
        self.send_line("TTL", &[key]).await?;
        let line = self.read_line().await?;
        line.parse().map_err(|_| unexpected(&line))
    }

    pub async fn incr(&mut self, key: &str, delta: Option<i64>) -> Result<i64, ClientError> {
        self.int_command("INCR", key, delta).await
    }

    pub async fn decr(&mut self, key: &str, delta: Option<i64>) -> Result<i64, ClientError> {
        self.int_command("DECR", key, delta).await
    }

    async fn int_command(
        &mut self,
        name: &str,
        key: &str,
        delta: Option<i64>,
    ) -> Result<i64, ClientError> {
        match delta {
            None => self.send_line(name, &[key]).await?,
            Some(delta) => {
                let delta = delta.to_string();
                self.send_line(name, &[key, delta.as_str()]).await?;
            }
        }
        let line = self.read_line().await?;
        line.parse().map_err(|_| unexpected(&line))
    }

    /// One `Option<Value>` per requested key, in request order.
    pub async fn mget(&mut self, keys: &[&str]) -> Result<Vec<Option<Value>>, ClientError> {
        self.send_line("MGET", keys).await?;

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let line = self.read_line().await?;
            if line == format!("NOT_FOUND {key}") {
                out.push(None);
                continue;
            }
            let (version, expiry_ms, len) = parse_value_header(&line, Some(key))?;
            let value = self.read_payload(len).await?;
            out.push(Some(Value {
                value,
                version,
                expiry_ms,
            }));
        }
        Ok(out)
    }

    /// Returns the number of keys written.
    pub async fn mset(&mut self, pairs: &[(&str, &[u8])]) -> Result<usize, ClientError> {
        let mut args: Vec<String> = Vec::with_capacity(pairs.len() * 2);
        let mut payload = Vec::new();
        for (key, value) in pairs {
            args.push(key.to_string());
            args.push(value.len().to_string());
            payload.extend_from_slice(value);
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        self.send_line_with_payload("MSET", &arg_refs, &payload).await?;

        let line = self.read_line().await?;
        match line.strip_prefix("OK ") {
            Some(count) => count.parse().map_err(|_| unexpected(&line)),
            None => Err(unexpected(&line)),
        }
    }

    pub async fn stats(&mut self) -> Result<BTreeMap<String, String>, ClientError> {
        self.send_line("STATS", &[]).await?;

        let mut out = BTreeMap::new();
        loop {
            let line = self.read_line_raw().await?;
            if line == "END" {
                return Ok(out);
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    out.insert(key.to_string(), value.to_string());
                }
                None => return Err(unexpected(&line)),
            }
        }
    }

    async fn send_line(&mut self, name: &str, args: &[&str]) -> Result<(), ClientError> {
        let mut line = name.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push_str("\r\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_line_with_payload(
        &mut self,
        name: &str,
        args: &[&str],
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let mut line = name.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push_str("\r\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(payload).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one response line, surfacing `ERR <CODE> <msg>` as an error.
    async fn read_line(&mut self) -> Result<String, ClientError> {
        let line = self.read_line_raw().await?;
        if let Some(rest) = line.strip_prefix("ERR ") {
            let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
            return Err(ClientError::Server {
                code: code.to_string(),
                message: message.to_string(),
            });
        }
        Ok(line)
    }

    async fn read_line_raw(&mut self) -> Result<String, ClientError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn read_payload(&mut self, len: usize) -> Result<Vec<u8>, ClientError> {
        let mut value = vec![0u8; len];
        self.reader.read_exact(&mut value).await?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(ClientError::UnexpectedResponse(
                "missing payload terminator".to_string(),
            ));
        }
        Ok(value)
    }
}

/// Parse `VALUE <len> <ver> <expiry>` or, with `expect_key`, the MGET form
/// `VALUE <key> <len> <ver> <expiry>`. Returns (version, expiry_ms, len).
fn parse_value_header(
    line: &str,
    expect_key: Option<&str>,
) -> Result<(u64, i64, usize), ClientError> {
    let mut fields = line.split_ascii_whitespace();
    if fields.next() != Some("VALUE") {
        return Err(unexpected(line));
    }
    if let Some(key) = expect_key {
        if fields.next() != Some(key) {
            return Err(unexpected(line));
        }
    }

    let parts: Vec<&str> = fields.collect();
    if parts.len() != 3 {
        return Err(unexpected(line));
    }
    let len = parts[0].parse().map_err(|_| unexpected(line))?;
    let version = parts[1].parse().map_err(|_| unexpected(line))?;
    let expiry_ms = parts[2].parse().map_err(|_| unexpected(line))?;
    Ok((version, expiry_ms, len))
}

fn unexpected(line: &str) -> ClientError {
    ClientError::UnexpectedResponse(line.to_string())
}
