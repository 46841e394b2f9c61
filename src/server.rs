use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::error::ProtocolError;
use crate::protocol::response;
use crate::protocol::{Command, Parser};
use crate::storage::{PersistentStore, SetOptions, StorageError};

/// Idle connections are culled after this long without a complete command.
const READ_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts connections and runs one handler task per client. Mutations go
/// through the persistent store; reads bypass the mutation mutex entirely.
pub struct Server {
    cfg: Config,
    store: Arc<PersistentStore>,
    listener: TcpListener,
    client_count: Arc<AtomicUsize>,
}

impl Server {
    /// Open the store (running recovery) and bind the listen socket.
    pub async fn bind(cfg: Config) -> Result<Self, ServerError> {
        let store = PersistentStore::open(cfg.clone()).await?;
        let listener = TcpListener::bind(&cfg.listen_addr).await?;

        Ok(Self {
            cfg,
            store,
            listener,
            client_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound address; useful when the config asked for port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Accept loop. Runs until the enclosing task is cancelled; the caller
    /// shuts the store down afterwards.
    pub async fn run(&self) {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.client_count.load(Ordering::Acquire) >= self.cfg.max_clients {
                debug!(%peer, "refusing connection over client limit");
                drop(socket);
                continue;
            }
            self.client_count.fetch_add(1, Ordering::AcqRel);

            let store = Arc::clone(&self.store);
            let client_count = Arc::clone(&self.client_count);
            let cfg = self.cfg.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, &store, &cfg, &client_count).await {
                    debug!(%peer, error = %e, "connection ended with error");
                }
                client_count.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    store: &Arc<PersistentStore>,
    cfg: &Config,
    client_count: &Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let (read_half, write_half) = socket.into_split();
    let mut parser = Parser::new(BufReader::new(read_half));
    let mut writer = BufWriter::new(write_half);

    loop {
        let command = match timeout(READ_DEADLINE, parser.next_command()).await {
            Err(_) => {
                debug!("closing idle connection");
                return Ok(());
            }
            Ok(Err(ProtocolError::ConnectionClosed)) => return Ok(()),
            Ok(Err(ProtocolError::Io(e))) => return Err(e),
            Ok(Err(e)) => {
                response::write_error(&mut writer, "BADREQ", &e.to_string()).await?;
                writer.flush().await?;
                continue;
            }
            Ok(Ok(command)) => command,
        };

        let start = Instant::now();
        dispatch(&command, store, client_count, &mut writer).await?;
        writer.flush().await?;

        let elapsed = start.elapsed();
        if elapsed > cfg.slowlog_threshold() {
            warn!(
                command = %command.name,
                args = ?command.args,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow command"
            );
        }
    }
}

async fn dispatch<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    client_count: &Arc<AtomicUsize>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.is_mutating() && store.is_snapshot_paused() {
        return response::write_error(w, "BUSY", "server is busy").await;
    }

    match command.name.as_str() {
        "PING" => response::write_pong(w).await,
        "GET" => handle_get(command, store, w).await,
        "SET" => handle_set(command, store, w).await,
        "DEL" => handle_del(command, store, w).await,
        "EXISTS" => handle_exists(command, store, w).await,
        "EXPIRE" => handle_expire(command, store, w).await,
        "TTL" => handle_ttl(command, store, w).await,
        "INCR" => handle_incr(command, store, w, 1).await,
        "DECR" => handle_incr(command, store, w, -1).await,
        "MGET" => handle_mget(command, store, w).await,
        "MSET" => handle_mset(command, store, w).await,
        "STATS" => handle_stats(store, client_count, w).await,
        _ => response::write_error(w, "BADREQ", "unknown command").await,
    }
}

async fn handle_get<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.len() != 1 {
        return response::write_error(w, "BADREQ", "GET requires 1 argument").await;
    }

    match store.get(&command.args[0]) {
        Ok(entry) => response::write_value(w, entry.version, entry.expiry_ms, &entry.value).await,
        Err(StorageError::KeyNotFound) => response::write_not_found(w).await,
        Err(e) => write_storage_error(w, &e).await,
    }
}

async fn handle_set<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.len() < 2 {
        return response::write_error(w, "BADREQ", "SET requires at least 2 arguments").await;
    }

    let key = &command.args[0];
    let opts = match parse_set_options(&command.args[2..]) {
        Ok(opts) => opts,
        Err(message) => return response::write_error(w, "BADREQ", &message).await,
    };

    match store.set(key, command.payload.clone(), opts).await {
        Ok(version) => response::write_ok_version(w, version).await,
        Err(StorageError::KeyExists) => {
            response::write_error(w, "EXISTS", "key already exists").await
        }
        Err(StorageError::KeyNotFound) => {
            response::write_error(w, "NEXISTS", "key does not exist").await
        }
        Err(StorageError::VersionMismatch) => {
            response::write_error(w, "VER", "version mismatch").await
        }
        Err(e) => write_storage_error(w, &e).await,
    }
}

fn parse_set_options(tokens: &[String]) -> Result<SetOptions, String> {
    let mut opts = SetOptions::default();
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i].to_ascii_uppercase().as_str() {
            "EX" => {
                let raw = tokens.get(i + 1).ok_or("EX requires a value")?;
                opts.expiry_ms = raw.parse().map_err(|_| "invalid TTL".to_string())?;
                i += 2;
            }
            "PXAT" => {
                let raw = tokens.get(i + 1).ok_or("PXAT requires a value")?;
                opts.absolute_expiry_ms =
                    raw.parse().map_err(|_| "invalid absolute expiry".to_string())?;
                i += 2;
            }
            "NX" => {
                opts.nx = true;
                i += 1;
            }
            "XX" => {
                opts.xx = true;
                i += 1;
            }
            "VER" => {
                let raw = tokens.get(i + 1).ok_or("VER requires a value")?;
                opts.version = raw.parse().map_err(|_| "invalid version".to_string())?;
                opts.check_version = true;
                i += 2;
            }
            other => return Err(format!("unknown option: {other}")),
        }
    }

    if opts.expiry_ms > 0 && opts.absolute_expiry_ms > 0 {
        return Err("EX and PXAT are mutually exclusive".to_string());
    }

    Ok(opts)
}

async fn handle_del<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.len() != 1 {
        return response::write_error(w, "BADREQ", "DEL requires 1 argument").await;
    }
    let deleted = store.delete(&command.args[0]).await;
    response::write_deleted(w, deleted).await
}

async fn handle_exists<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.len() != 1 {
        return response::write_error(w, "BADREQ", "EXISTS requires 1 argument").await;
    }
    response::write_exists(w, store.exists(&command.args[0])).await
}

async fn handle_expire<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.len() != 2 {
        return response::write_error(w, "BADREQ", "EXPIRE requires 2 arguments").await;
    }
    let Ok(ttl_ms) = command.args[1].parse::<i64>() else {
        return response::write_error(w, "BADREQ", "invalid TTL").await;
    };

    match store.expire(&command.args[0], ttl_ms).await {
        Ok(()) => response::write_ok(w).await,
        Err(StorageError::KeyNotFound) => response::write_not_found(w).await,
        Err(e) => write_storage_error(w, &e).await,
    }
}

async fn handle_ttl<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.len() != 1 {
        return response::write_error(w, "BADREQ", "TTL requires 1 argument").await;
    }
    response::write_int(w, store.ttl(&command.args[0])).await
}

async fn handle_incr<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
    sign: i64,
) -> std::io::Result<()> {
    if command.args.is_empty() || command.args.len() > 2 {
        return response::write_error(w, "BADREQ", "INCR/DECR requires 1 or 2 arguments").await;
    }

    let delta = match command.args.get(1) {
        None => 1,
        Some(raw) => match raw.parse::<i64>() {
            Ok(delta) => delta,
            Err(_) => return response::write_error(w, "BADREQ", "invalid delta").await,
        },
    };

    match store.incr(&command.args[0], delta * sign).await {
        Ok(value) => response::write_int(w, value).await,
        Err(StorageError::NotInteger) => {
            response::write_error(w, "TYPE", "value is not an integer").await
        }
        Err(e) => write_storage_error(w, &e).await,
    }
}

async fn handle_mget<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.is_empty() {
        return response::write_error(w, "BADREQ", "MGET requires at least 1 argument").await;
    }

    for key in &command.args {
        match store.get(key) {
            Ok(entry) => {
                response::write_value_for_key(w, key, entry.version, entry.expiry_ms, &entry.value)
                    .await?;
            }
            Err(StorageError::KeyNotFound) => {
                response::write_not_found_key(w, key).await?;
            }
            Err(e) => return write_storage_error(w, &e).await,
        }
    }
    Ok(())
}

async fn handle_mset<W: AsyncWrite + Unpin>(
    command: &Command,
    store: &Arc<PersistentStore>,
    w: &mut W,
) -> std::io::Result<()> {
    if command.args.is_empty() || command.args.len() % 2 != 0 {
        return response::write_error(w, "BADREQ", "MSET requires key/length pairs").await;
    }

    let mut offset = 0usize;
    let mut count = 0usize;

    for pair in command.args.chunks(2) {
        let key = &pair[0];
        let Ok(length) = pair[1].parse::<usize>() else {
            return response::write_error(w, "BADREQ", "invalid length").await;
        };
        if offset + length > command.payload.len() {
            return response::write_error(w, "BADREQ", "payload shorter than declared").await;
        }
        let value = command.payload[offset..offset + length].to_vec();
        offset += length;

        if let Err(e) = store.set(key, value, SetOptions::default()).await {
            return write_storage_error(w, &e).await;
        }
        count += 1;
    }

    response::write_ok_count(w, count).await
}

async fn handle_stats<W: AsyncWrite + Unpin>(
    store: &Arc<PersistentStore>,
    client_count: &Arc<AtomicUsize>,
    w: &mut W,
) -> std::io::Result<()> {
    let mut stats = store.stats();
    stats.insert(
        "clients".to_string(),
        client_count.load(Ordering::Acquire).to_string(),
    );
    stats.extend(store.wal_stats().await);
    response::write_stats(w, &stats).await
}

/// Fallback wire mapping for storage errors the handlers did not claim.
async fn write_storage_error<W: AsyncWrite + Unpin>(
    w: &mut W,
    e: &StorageError,
) -> std::io::Result<()> {
    let (code, message) = match e {
        StorageError::KeyInvalid => ("BADREQ", "key contains invalid characters".to_string()),
        StorageError::KeyTooLarge => ("TOOLARGE", "key too large".to_string()),
        StorageError::ValueTooLarge => ("TOOLARGE", "value too large".to_string()),
        other => ("INTERNAL", other.to_string()),
    };
    response::write_error(w, code, &message).await
}

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
