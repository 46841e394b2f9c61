use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use osprey::config::Config;
use osprey::server::{shutdown_signal, Server};

#[derive(Parser)]
#[command(name = "osprey", version, about = "Persistent key-value server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "osprey.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("osprey: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    init_logging(&cfg)?;

    info!(config = %args.config.display(), "starting osprey");

    let server = Server::bind(cfg).await?;
    let addr = server.local_addr()?;
    info!(%addr, "listening");

    tokio::select! {
        _ = server.run() => {}
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    server.store().close().await;
    info!("shutdown complete");
    Ok(())
}

/// Log to stderr, and to an append-only file when one is configured (or the
/// default `<data_dir>/logs/osprey.log`). `RUST_LOG` overrides the config's
/// log level.
fn init_logging(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    let log_path = if cfg.log_file.is_empty() {
        cfg.data_dir.join("logs").join("osprey.log")
    } else {
        PathBuf::from(&cfg.log_file)
    };

    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr.and(std::sync::Mutex::new(file)))
        .init();

    Ok(())
}
