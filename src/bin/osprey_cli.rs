use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use osprey::client::{Client, ClientError};

#[derive(Parser)]
#[command(name = "osprey-cli", version, about = "Osprey command-line client")]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7070")]
    addr: String,

    /// Read the value for `set` from this file ('-' for stdin)
    #[arg(long, value_name = "FILE")]
    r#in: Option<String>,

    /// Write binary values from `get` to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the server is alive
    Ping,
    /// Fetch a value
    Get { key: String },
    /// Store a value; options: EX <ms>, PXAT <ms>, NX, XX, VER <n>
    Set {
        key: String,
        /// Inline value (omit when using --in)
        value: Option<String>,
        /// SET option tokens
        #[arg(trailing_var_arg = true)]
        options: Vec<String>,
    },
    /// Delete a key
    Del { key: String },
    /// Check whether a key exists
    Exists { key: String },
    /// Set a relative TTL in milliseconds
    Expire { key: String, ttl_ms: i64 },
    /// Show the remaining TTL in milliseconds
    Ttl { key: String },
    /// Add to an integer value (default delta 1)
    Incr { key: String, delta: Option<i64> },
    /// Subtract from an integer value (default delta 1)
    Decr { key: String, delta: Option<i64> },
    /// Fetch several keys at once
    Mget { keys: Vec<String> },
    /// Print server statistics
    Stats,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut client = match Client::connect(&cli.addr).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to connect to {}: {e}", cli.addr);
            process::exit(1);
        }
    };

    if let Err(e) = run(&mut client, &cli).await {
        match e {
            ClientError::Server { code, message } => eprintln!("ERR {code} {message}"),
            other => eprintln!("error: {other}"),
        }
        process::exit(1);
    }
}

async fn run(client: &mut Client, cli: &Cli) -> Result<(), ClientError> {
    match &cli.command {
        Command::Ping => {
            client.ping().await?;
            println!("PONG");
        }

        Command::Get { key } => match client.get(key).await? {
            None => println!("NOT_FOUND"),
            Some(value) => {
                println!(
                    "VALUE {} {} {}",
                    value.value.len(),
                    value.version,
                    value.expiry_ms
                );
                match &cli.out {
                    Some(path) => {
                        std::fs::write(path, &value.value)?;
                        println!("value written to {}", path.display());
                    }
                    None => {
                        std::io::stdout().write_all(&value.value)?;
                        println!();
                    }
                }
            }
        },

        Command::Set {
            key,
            value,
            options,
        } => {
            let (payload, options) = match &cli.r#in {
                Some(source) => {
                    let mut data = Vec::new();
                    if source == "-" {
                        std::io::stdin().read_to_end(&mut data)?;
                    } else {
                        data = std::fs::read(source)?;
                    }
                    // With --in, the inline value slot holds the first option
                    let mut all = Vec::new();
                    all.extend(value.iter().cloned());
                    all.extend(options.iter().cloned());
                    (data, all)
                }
                None => {
                    let Some(value) = value else {
                        eprintln!("set requires a value (or --in)");
                        process::exit(1);
                    };
                    (value.clone().into_bytes(), options.clone())
                }
            };

            let option_refs: Vec<&str> = options.iter().map(|s| s.as_str()).collect();
            let version = client.set(key, &payload, &option_refs).await?;
            println!("OK {version}");
        }

        Command::Del { key } => {
            let deleted = client.del(key).await?;
            println!("DELETED {}", deleted as u8);
        }

        Command::Exists { key } => {
            let exists = client.exists(key).await?;
            println!("EXISTS {}", exists as u8);
        }

        Command::Expire { key, ttl_ms } => {
            if client.expire(key, *ttl_ms).await? {
                println!("OK");
            } else {
                println!("NOT_FOUND");
            }
        }

        Command::Ttl { key } => {
            println!("{}", client.ttl(key).await?);
        }

        Command::Incr { key, delta } => {
            println!("{}", client.incr(key, *delta).await?);
        }

        Command::Decr { key, delta } => {
            println!("{}", client.decr(key, *delta).await?);
        }

        Command::Mget { keys } => {
            let key_refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
            let values = client.mget(&key_refs).await?;
            for (key, value) in keys.iter().zip(values) {
                match value {
                    Some(value) => {
                        println!(
                            "VALUE {} {} {} {}",
                            key,
                            value.value.len(),
                            value.version,
                            value.expiry_ms
                        );
                        std::io::stdout().write_all(&value.value)?;
                        println!();
                    }
                    None => println!("NOT_FOUND {key}"),
                }
            }
        }

        Command::Stats => {
            for (key, value) in client.stats().await? {
                println!("{key}={value}");
            }
            println!("END");
        }
    }

    Ok(())
}
