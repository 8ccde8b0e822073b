use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use qkv_client::{use_scope, ClientConfig, ContextClient, Expire, Key, KvError, Quorum};

#[derive(clap::Parser, Debug)]
#[command(name = "qkv", about = "Command-line client for the quorum KV store")]
struct Cli {
    /// Replaces `client.endpoints`; repeatable.
    #[arg(long = "endpoint", global = true)]
    endpoints: Vec<String>,
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print a key's version and value.
    Get { key: String },
    /// Print a key's version only.
    Version { key: String },
    /// Write a key unconditionally.
    Set {
        key: String,
        value: String,
        /// Expiry in seconds.
        #[arg(long)]
        expire: Option<u32>,
    },
    /// Read a key, then write it only if nobody changed it in between.
    Cas { key: String, value: String },
    /// Block until the key moves past its current version.
    Listen {
        key: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Write several keys in one transaction: `k1=v1 k2=v2 ...`.
    Transact {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Write a tree entry.
    TreeSet { tree: String, key: String, value: String },
    /// Print tree entries with `from <= key < to`.
    Range {
        tree: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: u32,
    },
    /// Walk a tree from `start` with the cursor, forwards or backwards.
    Scan {
        tree: String,
        start: String,
        #[arg(long)]
        reverse: bool,
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    client: ClientConfig,
    observability: ObservabilityConfig,
}

fn show(value: Option<&String>) -> &str {
    value.map_or("<absent>", String::as_str)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("QKV_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    if !cli.endpoints.is_empty() {
        config.client.endpoints = cli.endpoints;
    }
    let quorum = config.client.quorum().context("invalid quorum in configuration")?;
    let client = ContextClient::connect(&config.client).context("failed to build client")?;
    tracing::debug!(endpoints = ?config.client.endpoints, ?quorum, "client ready");

    run(&client, quorum, cli.command).await
}

async fn run(client: &ContextClient, quorum: Quorum, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { key } => {
            let entry = client.get::<String>(key, quorum).await?;
            println!("{} {}", entry.version(), show(entry.value()));
        }
        Command::Version { key } => {
            println!("{}", client.get_version(key, quorum).await?);
        }
        Command::Set { key, value, expire } => {
            let expire = expire.map_or(Expire::None, Expire::After);
            let version = client.entry::<String>(key, quorum).set_with_expire(value, expire).await?;
            println!("{version}");
        }
        Command::Cas { key, value } => {
            let mut entry = client.get::<String>(key, quorum).await?;
            let seen = entry.version();
            if entry.cas(value).await? {
                println!("{}", entry.version());
            } else {
                anyhow::bail!("version {seen} is stale; key was modified concurrently");
            }
        }
        Command::Listen { key, timeout_ms } => {
            let mut entry = client.get::<String>(key, quorum).await?;
            let current = entry.version();
            match timeout_ms {
                Some(ms) => entry.listen_timeout(current, Duration::from_millis(ms)).await?,
                None => entry.listen().await?,
            }
            println!("{} {}", entry.version(), show(entry.value()));
        }
        Command::Transact { pairs } => {
            let writes = pairs
                .iter()
                .map(|pair| {
                    pair.split_once('=')
                        .with_context(|| format!("expected key=value, got {pair:?}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let tx = client.transaction().await?;
            let index = tx.index();
            use_scope(&tx, |tx| async move {
                for (key, value) in writes {
                    tx.entry::<String>(key, quorum).set(value.to_string()).await?;
                }
                Ok::<_, KvError>(())
            })
            .await?;
            println!("committed transaction {index}");
        }
        Command::TreeSet { tree, key, value } => {
            client.tree(tree, quorum).cursor::<String>(key, None).set(value).await?;
        }
        Command::Range { tree, from, to, limit } => {
            let entries = client
                .tree(tree, quorum)
                .range::<String>(from.map(Key::from), to.map(Key::from), limit, None)
                .await?;
            for entry in entries {
                println!("{} {}", entry.key(), show(entry.value()));
            }
        }
        Command::Scan { tree, start, reverse, count } => {
            let mut cursor = client.tree(tree, quorum).find::<String>(start, None).await?;
            if cursor.value().is_some() {
                println!("{} {}", cursor.key(), show(cursor.value()));
            }
            for _ in 0..count {
                let moved = if reverse { cursor.prev().await? } else { cursor.next().await? };
                if !moved {
                    break;
                }
                println!("{} {}", cursor.key(), show(cursor.value()));
            }
        }
    }
    Ok(())
}
