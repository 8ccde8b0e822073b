use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use qkv_server::serve;
use qkv_store::{MemStore, StoreConfig};

#[derive(clap::Parser, Debug)]
#[command(name = "qkv-node", about = "Reference node for the quorum KV client")]
struct Cli {
    /// Overrides `server.listen_addr`.
    #[arg(long)]
    listen_addr: Option<String>,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    store: StoreConfig,
    server: ServerConfig,
    observability: ObservabilityConfig,
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

    let config: Config = figment
        .merge(Env::prefixed("QKV_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let listen_addr = cli.listen_addr.unwrap_or(config.server.listen_addr);
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {listen_addr}"))?;

    tracing::info!(
        %addr,
        lease_ms = config.store.lease_ms,
        default_range_limit = config.store.default_range_limit,
        "node starting"
    );

    let store = Arc::new(MemStore::new(config.store));
    serve(addr, store).await
}
