//! pipemesh Router
//!
//! Runs one replica's pipe router against a Consul agent: watches pipe
//! ownership records, bridges pipes to peer replicas, and serves the private
//! replica API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use pipemesh_core::tracing_init::init_tracing;
use pipemesh_core::{LogFormat, RouterConfig};
use pipemesh_kv::{ConsistentClient, ConsulKv};
use pipemesh_router::{DistributedPipeRouter, PipeRouter};

#[derive(Parser, Debug)]
#[command(name = "pipemesh-router")]
#[command(version, about = "pipemesh router - distributed pipe routing between replicas")]
struct Args {
    /// Consul agent address.
    #[arg(long, env = "CONSUL_ADDR", default_value = "127.0.0.1:8500")]
    consul_addr: String,

    /// KV prefix for pipe records.
    #[arg(long)]
    prefix: Option<String>,

    /// Address other replicas dial for the private API (host or host:port).
    #[arg(long, env = "PIPEMESH_ADVERTISE")]
    advertise: Option<String>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines, overriding the config file.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RouterConfig::load(path)?,
        None => {
            let mut config = RouterConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if args.log_json {
        config.log.format = LogFormat::Json;
    }
    init_tracing(&config.log)?;

    if let Some(prefix) = args.prefix {
        config.prefix = prefix;
    }
    if let Some(advertise) = args.advertise {
        config.advertise = advertise;
    }
    config.validate()?;

    info!(
        consul = %args.consul_addr,
        advertise = %config.advertise_addr(),
        prefix = %config.prefix,
        "Starting pipemesh router"
    );

    let store = ConsulKv::new(&args.consul_addr)?;
    let client = ConsistentClient::with_config(Arc::new(store), &config);
    let router = DistributedPipeRouter::start(client, &config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    router.shutdown().await;
    Ok(())
}
