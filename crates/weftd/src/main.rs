//! weftd - Weft peer-to-peer feed daemon
//!
//! Maintains the append-only signed event log and keeps it convergent
//! with connected peers via gossip anti-entropy.

use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weft_core::Identity;
use weft_store::Store;
use weftd::config::Config;
use weftd::net::{PeerId, TcpNet};
use weftd::node::Node;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::from_default_env().add_directive(
        if config.verbose { "weftd=debug" } else { "weftd=info" }
            .parse()
            .expect("static directive"),
    );
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!("weftd v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let seed_path = config
        .identity_seed
        .clone()
        .unwrap_or_else(|| config.data_dir.join("identity.seed"));
    let identity = load_or_create_identity(&seed_path)?;
    info!("author {}", identity.author().to_hex());

    let store = Arc::new(Store::open(config.data_dir.join("store"))?);
    info!("store holds {} events", store.event_count());

    let local_id = PeerId(identity.author().0);
    let (transport, net_rx) = TcpNet::new(local_id);
    let (listen_addr, accept_task) = transport.clone().listen(config.listen).await?;
    info!("listening on {listen_addr}");

    let node = Node::new(
        identity,
        store,
        transport.clone(),
        net_rx,
        std::time::Duration::from_secs(config.sync_timeout_secs),
        config.event_batch,
    );
    node.start()?;

    for addr in &config.bootstrap {
        info!("dialing bootstrap peer {addr}");
        if let Err(e) = transport.clone().dial(*addr).await {
            error!("bootstrap dial {addr} failed: {e}");
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    accept_task.abort();
    node.stop().await?;
    Ok(())
}

/// Load a 32-byte hex seed from disk, generating one on first run.
fn load_or_create_identity(path: &Path) -> anyhow::Result<Identity> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("identity seed is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity seed must be 32 bytes"))?;
        Ok(Identity::from_seed(&seed))
    } else {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        std::fs::write(path, hex::encode(seed))
            .with_context(|| format!("writing {}", path.display()))?;
        info!("generated new identity seed at {}", path.display());
        Ok(Identity::from_seed(&seed))
    }
}
