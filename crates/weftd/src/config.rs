//! Configuration for weftd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// weftd - Weft feed node daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "weftd")]
#[command(about = "Weft peer-to-peer feed node")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/weftd")]
    pub data_dir: PathBuf,

    /// Identity seed file (32 bytes, hex). Generated on first run if absent.
    #[arg(long, env = "WEFT_IDENTITY_SEED")]
    pub identity_seed: Option<PathBuf>,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Abandon a pending sync exchange after this many seconds
    #[arg(long, default_value = "30")]
    pub sync_timeout_secs: u64,

    /// Maximum event ids per event-request message
    #[arg(long, default_value = "100")]
    pub event_batch: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.event_batch == 0 {
            anyhow::bail!("event batch size must be at least 1");
        }
        if self.sync_timeout_secs == 0 {
            anyhow::bail!("sync timeout must be at least 1 second");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("log format must be 'json' or 'pretty'");
        }
        Ok(())
    }
}
