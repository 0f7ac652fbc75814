//! SocialSync cache service
//!
//! ```bash
//! socialsync-cache --bind 0.0.0.0:8787
//! socialsync-cache --config cache.toml -vv
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use socialsync_cache::{serve, AppState, CacheServiceConfig};
use tracing::info;

/// Remote cache for SocialSync clients
#[derive(Parser)]
#[command(name = "socialsync-cache")]
#[command(version)]
#[command(about = "Remote cache service for SocialSync posts, chats and messages")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// TOML configuration file
    #[arg(short, long, env = "SOCIALSYNC_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "SOCIALSYNC_CACHE_BIND")]
    bind: Option<SocketAddr>,

    /// Gateway base URL for the direct proxy; repeat for several (overrides the config file)
    #[arg(short, long = "gateway")]
    gateways: Vec<String>,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "info,socialsync_cache=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => CacheServiceConfig::from_file(path)?,
        None => CacheServiceConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if !cli.gateways.is_empty() {
        config.gateways = cli.gateways;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateways = config.gateways.len(),
        "Starting SocialSync cache"
    );

    let addr = config.bind_addr;
    let state = AppState::new(config)?;

    tokio::select! {
        result = serve(state, addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Cache service failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
