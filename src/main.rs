//! Trade replay server entry point

use std::path::{Path, PathBuf};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trade_replay::{ParquetTradeSource, ReplayConfig, ReplayServer, TradeSource};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML or JSON); overrides all other flags
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Parquet file holding the historical trades
    #[arg(long, env = "PARQUET_FILE", default_value = "trades_sample.parquet")]
    source: PathBuf,

    /// Replay speed factor (1.0 = realtime, >1 compresses elapsed time)
    #[arg(long, env = "SPEED", default_value_t = 1.0)]
    speed: f64,

    /// Minimum inter-batch delay in seconds
    #[arg(long, env = "MIN_DELAY", default_value_t = 0.0)]
    min_delay: f64,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind_address: String,

    /// Port
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Maximum concurrent subscribers
    #[arg(long, default_value_t = 1000)]
    max_subscribers: usize,

    /// Enable CORS for browser clients
    #[arg(long)]
    enable_cors: bool,

    /// Heartbeat interval in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    heartbeat_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trade_replay=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("starting trade replay server v{}", env!("CARGO_PKG_VERSION"));

    let config = if let Some(config_path) = &args.config {
        load_config_from_file(config_path).await?
    } else {
        ReplayConfig {
            source_path: args.source,
            speed_factor: args.speed,
            min_delay_secs: args.min_delay,
            bind_address: args.bind_address,
            port: args.port,
            max_subscribers: args.max_subscribers,
            enable_cors: args.enable_cors,
            heartbeat_interval_secs: args.heartbeat_interval,
        }
    };

    // Degenerate pacing parameters or an unreadable source file abort here,
    // before any subscriber is served.
    config.validate()?;
    info!("configuration loaded: {config:?}");

    let records = ParquetTradeSource::new(config.source_path.clone()).load()?;

    let shutdown = CancellationToken::new();
    let server = ReplayServer::new(config, shutdown.clone());

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("shutdown signal received");
    };

    tokio::select! {
        result = server.start(records) => {
            if let Err(e) = result {
                error!("server error: {e}");
                return Err(e.into());
            }
        }
        _ = shutdown_signal => {
            shutdown.cancel();
            info!("shutting down");
        }
    }

    Ok(())
}

async fn load_config_from_file(path: &Path) -> anyhow::Result<ReplayConfig> {
    let contents = tokio::fs::read_to_string(path).await?;

    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        Ok(serde_json::from_str(&contents)?)
    } else {
        // Default to TOML
        Ok(toml::from_str(&contents)?)
    }
}
