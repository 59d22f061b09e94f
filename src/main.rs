use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parley_engine::{BroadcastBus, ChannelSession, LocalBus, SessionConfig};
use parley_server::ServerConfig;
use parley_store::{Database, SqliteStore};
use parley_telemetry::TelemetryConfig;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time channel messaging server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, default_value = "9092")]
    port: u16,

    /// Message database. Defaults to ~/.parley/parley.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Default log level (RUST_LOG overrides).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// Persist warn+ logs to this SQLite file.
    #[arg(long)]
    log_db: Option<PathBuf>,

    /// Largest inbound WebSocket message, in bytes.
    #[arg(long, default_value = "65536")]
    max_frame_bytes: usize,

    /// Seconds between liveness pings.
    #[arg(long, default_value = "30")]
    ping_interval_secs: u64,

    /// Seconds without a pong before a connection is dropped.
    #[arg(long, default_value = "90")]
    pong_timeout_secs: u64,

    /// NATS server for cross-process fan-out. In-process bus when unset.
    #[cfg(feature = "nats")]
    #[arg(long)]
    nats_url: Option<String>,

    /// Subject prefix for NATS topics.
    #[cfg(feature = "nats")]
    #[arg(long, default_value = "parley")]
    nats_prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = Arc::new(parley_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        log_db_path: cli.log_db.clone(),
        ..Default::default()
    }));

    tracing::info!("starting parley server");

    let db_path = cli.db.clone().unwrap_or_else(default_db_path);
    let db = Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;

    let store = Arc::new(SqliteStore::new(db));
    let bus = build_bus(&cli).await?;
    let session = ChannelSession::with_config(store, bus, SessionConfig::default());

    let config = ServerConfig {
        host: cli.host.clone(),
        port: cli.port,
        max_frame_bytes: cli.max_frame_bytes,
        ping_interval: Duration::from_secs(cli.ping_interval_secs.max(1)),
        pong_timeout: Duration::from_secs(cli.pong_timeout_secs.max(1)),
        ..Default::default()
    };
    let handle = parley_server::start_with_telemetry(config, session, telemetry)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "parley server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(feature = "nats")]
async fn build_bus(cli: &Cli) -> anyhow::Result<Arc<dyn BroadcastBus>> {
    if let Some(url) = &cli.nats_url {
        let bus = parley_engine::NatsBus::connect(url, cli.nats_prefix.clone())
            .await
            .context("connecting to NATS")?;
        return Ok(Arc::new(bus));
    }
    Ok(Arc::new(LocalBus::new()))
}

#[cfg(not(feature = "nats"))]
async fn build_bus(_cli: &Cli) -> anyhow::Result<Arc<dyn BroadcastBus>> {
    Ok(Arc::new(LocalBus::new()))
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
        .join("parley.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["parley"]);
        assert_eq!(cli.port, 9092);
        assert_eq!(cli.log_level, Level::INFO);
        assert!(cli.db.is_none());
        assert!(!cli.log_json);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from([
            "parley",
            "--port",
            "8080",
            "--db",
            "/var/lib/parley/chat.db",
            "--log-level",
            "debug",
            "--log-json",
        ]);
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.db, Some(PathBuf::from("/var/lib/parley/chat.db")));
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(cli.log_json);
    }

    #[test]
    fn default_db_lives_under_dot_parley() {
        assert!(default_db_path().ends_with(".parley/parley.db"));
    }
}
