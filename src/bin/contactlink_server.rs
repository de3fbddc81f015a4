//! contactlink gRPC Server
//!
//! A standalone server binary exposing identity reconciliation over gRPC,
//! backed by the durable contact store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use contactlink::engine::{EngineConfig, IdentityEngine, RetryPolicy};
use contactlink::storage::{open_database, PersistentConfig};
use contactlink::transport::ContactLinkServiceImpl;

/// contactlink gRPC server
#[derive(Debug, Parser)]
#[command(name = "contactlink-server")]
#[command(about = "Identity reconciliation server for contact records", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to bind to
    #[arg(short, long, env = "CONTACTLINK_ADDR", default_value = "127.0.0.1:50051")]
    addr: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, env = "CONTACTLINK_DATA_DIR", default_value = "./contacts.db")]
    data_dir: PathBuf,

    /// Log filter (e.g. "info", "contactlink=debug")
    #[arg(long, env = "CONTACTLINK_LOG", default_value = "info")]
    log_level: String,

    /// Skip fsync after each commit
    #[arg(long, env = "CONTACTLINK_NO_FSYNC")]
    no_fsync: bool,

    /// WAL size in bytes that triggers compaction
    #[arg(long, env = "CONTACTLINK_MAX_WAL_SIZE", default_value_t = 64 * 1024 * 1024)]
    max_wal_size: u64,

    /// Conflict retries per request
    #[arg(long, env = "CONTACTLINK_MAX_RETRIES", default_value_t = 16)]
    max_retries: usize,

    /// Per-request deadline in milliseconds
    #[arg(long, env = "CONTACTLINK_REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %cli.data_dir.display(),
        addr = %cli.addr,
        "contactlink starting"
    );

    // Holds an exclusive lock on the data directory for the process lifetime.
    let store = open_database(
        &cli.data_dir,
        Some(PersistentConfig {
            max_wal_size: cli.max_wal_size,
            sync_on_write: !cli.no_fsync,
        }),
    )?;

    let engine = IdentityEngine::with_config(
        Arc::new(store),
        EngineConfig {
            retry: RetryPolicy::default().with_max_retries(cli.max_retries),
            request_timeout: Some(Duration::from_millis(cli.request_timeout_ms)),
            ..EngineConfig::default()
        },
    )?;

    let svc = ContactLinkServiceImpl::new(Arc::new(engine)).into_server();

    info!(addr = %cli.addr, "serving gRPC; press Ctrl+C to stop");
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(cli.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shut down");
    Ok(())
}
