//! Participant node launcher

use anyhow::Result;
use clap::Parser;
use pact_core::{CommitLog, NodeAddress, NodeId, Participant, RpcClient, RpcServer, SqlStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Deadline for outbound calls to the coordinator
const COORDINATOR_TIMEOUT_SECS: u64 = 10;

#[derive(Parser)]
#[command(name = "participant", about = "Two-phase commit participant node")]
struct Args {
    /// Address to listen on (host:port)
    #[arg(long)]
    host: NodeAddress,

    /// Coordinator address (host:port)
    #[arg(long)]
    coordinator: NodeAddress,

    /// Zero-based id matching the coordinator's participant list order
    #[arg(long = "node-id")]
    node_id: NodeId,

    /// Path of the data store
    #[arg(long = "data-db")]
    data_db: PathBuf,

    /// Path of the decision log
    #[arg(long = "log-db")]
    log_db: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let coordinator = RpcClient::new(
        args.coordinator.to_string(),
        Duration::from_secs(COORDINATOR_TIMEOUT_SECS),
    );
    let store = SqlStore::open(&args.data_db)?;
    let log = CommitLog::new(&args.log_db);

    let participant = Arc::new(Participant::new(args.node_id, coordinator, store, log));
    participant.setup()?;

    let server = RpcServer::bind(&args.host.to_string()).await?;
    info!(
        "participant {} listening on {}",
        participant.node_id(),
        server.local_addr()
    );
    let serving = server.spawn(participant.clone());

    participant.clone().recover().await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    serving.abort();
    Ok(())
}
