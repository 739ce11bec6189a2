//! Coordinator node launcher

use anyhow::Result;
use clap::Parser;
use pact_core::{CommitLog, Coordinator, NodeAddress, RpcClient, RpcServer, DEFAULT_BATCH_SIZE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coordinator", about = "Two-phase commit coordinator node")]
struct Args {
    /// Address to listen on (host:port)
    #[arg(long)]
    host: NodeAddress,

    /// Participant address; repeatable, order defines the node ids
    #[arg(long = "participant", required = true)]
    participants: Vec<NodeAddress>,

    /// Path of the decision log
    #[arg(long = "log-db")]
    log_db: PathBuf,

    /// Seconds to wait for votes and per outbound call
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Statements batched into one distributed transaction
    #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout);

    let participants = args
        .participants
        .iter()
        .map(|addr| RpcClient::new(addr.to_string(), timeout))
        .collect();

    let coordinator = Arc::new(Coordinator::new(
        participants,
        CommitLog::new(&args.log_db),
        timeout,
        args.batch_size,
    ));
    coordinator.setup()?;

    let server = RpcServer::bind(&args.host.to_string()).await?;
    info!(
        "coordinator listening on {} with {} participants",
        server.local_addr(),
        coordinator.participant_count()
    );
    let serving = server.spawn(coordinator.clone());

    coordinator.clone().recover().await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    serving.abort();
    Ok(())
}
