//! OSMO coordination service.
//!
//! `serve` runs the gRPC coordination server (event relay, node condition
//! push, controller sessions) and the event consumer that feeds workflow
//! trackers. `push-node-conditions` replaces one backend's rule set and
//! queues it for that backend's open streams.
//!
//! Configuration is via environment variables; see `osmo::config`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use osmo::backends::CoordinationBackend;
use osmo::observability::{init_tracing, wait_for_shutdown};
use osmo::{
    CoordinationServer, EventConsumer, MemoryBackend, NodeConditionRules, PostgresBackend,
    ServiceConfig, TrackerRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "osmo-service", about = "OSMO coordination service")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordination server (default).
    Serve,
    /// Replace a backend's node condition rules, e.g. '{"Ready": true}'.
    PushNodeConditions {
        #[arg(long)]
        backend: String,
        #[arg(long)]
        rules: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("osmo=info,osmo_service=info");

    let args = Args::parse();
    let config = ServiceConfig::from_env()?;

    match &config.database_url {
        Some(url) => {
            let backend = PostgresBackend::connect(url)
                .await
                .context("failed to connect to database")?;
            info!("connected to database");
            run(args.command, config, backend).await
        }
        None => {
            info!("OSMO_DATABASE_URL not set; using in-memory store");
            run(args.command, config, MemoryBackend::new()).await
        }
    }
}

async fn run<B>(command: Option<Command>, config: ServiceConfig, backend: B) -> Result<()>
where
    B: CoordinationBackend,
{
    match command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, backend).await,
        Command::PushNodeConditions { backend: name, rules } => {
            let rules = NodeConditionRules::parse(&rules).context("invalid node condition rules")?;
            backend.push_node_conditions(&name, &rules).await?;
            info!(backend = %name, rules = rules.len(), "node conditions pushed");
            Ok(())
        }
    }
}

async fn serve<B>(config: ServiceConfig, backend: B) -> Result<()>
where
    B: CoordinationBackend,
{
    info!(
        grpc_addr = %config.grpc_addr,
        max_retries = config.max_retries,
        pop_timeout_ms = config.pop_timeout_ms,
        barrier_timeout_ms = config.barrier_timeout_ms,
        controller_auth = config.controller_tokens.is_some(),
        "starting coordination service"
    );

    let server =
        CoordinationServer::start(Some(config.grpc_addr), backend.clone(), config.server_options())
            .await?;
    info!(addr = %server.addr(), "coordination server listening");

    let trackers = TrackerRegistry::new();
    let consumer = EventConsumer::new(backend, trackers, config.event_consumer_config());
    let shutdown = CancellationToken::new();
    let consumer_handle = tokio::spawn(consumer.run(shutdown.clone()));

    wait_for_shutdown().await?;
    info!("shutdown signal received");

    shutdown.cancel();
    if let Err(err) = consumer_handle.await {
        error!(error = %err, "event consumer task failed");
    }
    server.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
