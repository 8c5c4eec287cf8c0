//! OSMO in-pod task controller.
//!
//! `osmo-ctrl run [flags] -- <command...>` stages inputs, runs the command
//! while shipping its logs, and stages outputs. The process exit code is the
//! command's exit code (1 when it has none).
//!
//! `osmo-ctrl barrier <name> <count>` is called by the user command and
//! blocks until `count` tasks of the group reached the same barrier.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use osmo::controller::{HttpTokenSource, NoToken, TokenSource};
use osmo::observability::{init_tracing, wait_for_shutdown};
use osmo::{ControllerConfig, TaskController, TaskGroupStatus};

#[derive(Parser, Debug)]
#[command(name = "osmo-ctrl", about = "OSMO in-pod task controller")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task: download inputs, execute, upload outputs.
    Run(ControllerConfig),
    /// Wait on a group barrier (called from the user command).
    Barrier {
        name: String,
        count: u32,
        #[arg(long, env = "OSMO_SOCKET_PATH", default_value = "/tmp/osmo/ctrl.sock")]
        socket_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing("osmo=info,osmo_ctrl=info");

    match Args::parse().command {
        Command::Run(config) => run(config).await,
        Command::Barrier {
            name,
            count,
            socket_path,
        } => barrier(socket_path, name, count).await,
    }
}

async fn run(config: ControllerConfig) -> Result<ExitCode> {
    let tokens: Arc<dyn TokenSource> = match &config.refresh_token {
        Some(refresh_token) => Arc::new(HttpTokenSource::new(
            &config.service_url(),
            &config.refresh_path,
            refresh_token.clone(),
        )?),
        None => Arc::new(NoToken),
    };

    info!(
        workflow_id = %config.workflow_id,
        task = %config.task_name,
        retry_id = config.retry_id,
        service = %config.service_url(),
        "starting task controller"
    );
    let controller = TaskController::new(config, tokens)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if wait_for_shutdown().await.is_ok() {
            signal_token.cancel();
        }
    });

    let report = controller.run(shutdown).await?;
    let code = match (report.status, report.exit_code) {
        (TaskGroupStatus::Completed, _) => 0,
        (_, Some(code)) if code != 0 => code,
        _ => 1,
    };
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

#[cfg(unix)]
async fn barrier(socket_path: PathBuf, name: String, count: u32) -> Result<ExitCode> {
    match osmo::controller::control_socket::request_barrier(&socket_path, &name, count).await {
        Ok(()) => {
            info!(barrier = %name, "barrier released");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(barrier = %name, error = %err, "barrier failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(not(unix))]
async fn barrier(_socket_path: PathBuf, _name: String, _count: u32) -> Result<ExitCode> {
    anyhow::bail!("barriers need a unix control socket")
}
