//! Runs the user command and streams its output into the log buffer.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::log_buffer::LogBuffer;
use super::{ControllerError, ControllerResult};
use crate::messages::proto;

/// How long output readers may keep draining once the command has ended.
/// Processes the command left behind can hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited(i32),
    /// Terminated by a signal, no exit code.
    Signaled,
    Canceled,
}

/// Spawn `command`, copy each stdout/stderr line into `buffer` under
/// `source`, and wait for it to exit or for `cancel` to fire.
pub async fn run_command(
    command: &[String],
    envs: &[(String, String)],
    working_dir: Option<&Path>,
    source: &str,
    buffer: Arc<LogBuffer>,
    cancel: CancellationToken,
) -> ControllerResult<ExecOutcome> {
    let (program, args) = command.split_first().ok_or(ControllerError::EmptyCommand)?;
    let mut process = Command::new(program);
    process
        .args(args)
        .envs(envs.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so cancellation reaches everything the command spawned.
    #[cfg(unix)]
    process.process_group(0);
    if let Some(dir) = working_dir {
        process.current_dir(dir);
    }

    let mut child = process.spawn()?;
    info!(pid = child.id(), program = %program, "user command started");

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(
            stdout,
            source.to_string(),
            proto::IoType::Stdout,
            Arc::clone(&buffer),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(
            stderr,
            source.to_string(),
            proto::IoType::Stderr,
            Arc::clone(&buffer),
        )));
    }

    let outcome = tokio::select! {
        status = child.wait() => {
            let status = status?;
            match status.code() {
                Some(code) => ExecOutcome::Exited(code),
                None => ExecOutcome::Signaled,
            }
        }
        _ = cancel.cancelled() => {
            warn!(program = %program, "canceling user command");
            kill_process_tree(&mut child);
            let _ = child.wait().await;
            ExecOutcome::Canceled
        }
    };

    // Output written just before exit is still in the pipes.
    drain_readers(readers).await;
    info!(?outcome, "user command finished");
    Ok(outcome)
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: kill(2) takes no pointers; a negative pid targets the group.
        let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if rc == 0 {
            return;
        }
        warn!(
            pid,
            error = %std::io::Error::last_os_error(),
            "failed to kill user process group"
        );
    }
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to kill user command");
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to kill user command");
    }
}

async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            warn!("command output still open after exit, abandoning reader");
            reader.abort();
        }
    }
}

async fn pump_lines(
    stream: impl AsyncRead + Unpin,
    source: String,
    io_type: proto::IoType,
    buffer: Arc<LogBuffer>,
) {
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                if raw.last() == Some(&b'\n') {
                    raw.pop();
                    if raw.last() == Some(&b'\r') {
                        raw.pop();
                    }
                }
                let line = String::from_utf8_lossy(&raw).into_owned();
                buffer.push_line(&source, io_type, line);
            }
            Err(err) => {
                warn!(error = %err, io_type = io_type.as_label(), "failed to read command output");
                break;
            }
        }
    }
}
