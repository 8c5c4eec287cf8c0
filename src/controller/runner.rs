//! Task controller: download, execute, upload.
//!
//! Output lines and control-plane markers go into the shared [`LogBuffer`];
//! a flusher ships them to the service every flush period. On the way out
//! the buffer is drained and a `LOG_DONE` marker is sent before the session
//! closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connection::{ControllerConnection, LogSink};
use super::exec::{ExecOutcome, run_command};
use super::log_buffer::LogBuffer;
use super::rsync::{RsyncDriver, RsyncOptions};
use super::staging::{
    DriverRegistry, LocalDriver, download_inputs, output_destination, output_dir, plan_inputs,
    should_upload, substitute_tokens,
};
use super::token::TokenSource;
use super::{ControllerError, ControllerResult};
use crate::config::ControllerConfig;
use crate::lifecycle::{ExitAction, ExitActions, LifecycleError, TaskGroupStatus};
use crate::messages::proto;

/// Upper bound on the final drain after the command is done.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const FINAL_FLUSH_RETRY: Duration = Duration::from_millis(50);

/// Outcome of one controller run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    pub status: TaskGroupStatus,
    pub exit_code: Option<i32>,
    pub action: Option<ExitAction>,
    pub restarts: u32,
    pub dropped_logs: u64,
}

impl TaskReport {
    fn new(status: TaskGroupStatus) -> Self {
        Self {
            status,
            exit_code: None,
            action: None,
            restarts: 0,
            dropped_logs: 0,
        }
    }
}

/// Drain the buffer into one batch and send it. An unsent batch goes back to
/// the front of the buffer. Returns false if the send failed.
pub async fn flush_once<S>(buffer: &LogBuffer, sink: &S) -> bool
where
    S: LogSink + ?Sized,
{
    let batch = buffer.drain();
    if batch.is_empty() {
        return true;
    }
    match sink.send_logs(batch).await {
        Ok(()) => true,
        Err(unsent) => {
            buffer.push_front_batch(unsent);
            false
        }
    }
}

async fn flush_loop(
    buffer: Arc<LogBuffer>,
    sink: Arc<dyn LogSink>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                flush_once(&buffer, sink.as_ref()).await;
            }
        }
    }
}

/// Registry with the local driver, plus rsync when enabled.
pub fn default_registry(config: &ControllerConfig) -> DriverRegistry {
    let registry = DriverRegistry::new().register(Arc::new(LocalDriver));
    if !config.rsync_enabled {
        return registry;
    }
    registry.register(Arc::new(RsyncDriver::new(RsyncOptions {
        read_limit: config.rsync_read_limit,
        write_limit: config.rsync_write_limit,
        allowed_paths: config.rsync_allowed_paths.clone(),
        program: None,
    })))
}

pub struct TaskController {
    config: ControllerConfig,
    registry: DriverRegistry,
    exit_actions: ExitActions,
    buffer: Arc<LogBuffer>,
    connection: Arc<ControllerConnection>,
}

impl TaskController {
    pub fn new(config: ControllerConfig, tokens: Arc<dyn TokenSource>) -> ControllerResult<Self> {
        let exit_actions: ExitActions = config
            .exit_actions
            .parse()
            .map_err(|err: LifecycleError| ControllerError::ExitActions(err.to_string()))?;
        let connection = ControllerConnection::new(
            config.service_url(),
            config.token_header.clone(),
            tokens,
            proto::SessionOpen {
                workflow_id: config.workflow_id.clone(),
                group_name: config.group_name.clone(),
                task_name: config.task_name.clone(),
                retry_id: config.retry_id,
            },
        );
        Ok(Self {
            registry: default_registry(&config),
            exit_actions,
            buffer: Arc::new(LogBuffer::new(config.log_buffer_size)),
            connection: Arc::new(connection),
            config,
        })
    }

    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_connection(mut self, connection: ControllerConnection) -> Self {
        self.connection = Arc::new(connection);
        self
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    fn source(&self) -> &str {
        &self.config.task_name
    }

    fn log(&self, io_type: proto::IoType, text: impl Into<String>) {
        self.buffer.push_line(self.source(), io_type, text);
    }

    /// Control-plane marker, e.g. `[osmo] error_type=download`.
    fn marker(&self, text: impl AsRef<str>) {
        self.log(proto::IoType::OsmoCtrl, format!("[osmo] {}", text.as_ref()));
    }

    /// Run the task to completion. `shutdown` cancels the user command; the
    /// outputs and logs are still handled afterwards.
    pub async fn run(self, shutdown: CancellationToken) -> ControllerResult<TaskReport> {
        let session = CancellationToken::new();
        let connection_task = tokio::spawn(Arc::clone(&self.connection).run(session.clone()));

        let flusher_stop = CancellationToken::new();
        let flusher = tokio::spawn(flush_loop(
            Arc::clone(&self.buffer),
            Arc::clone(&self.connection) as Arc<dyn LogSink>,
            self.config.log_flush_period(),
            flusher_stop.clone(),
        ));

        let control = self.start_control_socket(session.clone());

        let mut report = self.execute(&shutdown).await;

        flusher_stop.cancel();
        let _ = flusher.await;
        self.log(proto::IoType::LogDone, "");
        self.final_flush().await;
        report.dropped_logs = self.buffer.dropped();

        session.cancel();
        let _ = connection_task.await;
        if let Some(control) = control {
            let _ = control.await;
        }

        info!(
            status = %report.status,
            exit_code = ?report.exit_code,
            restarts = report.restarts,
            dropped_logs = report.dropped_logs,
            "task controller finished"
        );
        Ok(report)
    }

    #[cfg(unix)]
    fn start_control_socket(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        use super::control_socket::{ControlHandler, ControlSocket};

        match ControlSocket::bind(&self.config.socket_path) {
            Ok(socket) => {
                let handler = Arc::clone(&self.connection) as Arc<dyn ControlHandler>;
                Some(tokio::spawn(socket.serve(handler, shutdown)))
            }
            Err(err) => {
                warn!(error = %err, path = %self.config.socket_path.display(), "control socket unavailable");
                self.marker(format!("error_type=control_socket {err}"));
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn start_control_socket(&self, _shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.marker("error_type=control_socket unsupported platform");
        None
    }

    async fn final_flush(&self) {
        let deadline = Instant::now() + FINAL_FLUSH_TIMEOUT;
        loop {
            if !self.buffer.is_empty() && flush_once(&self.buffer, self.connection.as_ref()).await {
                continue;
            }
            let unacked = self.connection.unacked_batches();
            if self.buffer.is_empty() && unacked == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.buffer.len(),
                    unacked,
                    "giving up on final log flush"
                );
                return;
            }
            tokio::time::sleep(FINAL_FLUSH_RETRY).await;
        }
    }

    fn command_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "OSMO_SOCKET_PATH".to_string(),
                self.config.socket_path.display().to_string(),
            ),
            ("OSMO_WORKFLOW_ID".to_string(), self.config.workflow_id.clone()),
            ("OSMO_TASK_NAME".to_string(), self.config.task_name.clone()),
            ("OSMO_GROUP_NAME".to_string(), self.config.group_name.clone()),
            ("OSMO_RETRY_ID".to_string(), self.config.retry_id.to_string()),
        ]
    }

    async fn execute(&self, shutdown: &CancellationToken) -> TaskReport {
        let config = &self.config;

        self.marker("phase=download");
        let plan = plan_inputs(&config.inputs, &config.data_dir, config.cache_size_mib);
        for input in &plan {
            self.log(
                proto::IoType::Download,
                format!("input {} <- {}", input.index, input.uri),
            );
        }
        match download_inputs(&self.registry, &plan).await {
            Ok(bytes) => self.log(proto::IoType::Download, format!("staged {bytes} bytes")),
            Err(err) => {
                self.log(proto::IoType::Download, err.to_string());
                self.marker("error_type=download");
                return TaskReport::new(TaskGroupStatus::Failed);
            }
        }

        let output = output_dir(&config.data_dir);
        if let Err(err) = tokio::fs::create_dir_all(&output).await {
            self.marker(format!("error_type=output_dir {err}"));
            return TaskReport::new(TaskGroupStatus::Failed);
        }
        let command = match substitute_tokens(&config.command, &plan, &output) {
            Ok(command) => command,
            Err(err) => {
                self.marker(format!("error_type=invalid_command {err}"));
                return TaskReport::new(TaskGroupStatus::Failed);
            }
        };

        let mut report = self.execute_with_restarts(&command, shutdown).await;

        if should_upload(report.status) {
            let destination = output_destination(
                config.output.as_deref(),
                &config.intermediate_location,
                &config.workflow_id,
                &config.task_name,
            );
            self.marker("phase=upload");
            let uploaded = match self.registry.driver_for(&destination) {
                Ok(driver) => driver.upload(&output, &destination).await,
                Err(err) => Err(err),
            };
            match uploaded {
                Ok(bytes) => self.log(
                    proto::IoType::Upload,
                    format!("uploaded {bytes} bytes -> {destination}"),
                ),
                Err(err) => {
                    self.log(proto::IoType::Upload, err.to_string());
                    self.marker("error_type=upload");
                    if report.status == TaskGroupStatus::Completed {
                        report.status = TaskGroupStatus::Failed;
                    }
                }
            }
        } else {
            self.marker(format!("upload skipped status={}", report.status));
        }
        report
    }

    async fn execute_with_restarts(
        &self,
        command: &[String],
        shutdown: &CancellationToken,
    ) -> TaskReport {
        let env = self.command_env();
        let mut restarts = 0;
        loop {
            self.marker(format!("phase=execute restart={restarts}"));
            let outcome = run_command(
                command,
                &env,
                None,
                self.source(),
                Arc::clone(&self.buffer),
                shutdown.clone(),
            )
            .await;

            let mut report = match outcome {
                Err(err) => {
                    self.marker(format!("error_type=exec {err}"));
                    TaskReport::new(TaskGroupStatus::Failed)
                }
                Ok(ExecOutcome::Canceled) => {
                    self.marker("error_type=canceled");
                    TaskReport::new(TaskGroupStatus::FailedCanceled)
                }
                Ok(ExecOutcome::Signaled) => {
                    self.marker("error_type=signal");
                    TaskReport {
                        action: Some(ExitAction::Fail),
                        ..TaskReport::new(TaskGroupStatus::Failed)
                    }
                }
                Ok(ExecOutcome::Exited(code)) => {
                    self.marker(format!("exit_code={code}"));
                    let action = self.exit_actions.action_for(code);
                    if action == ExitAction::Restart && restarts < self.config.max_restarts {
                        restarts += 1;
                        self.marker(format!("action=RESTART restart={restarts}"));
                        continue;
                    }
                    let (status, action) = match action {
                        ExitAction::Complete => (TaskGroupStatus::Completed, action),
                        ExitAction::Restart => {
                            self.marker("error_type=restart_limit");
                            (TaskGroupStatus::Failed, ExitAction::Fail)
                        }
                        ExitAction::Reschedule => {
                            self.marker("error_type=reschedule");
                            (TaskGroupStatus::Failed, action)
                        }
                        ExitAction::Fail => {
                            self.marker("error_type=exit_code");
                            (TaskGroupStatus::Failed, action)
                        }
                    };
                    TaskReport {
                        exit_code: Some(code),
                        action: Some(action),
                        ..TaskReport::new(status)
                    }
                }
            };
            report.restarts = restarts;
            return report;
        }
    }
}
