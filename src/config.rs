//! Configuration loading.
//!
//! The coordination service reads environment variables (a `.env` file is
//! loaded first when present):
//! - `OSMO_DATABASE_URL`: PostgreSQL connection string (optional; in-memory store when unset)
//! - `OSMO_GRPC_ADDR`: gRPC bind address (default: 127.0.0.1:24130)
//! - `OSMO_MAX_RETRIES`: Reschedule ceiling per task (required)
//! - `OSMO_NODE_CONDITION_POP_TIMEOUT_MS`: Blocking pop timeout (default: 5000)
//! - `OSMO_BACKOFF_BASE_MS`: Queue error backoff baseline (default: 500)
//! - `OSMO_BACKOFF_MAX_MS`: Queue error backoff cap (default: 30000)
//! - `OSMO_BARRIER_TIMEOUT_MS`: How long a barrier waits for stragglers (default: 600000)
//! - `OSMO_EVENT_POLL_INTERVAL_MS`: Event consumer poll interval (default: 200)
//! - `OSMO_CONTROLLER_TOKENS`: Comma-separated tokens accepted from task controllers (optional)
//!
//! The in-pod controller is configured through `osmo-ctrl run` flags, each
//! with an `OSMO_*` environment fallback (see [`ControllerConfig`]).

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use clap::Args;

use crate::lifecycle::{EventConsumerConfig, RetryPolicy};
use crate::retry::{BackoffConfig, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS};
use crate::server::ServerOptions;

/// Default gRPC bind address for the coordination service.
pub const DEFAULT_GRPC_ADDR: &str = "127.0.0.1:24130";

pub const DEFAULT_POP_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_BARRIER_TIMEOUT_MS: u64 = 600_000;

pub const DEFAULT_EVENT_POLL_INTERVAL_MS: u64 = 200;

/// Coordination service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// PostgreSQL connection URL; `None` selects the in-memory store
    pub database_url: Option<String>,

    /// gRPC bind address (listener, config and controller services + health)
    pub grpc_addr: SocketAddr,

    /// Reschedule ceiling applied to every task
    pub max_retries: u32,

    /// Node condition queue pop timeout (milliseconds)
    pub pop_timeout_ms: u64,

    /// Backoff baseline after a queue error (milliseconds)
    pub backoff_base_ms: i32,

    /// Backoff cap (milliseconds)
    pub backoff_max_ms: i64,

    /// Barrier wait limit (milliseconds)
    pub barrier_timeout_ms: u64,

    /// Event consumer poll interval (milliseconds)
    pub event_poll_interval_ms: u64,

    /// Tokens accepted on controller sessions. `None` disables the check.
    pub controller_tokens: Option<Vec<String>>,
}

impl ServiceConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("OSMO_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let grpc_addr =
            env::var("OSMO_GRPC_ADDR").unwrap_or_else(|_| DEFAULT_GRPC_ADDR.to_string());
        let grpc_addr =
            SocketAddr::from_str(&grpc_addr).context("invalid OSMO_GRPC_ADDR format")?;

        let max_retries = env::var("OSMO_MAX_RETRIES")
            .context("OSMO_MAX_RETRIES environment variable is required")?;
        let max_retries = max_retries
            .trim()
            .parse()
            .with_context(|| format!("invalid OSMO_MAX_RETRIES value: {max_retries}"))?;

        let pop_timeout_ms = env::var("OSMO_NODE_CONDITION_POP_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POP_TIMEOUT_MS);

        let backoff_base_ms = env::var("OSMO_BACKOFF_BASE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BASE_DELAY_MS);

        let backoff_max_ms = env::var("OSMO_BACKOFF_MAX_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_DELAY_MS);

        let barrier_timeout_ms = env::var("OSMO_BARRIER_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BARRIER_TIMEOUT_MS);

        let event_poll_interval_ms = env::var("OSMO_EVENT_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_EVENT_POLL_INTERVAL_MS);

        let controller_tokens = env::var("OSMO_CONTROLLER_TOKENS").ok().map(|tokens| {
            tokens
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        Ok(Self {
            database_url,
            grpc_addr,
            max_retries,
            pop_timeout_ms,
            backoff_base_ms,
            backoff_max_ms,
            barrier_timeout_ms,
            event_poll_interval_ms,
            controller_tokens,
        })
    }

    /// Create a test configuration with defaults
    pub fn test_config() -> Self {
        Self {
            database_url: None,
            grpc_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_retries: 2,
            pop_timeout_ms: 200,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            barrier_timeout_ms: 2_000,
            event_poll_interval_ms: 20,
            controller_tokens: None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            pop_timeout: Duration::from_millis(self.pop_timeout_ms),
            backoff: BackoffConfig::exponential(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms.max(0) as u64),
            barrier_timeout: Duration::from_millis(self.barrier_timeout_ms),
            controller_tokens: self.controller_tokens.clone(),
        }
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn event_consumer_config(&self) -> EventConsumerConfig {
        EventConsumerConfig {
            poll_interval: self.event_poll_interval(),
            backoff: BackoffConfig::exponential(self.backoff_base_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms.max(0) as u64),
            ..Default::default()
        }
    }
}

/// Lower bound on the controller's log flush period.
pub const MIN_LOG_FLUSH_PERIOD_MS: u64 = 1;

/// In-pod controller configuration (`osmo-ctrl run`).
#[derive(Args, Debug, Clone)]
pub struct ControllerConfig {
    /// Workflow id this task belongs to.
    #[arg(long, env = "OSMO_WORKFLOW_ID")]
    pub workflow_id: String,

    /// Task name; also the log source.
    #[arg(long, env = "OSMO_TASK_NAME")]
    pub task_name: String,

    #[arg(long, env = "OSMO_GROUP_NAME")]
    pub group_name: String,

    #[arg(long, env = "OSMO_RETRY_ID", default_value_t = 0)]
    pub retry_id: u32,

    /// Local control socket the user command talks to.
    #[arg(long, env = "OSMO_SOCKET_PATH", default_value = "/tmp/osmo/ctrl.sock")]
    pub socket_path: PathBuf,

    #[arg(long, env = "OSMO_SERVICE_SCHEME", default_value = "http")]
    pub service_scheme: String,

    #[arg(long, env = "OSMO_SERVICE_HOST", default_value = "127.0.0.1")]
    pub service_host: String,

    #[arg(long, env = "OSMO_SERVICE_PORT", default_value_t = 24130)]
    pub service_port: u16,

    /// Long-lived refresh token exchanged for session tokens.
    #[arg(long, env = "OSMO_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    #[arg(long, env = "OSMO_REFRESH_PATH", default_value = "/api/auth/jwt/refresh_token")]
    pub refresh_path: String,

    /// Header carrying the session token.
    #[arg(long, env = "OSMO_TOKEN_HEADER", default_value = "x-osmo-auth")]
    pub token_header: String,

    #[arg(long, env = "OSMO_LOG_FLUSH_PERIOD_MS", default_value_t = 100)]
    pub log_flush_period_ms: u64,

    #[arg(long, env = "OSMO_LOG_BUFFER_SIZE", default_value_t = 10_000)]
    pub log_buffer_size: usize,

    /// Aggregate input cache (MiB, 0 = unbounded), split evenly across inputs.
    #[arg(long, env = "OSMO_CACHE_SIZE_MIB", default_value_t = 0)]
    pub cache_size_mib: u64,

    #[arg(long, env = "OSMO_RSYNC_ENABLED", default_value_t = false)]
    pub rsync_enabled: bool,

    /// Read byte-rate limit for rsync transfers (bytes/s, 0 = unlimited).
    #[arg(long, env = "OSMO_RSYNC_READ_LIMIT", default_value_t = 0)]
    pub rsync_read_limit: u64,

    /// Write byte-rate limit for rsync transfers (bytes/s, 0 = unlimited).
    #[arg(long, env = "OSMO_RSYNC_WRITE_LIMIT", default_value_t = 0)]
    pub rsync_write_limit: u64,

    #[arg(long, env = "OSMO_RSYNC_ALLOWED_PATHS", value_delimiter = ',')]
    pub rsync_allowed_paths: Vec<PathBuf>,

    #[arg(long, env = "OSMO_DATA_DIR", default_value = "/osmo/data")]
    pub data_dir: PathBuf,

    /// Fallback destination for outputs when none is declared.
    #[arg(long, env = "OSMO_INTERMEDIATE_LOCATION", default_value = "/osmo/intermediate")]
    pub intermediate_location: String,

    #[arg(long = "input", env = "OSMO_INPUTS", value_delimiter = ',')]
    pub inputs: Vec<String>,

    #[arg(long, env = "OSMO_OUTPUT")]
    pub output: Option<String>,

    /// Exit code actions, e.g. `RESCHEDULE=10-20,RESTART=3`.
    #[arg(long, env = "OSMO_EXIT_ACTIONS", default_value = "")]
    pub exit_actions: String,

    #[arg(long, env = "OSMO_MAX_RESTARTS", default_value_t = 0)]
    pub max_restarts: u32,

    /// User command and its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl ControllerConfig {
    pub fn service_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.service_scheme, self.service_host, self.service_port
        )
    }

    pub fn log_flush_period(&self) -> Duration {
        Duration::from_millis(self.log_flush_period_ms.max(MIN_LOG_FLUSH_PERIOD_MS))
    }
}
