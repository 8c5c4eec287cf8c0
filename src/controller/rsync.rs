//! Rate-limited rsync transfers restricted to an allow-list of local paths.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tonic::async_trait;
use tracing::{debug, warn};

use super::staging::{DataDriver, StagingError, check_cache_share};

#[derive(Clone, Debug, Default)]
pub struct RsyncOptions {
    /// Bytes per second when reading from the remote side; 0 is unlimited.
    pub read_limit: u64,
    /// Bytes per second when writing to the remote side; 0 is unlimited.
    pub write_limit: u64,
    pub allowed_paths: Vec<PathBuf>,
    /// Binary to run, `rsync` unless overridden.
    pub program: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// rsync `--bwlimit` value in KiB/s, rounded up. `None` for unlimited.
pub fn bwlimit_kib(bytes_per_second: u64) -> Option<u64> {
    (bytes_per_second > 0).then(|| bytes_per_second.div_ceil(1024))
}

// Lexical normalization; `..` that would climb above the root is rejected.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Some(normalized)
}

/// Check every path against the allow-list. Fails on the first path that is
/// not under an allowed root, so callers check a whole set before starting.
pub fn validate_paths(allowed: &[PathBuf], paths: &[&Path]) -> Result<(), StagingError> {
    let roots: Vec<PathBuf> = allowed.iter().filter_map(|root| normalize(root)).collect();
    for path in paths {
        let allowed = path.is_absolute()
            && normalize(path).is_some_and(|path| roots.iter().any(|root| path.starts_with(root)));
        if !allowed {
            return Err(StagingError::PathNotAllowed(path.to_path_buf()));
        }
    }
    Ok(())
}

pub struct RsyncDriver {
    options: RsyncOptions,
}

impl RsyncDriver {
    pub fn new(options: RsyncOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RsyncOptions {
        &self.options
    }

    /// rsync invocation for one transfer. Reads are capped by `read_limit`
    /// and writes by `write_limit`.
    pub fn build_command(&self, direction: Direction, remote: &str, local: &Path) -> Command {
        self.command(direction, remote, local, false)
    }

    /// Dry-run download that only reports what a transfer would move.
    pub fn build_dry_run(&self, remote: &str, local: &Path) -> Command {
        self.command(Direction::Download, remote, local, true)
    }

    fn command(&self, direction: Direction, remote: &str, local: &Path, dry_run: bool) -> Command {
        let program = self
            .options
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from("rsync"));
        let mut command = Command::new(program);
        command.arg("--archive").arg("--stats");
        if dry_run {
            command.arg("--dry-run");
        }
        let limit = match direction {
            Direction::Download => self.options.read_limit,
            Direction::Upload => self.options.write_limit,
        };
        if let Some(kib) = bwlimit_kib(limit) {
            command.arg(format!("--bwlimit={kib}"));
        }
        let local = format!("{}/", local.display());
        match direction {
            Direction::Download => command.arg(remote).arg(local),
            Direction::Upload => command.arg(local).arg(remote),
        };
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command
    }

    async fn transfer(&self, direction: Direction, uri: &str, local: &Path) -> Result<u64, StagingError> {
        validate_paths(&self.options.allowed_paths, &[local])?;
        let stats = self
            .run(self.build_command(direction, uri, local), uri, local)
            .await?;
        let bytes = parse_stat(&stats, "Total transferred file size:");
        debug!(uri = %uri, ?direction, bytes, "rsync transfer done");
        Ok(bytes)
    }

    /// Size of the remote tree, without transferring it.
    async fn remote_size(&self, uri: &str, local: &Path) -> Result<u64, StagingError> {
        let stats = self.run(self.build_dry_run(uri, local), uri, local).await?;
        Ok(parse_stat(&stats, "Total file size:"))
    }

    async fn run(&self, mut command: Command, uri: &str, local: &Path) -> Result<String, StagingError> {
        let output = command
            .output()
            .await
            .map_err(|err| StagingError::io(local, err))?;
        if !output.status.success() {
            warn!(
                uri = %uri,
                code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "rsync transfer failed"
            );
            return Err(StagingError::TransferFailed {
                uri: uri.to_string(),
                code: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// `--stats` prints lines like "Total transferred file size: 1,234 bytes".
fn parse_stat(stats: &str, label: &str) -> u64 {
    stats
        .lines()
        .find_map(|line| line.trim().strip_prefix(label))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|number| number.replace(',', "").parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl DataDriver for RsyncDriver {
    fn scheme(&self) -> &'static str {
        "rsync"
    }

    fn validate(&self, _uri: &str, local: &Path) -> Result<(), StagingError> {
        validate_paths(&self.options.allowed_paths, &[local])
    }

    async fn download(
        &self,
        uri: &str,
        destination: &Path,
        cache_bytes: Option<u64>,
    ) -> Result<u64, StagingError> {
        if cache_bytes.is_some() {
            validate_paths(&self.options.allowed_paths, &[destination])?;
            let size = self.remote_size(uri, destination).await?;
            check_cache_share(uri, size, cache_bytes)?;
        }
        self.transfer(Direction::Download, uri, destination).await
    }

    async fn upload(&self, source: &Path, uri: &str) -> Result<u64, StagingError> {
        self.transfer(Direction::Upload, uri, source).await
    }
}
