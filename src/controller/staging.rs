//! Input and output staging.
//!
//! Data URIs are resolved through a [`DriverRegistry`] keyed by scheme. Bare
//! paths use the `file` driver. Every input is checked (driver exists, paths
//! allowed) before the first transfer starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tonic::async_trait;
use tracing::{debug, info};

use crate::lifecycle::TaskGroupStatus;

const BYTES_PER_MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("no data driver for scheme {0:?}")]
    NoDriver(String),
    #[error("invalid data uri {0:?}")]
    InvalidUri(String),
    #[error("path {0} is outside the allowed paths")]
    PathNotAllowed(PathBuf),
    #[error("command references {{{{input:{0}}}}} but only {1} inputs are declared")]
    UnknownInput(usize, usize),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer of {uri} exited with {code:?}")]
    TransferFailed { uri: String, code: Option<i32> },
    #[error("{uri} needs {bytes} bytes but its cache share is {limit} bytes")]
    CacheExceeded { uri: String, bytes: u64, limit: u64 },
}

impl StagingError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reject an input of `bytes` that does not fit its cache share.
pub fn check_cache_share(uri: &str, bytes: u64, limit: Option<u64>) -> Result<(), StagingError> {
    match limit {
        Some(limit) if bytes > limit => Err(StagingError::CacheExceeded {
            uri: uri.to_string(),
            bytes,
            limit,
        }),
        _ => Ok(()),
    }
}

/// Moves data between a URI and a local path.
#[async_trait]
pub trait DataDriver: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Check a planned transfer without moving anything.
    fn validate(&self, _uri: &str, _local: &Path) -> Result<(), StagingError> {
        Ok(())
    }

    /// Fetch `uri` into `destination`. `cache_bytes` is this input's share of
    /// the local cache (`None` when unbounded); an input larger than its
    /// share fails with [`StagingError::CacheExceeded`]. Returns the number
    /// of bytes written.
    async fn download(
        &self,
        uri: &str,
        destination: &Path,
        cache_bytes: Option<u64>,
    ) -> Result<u64, StagingError>;

    /// Push the contents of `source` to `uri`.
    async fn upload(&self, source: &Path, uri: &str) -> Result<u64, StagingError>;
}

/// Split a URI into (scheme, remainder). Bare paths are `file`.
pub fn split_uri(uri: &str) -> (&str, &str) {
    match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("file", uri),
    }
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn DataDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, driver: Arc<dyn DataDriver>) -> Self {
        self.drivers.insert(driver.scheme(), driver);
        self
    }

    pub fn driver_for(&self, uri: &str) -> Result<Arc<dyn DataDriver>, StagingError> {
        let (scheme, _) = split_uri(uri);
        self.drivers
            .get(scheme)
            .cloned()
            .ok_or_else(|| StagingError::NoDriver(scheme.to_string()))
    }
}

/// One declared input and where it lands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedInput {
    pub index: usize,
    pub uri: String,
    pub local: PathBuf,
    pub cache_bytes: Option<u64>,
}

/// Even share of the aggregate cache for each of `inputs` inputs. A cache
/// size of 0 leaves inputs unbounded.
pub fn cache_share_bytes(cache_size_mib: u64, inputs: usize) -> Option<u64> {
    if cache_size_mib == 0 || inputs == 0 {
        return None;
    }
    Some(cache_size_mib.saturating_mul(BYTES_PER_MIB) / inputs as u64)
}

pub fn input_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("input")
}

pub fn output_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("output")
}

/// Inputs land in `<data_dir>/input/<N>` in declaration order.
pub fn plan_inputs(inputs: &[String], data_dir: &Path, cache_size_mib: u64) -> Vec<StagedInput> {
    let share = cache_share_bytes(cache_size_mib, inputs.len());
    inputs
        .iter()
        .enumerate()
        .map(|(index, uri)| StagedInput {
            index,
            uri: uri.clone(),
            local: input_dir(data_dir).join(index.to_string()),
            cache_bytes: share,
        })
        .collect()
}

/// Resolve every input's driver and validate it. Nothing is transferred.
pub fn validate_inputs(
    registry: &DriverRegistry,
    plan: &[StagedInput],
) -> Result<Vec<Arc<dyn DataDriver>>, StagingError> {
    plan.iter()
        .map(|input| {
            let driver = registry.driver_for(&input.uri)?;
            driver.validate(&input.uri, &input.local)?;
            Ok(driver)
        })
        .collect()
}

/// Download every planned input, after validating all of them.
pub async fn download_inputs(
    registry: &DriverRegistry,
    plan: &[StagedInput],
) -> Result<u64, StagingError> {
    let drivers = validate_inputs(registry, plan)?;
    let mut total = 0;
    for (input, driver) in plan.iter().zip(drivers) {
        tokio::fs::create_dir_all(&input.local)
            .await
            .map_err(|err| StagingError::io(&input.local, err))?;
        let bytes = driver
            .download(&input.uri, &input.local, input.cache_bytes)
            .await?;
        info!(index = input.index, uri = %input.uri, bytes, "input staged");
        total += bytes;
    }
    Ok(total)
}

/// Replace `{{input:N}}` and `{{output}}` tokens in each argument.
pub fn substitute_tokens(
    args: &[String],
    inputs: &[StagedInput],
    output: &Path,
) -> Result<Vec<String>, StagingError> {
    args.iter()
        .map(|arg| substitute_arg(arg, inputs, output))
        .collect()
}

fn substitute_arg(arg: &str, inputs: &[StagedInput], output: &Path) -> Result<String, StagingError> {
    let mut result = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            result.push_str(&rest[start..]);
            return Ok(result);
        };
        let token = after[..end].trim();
        if token == "output" {
            result.push_str(&output.display().to_string());
        } else if let Some(index) = token
            .strip_prefix("input:")
            .and_then(|index| index.trim().parse::<usize>().ok())
        {
            let input = inputs
                .get(index)
                .ok_or(StagingError::UnknownInput(index, inputs.len()))?;
            result.push_str(&input.local.display().to_string());
        } else {
            result.push_str(&rest[start..start + 2 + end + 2]);
        }
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Outputs are uploaded after normal completion or a user failure. Tasks
/// that were canceled, evicted or preempted skip upload entirely.
pub fn should_upload(status: TaskGroupStatus) -> bool {
    matches!(status, TaskGroupStatus::Completed | TaskGroupStatus::Failed)
}

/// Declared output, or `<intermediate>/<workflow>/<task>` when none was declared.
pub fn output_destination(
    output: Option<&str>,
    intermediate: &str,
    workflow_id: &str,
    task_name: &str,
) -> String {
    match output {
        Some(output) if !output.trim().is_empty() => output.to_string(),
        _ => format!(
            "{}/{workflow_id}/{task_name}",
            intermediate.trim_end_matches('/')
        ),
    }
}

/// Plain filesystem copies, for `file://` URIs and bare paths.
pub struct LocalDriver;

#[async_trait]
impl DataDriver for LocalDriver {
    fn scheme(&self) -> &'static str {
        "file"
    }

    async fn download(
        &self,
        uri: &str,
        destination: &Path,
        cache_bytes: Option<u64>,
    ) -> Result<u64, StagingError> {
        let (_, path) = split_uri(uri);
        let source = Path::new(path);
        if cache_bytes.is_some() {
            check_cache_share(uri, tree_size(source).await?, cache_bytes)?;
        }
        copy_into(source, destination).await
    }

    async fn upload(&self, source: &Path, uri: &str) -> Result<u64, StagingError> {
        let (_, path) = split_uri(uri);
        copy_into(source, Path::new(path)).await
    }
}

/// Total size of the regular files under `path` (or of `path` itself).
async fn tree_size(path: &Path) -> Result<u64, StagingError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|err| StagingError::io(path, err))?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| StagingError::io(&dir, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StagingError::io(&dir, err))?
        {
            let entry_path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .map_err(|err| StagingError::io(&entry_path, err))?;
            if metadata.is_dir() {
                pending.push(entry_path);
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Copy a file or directory tree into `destination` (a directory).
async fn copy_into(source: &Path, destination: &Path) -> Result<u64, StagingError> {
    let metadata = tokio::fs::metadata(source)
        .await
        .map_err(|err| StagingError::io(source, err))?;
    tokio::fs::create_dir_all(destination)
        .await
        .map_err(|err| StagingError::io(destination, err))?;

    if metadata.is_file() {
        let name = source
            .file_name()
            .ok_or_else(|| StagingError::InvalidUri(source.display().to_string()))?;
        let target = destination.join(name);
        return tokio::fs::copy(source, &target)
            .await
            .map_err(|err| StagingError::io(&target, err));
    }

    let mut total = 0;
    let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .map_err(|err| StagingError::io(&from, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StagingError::io(&from, err))?
        {
            let path = entry.path();
            let target = to.join(entry.file_name());
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| StagingError::io(&path, err))?;
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|err| StagingError::io(&target, err))?;
                pending.push((path, target));
            } else {
                total += tokio::fs::copy(&path, &target)
                    .await
                    .map_err(|err| StagingError::io(&target, err))?;
            }
        }
    }
    debug!(source = %source.display(), destination = %destination.display(), bytes = total, "copied tree");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(count: usize) -> Vec<StagedInput> {
        let inputs: Vec<String> = (0..count).map(|i| format!("file:///data/{i}")).collect();
        plan_inputs(&inputs, Path::new("/osmo/data"), 300)
    }

    #[test]
    fn test_cache_split_evenly() {
        assert_eq!(cache_share_bytes(300, 3), Some(100 * BYTES_PER_MIB));
        assert_eq!(cache_share_bytes(300, 0), None);
        assert_eq!(cache_share_bytes(0, 3), None);
        let plan = plan(2);
        assert_eq!(plan[0].cache_bytes, Some(150 * BYTES_PER_MIB));
        assert_eq!(plan[1].local, PathBuf::from("/osmo/data/input/1"));
    }

    #[test]
    fn test_token_substitution() {
        let plan = plan(2);
        let args = vec![
            "--train={{input:0}}/train".to_string(),
            "--eval={{ input:1 }}".to_string(),
            "--out={{output}}".to_string(),
            "{{unknown}}".to_string(),
            "plain".to_string(),
        ];
        let substituted = substitute_tokens(&args, &plan, Path::new("/osmo/data/output")).expect("substitute");
        assert_eq!(
            substituted,
            vec![
                "--train=/osmo/data/input/0/train",
                "--eval=/osmo/data/input/1",
                "--out=/osmo/data/output",
                "{{unknown}}",
                "plain",
            ]
        );
    }

    #[test]
    fn test_substitution_rejects_missing_input() {
        let plan = plan(1);
        let err = substitute_tokens(&["{{input:3}}".to_string()], &plan, Path::new("/out")).unwrap_err();
        assert!(matches!(err, StagingError::UnknownInput(3, 1)));
    }

    #[test]
    fn test_unknown_scheme_has_no_driver() {
        let registry = DriverRegistry::new().register(Arc::new(LocalDriver));
        assert!(registry.driver_for("/plain/path").is_ok());
        assert!(registry.driver_for("file:///a").is_ok());
        assert!(matches!(
            registry.driver_for("s3://bucket/key"),
            Err(StagingError::NoDriver(scheme)) if scheme == "s3"
        ));
    }

    #[test]
    fn test_validation_happens_before_any_transfer() {
        let registry = DriverRegistry::new().register(Arc::new(LocalDriver));
        let inputs = vec!["file:///a".to_string(), "gs://bucket/b".to_string()];
        let plan = plan_inputs(&inputs, Path::new("/osmo/data"), 0);
        assert!(matches!(
            validate_inputs(&registry, &plan),
            Err(StagingError::NoDriver(_))
        ));
    }

    #[test]
    fn test_upload_decision() {
        assert!(should_upload(TaskGroupStatus::Completed));
        assert!(should_upload(TaskGroupStatus::Failed));
        assert!(!should_upload(TaskGroupStatus::FailedCanceled));
        assert!(!should_upload(TaskGroupStatus::FailedEvicted));
        assert!(!should_upload(TaskGroupStatus::FailedPreempted));
    }

    #[test]
    fn test_output_falls_back_to_intermediate() {
        assert_eq!(
            output_destination(None, "s3://bucket/inter/", "wf-1", "train"),
            "s3://bucket/inter/wf-1/train"
        );
        assert_eq!(
            output_destination(Some("file:///results"), "s3://x", "wf-1", "train"),
            "file:///results"
        );
    }

    #[tokio::test]
    async fn test_local_driver_copies_tree() {
        let source = tempfile::tempdir().expect("tempdir");
        tokio::fs::create_dir_all(source.path().join("nested")).await.expect("mkdir");
        tokio::fs::write(source.path().join("a.txt"), b"hello").await.expect("write");
        tokio::fs::write(source.path().join("nested/b.txt"), b"world!").await.expect("write");

        let data_dir = tempfile::tempdir().expect("tempdir");
        let registry = DriverRegistry::new().register(Arc::new(LocalDriver));
        let inputs = vec![source.path().display().to_string()];
        let plan = plan_inputs(&inputs, data_dir.path(), 0);
        let bytes = download_inputs(&registry, &plan).await.expect("download");
        assert_eq!(bytes, 11);
        let copied = tokio::fs::read_to_string(plan[0].local.join("nested/b.txt"))
            .await
            .expect("read");
        assert_eq!(copied, "world!");
    }

    #[tokio::test]
    async fn test_input_larger_than_cache_share_is_rejected() {
        let source = tempfile::tempdir().expect("tempdir");
        let small = source.path().join("small.bin");
        let large = source.path().join("large.bin");
        tokio::fs::write(&small, vec![0u8; 1024]).await.expect("write");
        tokio::fs::write(&large, vec![0u8; 600 * 1024]).await.expect("write");

        // 1 MiB over two inputs leaves 512 KiB each.
        let data_dir = tempfile::tempdir().expect("tempdir");
        let registry = DriverRegistry::new().register(Arc::new(LocalDriver));
        let inputs = vec![small.display().to_string(), large.display().to_string()];
        let plan = plan_inputs(&inputs, data_dir.path(), 1);
        let err = download_inputs(&registry, &plan).await.unwrap_err();
        assert!(matches!(
            err,
            StagingError::CacheExceeded { bytes, limit, .. }
                if bytes == 600 * 1024 && limit == 512 * 1024
        ));
        assert!(plan[0].local.join("small.bin").exists());
        assert!(!plan[1].local.join("large.bin").exists());

        // The same input fits when it has the whole cache.
        let plan = plan_inputs(&inputs[1..], data_dir.path(), 1);
        assert_eq!(
            download_inputs(&registry, &plan).await.expect("download"),
            600 * 1024
        );
    }
}
