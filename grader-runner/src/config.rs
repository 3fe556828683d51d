//! Runner configuration
//!
//! Defines every configurable parameter of the grading runner: scratch and
//! repository locations, the execution backend, worker pool sizing, retry
//! behaviour and the Kubernetes settings of the pod backend.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backend::resolve_executable;
use crate::executor::ExecutorConfig;
use crate::retry::RetryPolicy;

/// Which substrate runs the transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Subprocess,
    Pod,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subprocess" => Ok(BackendKind::Subprocess),
            "pod" | "kubernetes" => Ok(BackendKind::Pod),
            other => anyhow::bail!("unknown backend '{}' (expected subprocess or pod)", other),
        }
    }
}

/// Settings of the pod backend
#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub namespace: String,
    /// Named kubeconfig context, `None` for in-cluster or default credentials
    pub context: Option<String>,
    /// JSON image lookup table
    pub image_config: Option<PathBuf>,
    /// Image used when the lookup table has no entry
    pub default_image: Option<String>,
    pub poll_interval: Duration,
    /// Persistent volume claim holding the data directory; hostPath if unset
    pub volume_claim: Option<String>,
    /// Host directory containing both scratch directories
    pub data_dir: PathBuf,
    /// Where the data directory is mounted inside pods
    pub mount_path: PathBuf,
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory of per-job input trees
    pub input_dir: PathBuf,

    /// Base directory of per-job output trees
    pub output_dir: PathBuf,

    /// Root of the bare repository layout
    pub git_root: PathBuf,

    pub git_executable: String,

    pub backend: BackendKind,

    /// Transformation executable, run locally or inside the pod
    pub convert_executable: String,

    /// Max parallel jobs
    pub concurrency: usize,

    /// Re-enqueue jobs interrupted by cancellation
    pub resubmit_cancelled: bool,

    /// Bounded queue size, `None` for unbounded
    pub queue_capacity: Option<usize>,

    /// Maximum time a job can run before it is abandoned
    pub job_timeout: Option<Duration>,

    /// Attempts for git fetch and publish, 1 means no retry
    pub retry_attempts: u32,

    /// Delay before the first retry, doubled per attempt
    pub retry_backoff: Duration,

    pub kube: KubeConfig,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - GRADER_INPUT_DIR, GRADER_OUTPUT_DIR, GRADER_GIT_ROOT (required)
    /// - GRADER_GIT_EXECUTABLE (optional, default: git)
    /// - GRADER_BACKEND (optional, subprocess or pod, default: subprocess)
    /// - GRADER_CONVERT_EXECUTABLE (optional, default: grader-convert)
    /// - GRADER_CONCURRENCY (optional, default: 1)
    /// - GRADER_RESUBMIT_CANCELLED (optional, default: false)
    /// - GRADER_QUEUE_CAPACITY (optional, default: unbounded)
    /// - GRADER_JOB_TIMEOUT (optional, seconds, default: none)
    /// - GRADER_RETRY_ATTEMPTS (optional, default: 1)
    /// - GRADER_RETRY_BACKOFF_MS (optional, default: 500)
    /// - KUBE_NAMESPACE, KUBE_CONTEXT, KUBE_IMAGE_CONFIG, KUBE_DEFAULT_IMAGE,
    ///   KUBE_POLL_INTERVAL_MS, KUBE_VOLUME_CLAIM, KUBE_DATA_DIR,
    ///   KUBE_MOUNT_PATH (pod backend)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| {
            var(key)
                .map(PathBuf::from)
                .ok_or_else(|| anyhow::anyhow!("{} environment variable not set", key))
        };

        let input_dir = required("GRADER_INPUT_DIR")?;
        let output_dir = required("GRADER_OUTPUT_DIR")?;
        let git_root = required("GRADER_GIT_ROOT")?;

        let data_dir = match var("KUBE_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => input_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| input_dir.clone()),
        };

        let kube = KubeConfig {
            namespace: var("KUBE_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            context: var("KUBE_CONTEXT"),
            image_config: var("KUBE_IMAGE_CONFIG").map(PathBuf::from),
            default_image: var("KUBE_DEFAULT_IMAGE"),
            poll_interval: Duration::from_millis(
                parse(&var, "KUBE_POLL_INTERVAL_MS")?.unwrap_or(1000),
            ),
            volume_claim: var("KUBE_VOLUME_CLAIM"),
            data_dir,
            mount_path: var("KUBE_MOUNT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/grader")),
        };

        Ok(Self {
            input_dir,
            output_dir,
            git_root,
            git_executable: var("GRADER_GIT_EXECUTABLE").unwrap_or_else(|| "git".to_string()),
            backend: parse(&var, "GRADER_BACKEND")?.unwrap_or(BackendKind::Subprocess),
            convert_executable: var("GRADER_CONVERT_EXECUTABLE")
                .unwrap_or_else(|| "grader-convert".to_string()),
            concurrency: parse(&var, "GRADER_CONCURRENCY")?.unwrap_or(1),
            resubmit_cancelled: parse(&var, "GRADER_RESUBMIT_CANCELLED")?.unwrap_or(false),
            queue_capacity: parse(&var, "GRADER_QUEUE_CAPACITY")?,
            job_timeout: parse(&var, "GRADER_JOB_TIMEOUT")?.map(Duration::from_secs),
            retry_attempts: parse(&var, "GRADER_RETRY_ATTEMPTS")?.unwrap_or(1),
            retry_backoff: Duration::from_millis(
                parse(&var, "GRADER_RETRY_BACKOFF_MS")?.unwrap_or(500),
            ),
            kube,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, dir) in [("input", &self.input_dir), ("output", &self.output_dir)] {
            if !dir.is_absolute() {
                anyhow::bail!("{} directory must be absolute: {}", name, dir.display());
            }
            if !dir.is_dir() {
                anyhow::bail!("{} directory does not exist: {}", name, dir.display());
            }
        }

        if !self.git_root.is_absolute() {
            anyhow::bail!("git root must be absolute: {}", self.git_root.display());
        }

        self.executor_config().validate()?;

        if self.retry_attempts == 0 {
            anyhow::bail!("retry attempts must be at least 1");
        }

        match self.backend {
            BackendKind::Subprocess => {
                resolve_executable(&self.convert_executable)
                    .context("converter executable is not usable")?;
            }
            BackendKind::Pod => self.validate_kube()?,
        }

        Ok(())
    }

    fn validate_kube(&self) -> anyhow::Result<()> {
        let kube = &self.kube;

        if kube.poll_interval.is_zero() {
            anyhow::bail!("pod poll interval must be greater than 0");
        }

        if !kube.mount_path.is_absolute() {
            anyhow::bail!("mount path must be absolute: {}", kube.mount_path.display());
        }

        for dir in [&self.input_dir, &self.output_dir] {
            if !dir.starts_with(&kube.data_dir) {
                anyhow::bail!(
                    "{} is not inside the shared data directory {}",
                    dir.display(),
                    kube.data_dir.display()
                );
            }
        }

        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            concurrency: self.concurrency,
            resubmit_cancelled_tasks: self.resubmit_cancelled,
            queue_capacity: self.queue_capacity,
            default_timeout: self.job_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(self.retry_attempts, self.retry_backoff)
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", value, key, e))
        })
        .transpose()
}
