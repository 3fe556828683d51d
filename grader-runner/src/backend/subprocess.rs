//! Local subprocess backend
//!
//! Runs the converter executable as a child process with the job's input and
//! output directories as arguments. A non-zero exit is a hard failure.

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{
    ExecutionBackend, ExecutionOutput, ExecutionRequest, collect_output, converter_args,
};
use crate::error::ExecutionError;

/// Backend spawning the converter on the local machine
#[derive(Debug, Clone)]
pub struct LocalSubprocessBackend {
    executable: PathBuf,
    /// Arguments placed before the converter arguments (e.g. `-m grader_convert`)
    prefix_args: Vec<String>,
}

impl LocalSubprocessBackend {
    /// Creates the backend, failing if `executable` cannot be resolved
    pub fn new(executable: &str) -> anyhow::Result<Self> {
        let executable = resolve_executable(executable)?;
        info!("Using converter executable {}", executable.display());
        Ok(Self {
            executable,
            prefix_args: Vec::new(),
        })
    }

    pub fn with_prefix_args(mut self, prefix_args: Vec<String>) -> Self {
        self.prefix_args = prefix_args;
        self
    }
}

#[async_trait]
impl ExecutionBackend for LocalSubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn run(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput, ExecutionError> {
        let mut args = self.prefix_args.clone();
        args.extend(converter_args(request.kind, request.input, request.output));
        debug!("Executing {} {:?}", self.executable.display(), args);

        // Dropping the wait (job timeout, cancellation) kills the child
        let output = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExecutionError::Spawn {
                program: self.executable.display().to_string(),
                source,
            })?;

        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            debug!(
                "Converter failed for submission {}: exit_code={:?}",
                request.submission.id,
                output.status.code()
            );
            return Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                logs,
            });
        }

        collect_output(request.kind, request.output, logs).await
    }
}

/// Resolves `name` to an executable file
///
/// Names containing a path separator are checked as given, bare names are
/// looked up on `PATH`.
pub fn resolve_executable(name: &str) -> anyhow::Result<PathBuf> {
    if name.is_empty() {
        anyhow::bail!("executable name cannot be empty");
    }

    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        if is_executable(&path) {
            return Ok(path);
        }
        anyhow::bail!("'{}' is not an executable file", name);
    }

    let search_path = std::env::var_os("PATH").context("PATH is not set")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .with_context(|| format!("'{}' not found on PATH", name))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
