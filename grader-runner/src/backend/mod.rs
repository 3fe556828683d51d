//! Execution backends
//!
//! A backend runs the grading or feedback transformation over an input tree
//! and leaves its result in an output tree. The pipeline never knows which
//! substrate did the work:
//! - [`InProcessBackend`]: direct call into a [`Transformation`]
//! - [`LocalSubprocessBackend`]: the converter executable as a child process
//! - [`ContainerPodBackend`]: the same command inside a Kubernetes pod

mod in_process;
pub mod pod;
mod subprocess;

pub use in_process::{InProcessBackend, Transformation};
pub use pod::ContainerPodBackend;
pub use subprocess::{LocalSubprocessBackend, resolve_executable};

use async_trait::async_trait;
use grader_core::domain::job::JobKind;
use grader_core::domain::submission::Submission;
use std::path::Path;

use crate::error::ExecutionError;
use crate::job::Gradebook;

/// Everything a backend needs to run one job
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub kind: JobKind,
    pub submission: &'a Submission,
    pub input: &'a Path,
    pub output: &'a Path,
}

/// Result of a successful backend run
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Result artifact of a grading run; feedback runs produce none
    pub gradebook: Option<Gradebook>,
    /// Concatenated output of the transformation
    pub logs: String,
}

impl ExecutionOutput {
    pub fn score(&self) -> Option<f64> {
        self.gradebook.as_ref().map(|g| g.score)
    }
}

/// Service trait for running a transformation
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Runs the transformation for `request`
    ///
    /// Must leave the output tree in `request.output`. For grading runs the
    /// tree has to contain the gradebook the score is read from.
    async fn run(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput, ExecutionError>;
}

/// Reads the gradebook a grading run left behind and pairs it with the logs
pub(crate) async fn collect_output(
    kind: JobKind,
    output: &Path,
    logs: String,
) -> Result<ExecutionOutput, ExecutionError> {
    let gradebook = match kind {
        JobKind::Autograde => Some(Gradebook::load(output).await?),
        JobKind::Feedback => None,
    };

    Ok(ExecutionOutput { gradebook, logs })
}

/// Command-line arguments of the converter for a job
pub(crate) fn converter_args(kind: JobKind, input: &Path, output: &Path) -> Vec<String> {
    let subcommand = match kind {
        JobKind::Autograde => "autograde",
        JobKind::Feedback => "generate_feedback",
    };

    vec![
        subcommand.to_string(),
        "-i".to_string(),
        path_arg(input),
        "-o".to_string(),
        path_arg(output),
        "-p".to_string(),
        "*.ipynb".to_string(),
        "--log-level=INFO".to_string(),
    ]
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converter_args() {
        let args = converter_args(
            JobKind::Feedback,
            Path::new("/in/feedback_1"),
            Path::new("/out/feedback_1"),
        );
        assert_eq!(args[0], "generate_feedback");
        assert_eq!(args[2], "/in/feedback_1");
        assert_eq!(args[4], "/out/feedback_1");
    }

    #[tokio::test]
    async fn test_feedback_output_has_no_gradebook() {
        let dir = tempfile::tempdir().unwrap();
        let output = collect_output(JobKind::Feedback, dir.path(), "ok".into())
            .await
            .unwrap();
        assert!(output.score().is_none());
        assert_eq!(output.logs, "ok");
    }
}
