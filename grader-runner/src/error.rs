//! Error types for the grading runner
//!
//! One enum per concern. Pipeline stages wrap these in [`JobError`], which is
//! what gets logged and turned into a failed status on the submission.

use grader_core::domain::submission::SubmissionId;
use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobStage;

/// Errors raised by an execution backend
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The transformation process could not be started
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The transformation process exited unsuccessfully
    #[error("Process exited with code {code:?}")]
    NonZeroExit { code: Option<i32>, logs: String },

    /// The in-process transformation returned an error
    #[error("Transformation failed: {message}")]
    Transformation { message: String, logs: String },

    /// The pod reached the Failed phase
    #[error("Pod {pod} failed")]
    PodFailed { pod: String, logs: String },

    /// The container orchestration API rejected a request
    #[error("Container execution failed: {0}")]
    Pod(#[from] PodError),

    /// The transformation did not leave a readable result artifact
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl ExecutionError {
    /// Logs captured before the failure, if the backend had any
    pub fn logs(&self) -> Option<&str> {
        match self {
            ExecutionError::NonZeroExit { logs, .. }
            | ExecutionError::Transformation { logs, .. }
            | ExecutionError::PodFailed { logs, .. } => Some(logs.as_str()),
            _ => None,
        }
    }
}

/// Errors talking to the container orchestration API
#[derive(Debug, Error)]
pub enum PodError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("Failed to load Kubernetes configuration: {0}")]
    Config(String),

    #[error("Pod {0} has no name")]
    Unnamed(String),

    #[error("Pod {0} not found")]
    NotFound(String),

    #[error("Pod monitor for {0} stopped before a terminal phase was observed")]
    MonitorStopped(String),
}

/// Errors reading the result artifact (the gradebook)
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Artifact {0} has no numeric 'score'")]
    MissingScore(PathBuf),
}

/// Errors from the repository gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed with code {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Repository not found: {0}")]
    NotFound(PathBuf),
}

/// Errors from the submission store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Submission {0} not found")]
    NotFound(SubmissionId),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of one pipeline stage
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Cannot resolve source repository: {0}")]
    Resolve(String),

    #[error("Submission {0} has no gradebook to hand to the transformation")]
    MissingRubric(SubmissionId),

    #[error("Pull failed: {0}")]
    Pull(#[source] GatewayError),

    #[error("Cannot prepare {stage} workspace: {source}")]
    Workspace {
        stage: JobStage,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Publish failed: {0}")]
    Publish(#[source] GatewayError),

    #[error("Cannot save submission while {stage}: {source}")]
    Persist {
        stage: JobStage,
        #[source]
        source: StoreError,
    },

    /// The job's future was dropped by a timeout or cancellation
    #[error("Interrupted while {0} (timed out or cancelled)")]
    Interrupted(JobStage),
}

/// Rejections at the executor's admission point
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Task queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("Submission {0} already has a job queued or running")]
    AlreadyInFlight(SubmissionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_logs() {
        let err = ExecutionError::NonZeroExit {
            code: Some(2),
            logs: "boom".to_string(),
        };
        assert_eq!(err.logs(), Some("boom"));

        let err = ExecutionError::Artifact(ArtifactError::MissingScore(PathBuf::from("/x")));
        assert!(err.logs().is_none());
    }

    #[test]
    fn test_persist_error_names_stage() {
        let err = JobError::Persist {
            stage: JobStage::Pulling,
            source: StoreError::NotFound(3),
        };
        assert_eq!(
            err.to_string(),
            "Cannot save submission while pulling: Submission 3 not found"
        );
    }
}
