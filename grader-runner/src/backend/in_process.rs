//! In-process backend
//!
//! Calls the transformation directly. Its `tracing` output is captured by a
//! subscriber that is attached only while the transformation future is
//! polled, so concurrent in-process jobs never see each other's lines.

use async_trait::async_trait;
use grader_core::domain::job::JobKind;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument::WithSubscriber;

use crate::backend::{ExecutionBackend, ExecutionOutput, ExecutionRequest, collect_output};
use crate::error::ExecutionError;
use crate::service::LogBuffer;

/// The grading or feedback transformation as a library call
#[async_trait]
pub trait Transformation: Send + Sync {
    /// Transforms the tree at `input` into `output`
    ///
    /// Grading runs must write the scored gradebook into `output`.
    async fn transform(&self, kind: JobKind, input: &Path, output: &Path) -> anyhow::Result<()>;
}

/// Backend running a [`Transformation`] on the worker itself
pub struct InProcessBackend {
    transformation: Arc<dyn Transformation>,
}

impl InProcessBackend {
    pub fn new(transformation: Arc<dyn Transformation>) -> Self {
        Self { transformation }
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn run(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput, ExecutionError> {
        debug!(
            "Running {} transformation in process for submission {}",
            request.kind, request.submission.id
        );

        let buffer = LogBuffer::new();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .with_target(false)
            .finish();

        let result = self
            .transformation
            .transform(request.kind, request.input, request.output)
            .with_subscriber(subscriber)
            .await;

        let logs = buffer.drain();

        match result {
            Ok(()) => collect_output(request.kind, request.output, logs).await,
            Err(e) => Err(ExecutionError::Transformation {
                message: format!("{:#}", e),
                logs,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::artifact::write_gradebook;
    use grader_core::domain::submission::{
        AssignmentRef, AssignmentType, AutoStatus, FeedbackStatus, Submission,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Scorer {
        tag: &'static str,
        score: f64,
    }

    #[async_trait]
    impl Transformation for Scorer {
        async fn transform(
            &self,
            _kind: JobKind,
            _input: &Path,
            output: &Path,
        ) -> anyhow::Result<()> {
            for i in 0..5 {
                tracing::info!("{} step {}", self.tag, i);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            write_gradebook(output, &json!({ "score": self.score })).await?;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Transformation for Broken {
        async fn transform(&self, _: JobKind, _: &Path, _: &Path) -> anyhow::Result<()> {
            tracing::warn!("about to fail");
            anyhow::bail!("cell 3 raised")
        }
    }

    fn submission() -> Submission {
        Submission {
            id: 1,
            commit_hash: "abc".into(),
            username: "alice".into(),
            group_name: None,
            assignment: AssignmentRef {
                id: 1,
                lecture_code: "ds".into(),
                assignment_type: AssignmentType::User,
                properties: None,
            },
            auto_status: AutoStatus::NotGraded,
            feedback_status: FeedbackStatus::NotGenerated,
            score: None,
            logs: None,
            properties: None,
            updated_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_runs_capture_only_their_own_logs() {
        let sub = submission();
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = InProcessBackend::new(Arc::new(Scorer { tag: "alpha", score: 1.0 }));
        let b = InProcessBackend::new(Arc::new(Scorer { tag: "beta", score: 2.0 }));

        let req_a = ExecutionRequest {
            kind: JobKind::Autograde,
            submission: &sub,
            input: dir_a.path(),
            output: dir_a.path(),
        };
        let req_b = ExecutionRequest {
            output: dir_b.path(),
            input: dir_b.path(),
            ..req_a
        };

        let (out_a, out_b) = tokio::join!(a.run(req_a), b.run(req_b));
        let (out_a, out_b) = (out_a.unwrap(), out_b.unwrap());

        assert_eq!(out_a.score(), Some(1.0));
        assert_eq!(out_b.score(), Some(2.0));
        assert_eq!(out_a.logs.matches("alpha step").count(), 5);
        assert!(!out_a.logs.contains("beta"));
        assert_eq!(out_b.logs.matches("beta step").count(), 5);
        assert!(!out_b.logs.contains("alpha"));
    }

    #[tokio::test]
    async fn test_failure_keeps_captured_logs() {
        let sub = submission();
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcessBackend::new(Arc::new(Broken));

        let err = backend
            .run(ExecutionRequest {
                kind: JobKind::Autograde,
                submission: &sub,
                input: dir.path(),
                output: dir.path(),
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cell 3 raised"));
        assert!(err.logs().unwrap().contains("about to fail"));
    }
}
