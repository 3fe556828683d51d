//! Per-submission job pipeline
//!
//! Drives one submission through pull, run, publish and persist. Every
//! failure ends in a failed status on the submission; the scratch trees are
//! removed whatever happens, including when the job's future is dropped by a
//! timeout or cancellation.

use grader_core::domain::job::{JobKind, RepoKind};
use grader_core::domain::submission::{AssignmentType, AutoStatus, FeedbackStatus, Submission};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionOutput, ExecutionRequest};
use crate::context::JobContext;
use crate::error::JobError;
use crate::job::artifact::{remove_gradebook, write_gradebook};
use crate::job::{JobPaths, JobStage};
use crate::repository::RepoLocator;

/// One grading or feedback run for one submission
pub struct JobState {
    kind: JobKind,
    submission: Submission,
    ctx: Arc<JobContext>,
    paths: JobPaths,
    stage: JobStage,
    owns_store: bool,
    settled: bool,
}

impl JobState {
    pub fn new(kind: JobKind, submission: Submission, ctx: Arc<JobContext>) -> Self {
        let paths = JobPaths::new(&ctx.input_base, &ctx.output_base, kind, submission.id);
        Self {
            kind,
            submission,
            ctx,
            paths,
            stage: JobStage::Pending,
            owns_store: false,
            settled: false,
        }
    }

    /// Closes the store once the job is cleaned up
    pub fn owning_store(mut self) -> Self {
        self.owns_store = true;
        self
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    /// Runs the pipeline to completion and returns the final stage
    ///
    /// Errors never escape: they are logged and recorded on the submission.
    pub async fn start(&mut self) -> JobStage {
        if let Err(e) = self.run_stages().await {
            self.fail(e).await;
        }
        self.cleanup().await;
        self.settled = true;
        self.stage
    }

    async fn run_stages(&mut self) -> Result<(), JobError> {
        self.enter(JobStage::Pulling);
        // Leftovers of an attempt that was cancelled or timed out
        self.paths
            .remove()
            .await
            .map_err(|source| JobError::Workspace {
                stage: JobStage::Pulling,
                source,
            })?;
        self.pull().await?;
        self.mark_in_progress();
        self.commit(&self.submission).await?;

        self.enter(JobStage::Running);
        let started = Instant::now();
        let output = self.run_backend().await?;
        info!(
            "{} of submission {} took {:.2?}",
            self.kind,
            self.submission.id,
            started.elapsed()
        );

        self.enter(JobStage::Publishing);
        self.publish().await?;

        self.enter(JobStage::Persisting);
        // Kept aside until saved so a failed commit leaves no score behind
        let mut finished = self.submission.clone();
        record_output(self.kind, &mut finished, output);
        self.commit(&finished).await?;
        self.submission = finished;

        self.enter(JobStage::Done);
        Ok(())
    }

    async fn commit(&self, submission: &Submission) -> Result<(), JobError> {
        self.ctx
            .store
            .commit(submission)
            .await
            .map_err(|source| JobError::Persist {
                stage: self.stage,
                source,
            })
    }

    fn enter(&mut self, stage: JobStage) {
        debug!(
            "Submission {} {}: {} -> {}",
            self.submission.id, self.kind, self.stage, stage
        );
        self.stage = stage;
    }

    fn owner(&self) -> Result<String, JobError> {
        self.submission.owner().map(str::to_string).ok_or_else(|| {
            JobError::Resolve(format!(
                "group submission {} has no group",
                self.submission.id
            ))
        })
    }

    fn locator(&self, kind: RepoKind, owner: String) -> RepoLocator {
        RepoLocator {
            lecture_code: self.submission.assignment.lecture_code.clone(),
            assignment_id: self.submission.assignment.id,
            kind,
            owner,
        }
    }

    async fn pull(&self) -> Result<(), JobError> {
        let owner = self.owner()?;
        let commit = &self.submission.commit_hash;

        // Grading reads the student's commit, feedback reads the graded tree
        let (source, git_ref) = match self.kind {
            JobKind::Autograde => {
                let repo = match self.submission.assignment.assignment_type {
                    AssignmentType::User => RepoKind::User,
                    AssignmentType::Group => RepoKind::Group,
                };
                (self.locator(repo, owner), commit.clone())
            }
            JobKind::Feedback => (
                self.locator(RepoKind::Autograde, owner),
                JobKind::Autograde.result_branch(commit),
            ),
        };

        let rubric = match self.kind {
            JobKind::Autograde => self.submission.assignment.properties.as_ref(),
            JobKind::Feedback => self.submission.properties.as_ref(),
        }
        .ok_or(JobError::MissingRubric(self.submission.id))?;

        let gateway = &*self.ctx.gateway;
        let (source, git_ref, input) = (&source, git_ref.as_str(), self.paths.input.as_path());
        self.ctx
            .retry
            .run("fetch", move || gateway.fetch_at_ref(source, git_ref, input))
            .await
            .map_err(JobError::Pull)?;

        write_gradebook(input, rubric)
            .await
            .map_err(|source| JobError::Workspace {
                stage: JobStage::Pulling,
                source,
            })
    }

    fn mark_in_progress(&mut self) {
        match self.kind {
            JobKind::Autograde => self.submission.auto_status = AutoStatus::Pending,
            JobKind::Feedback => self.submission.feedback_status = FeedbackStatus::Generating,
        }
    }

    async fn run_backend(&self) -> Result<ExecutionOutput, JobError> {
        tokio::fs::create_dir_all(&self.paths.output)
            .await
            .map_err(|source| JobError::Workspace {
                stage: JobStage::Running,
                source,
            })?;

        debug!(
            "Running {} backend for submission {}",
            self.ctx.backend.name(),
            self.submission.id
        );
        let output = self
            .ctx
            .backend
            .run(ExecutionRequest {
                kind: self.kind,
                submission: &self.submission,
                input: &self.paths.input,
                output: &self.paths.output,
            })
            .await?;
        Ok(output)
    }

    async fn publish(&self) -> Result<(), JobError> {
        let output = self.paths.output.as_path();
        remove_gradebook(output)
            .await
            .map_err(|source| JobError::Workspace {
                stage: JobStage::Publishing,
                source,
            })?;

        let target = self.locator(self.kind.target_repo(), self.owner()?);
        let branch = self.kind.result_branch(&self.submission.commit_hash);
        let gateway = &*self.ctx.gateway;
        let (target_ref, branch_ref) = (&target, branch.as_str());
        self.ctx
            .retry
            .run("publish", move || {
                gateway.publish_branch(target_ref, branch_ref, output)
            })
            .await
            .map_err(JobError::Publish)
    }

    fn mark_failed(&mut self, error: &JobError) {
        match self.kind {
            JobKind::Autograde => {
                self.submission.auto_status = AutoStatus::GradingFailed;
                self.submission.logs = Some(failure_logs(error));
            }
            JobKind::Feedback => {
                self.submission.feedback_status = FeedbackStatus::GenerationFailed;
            }
        }
    }

    async fn fail(&mut self, error: JobError) {
        error!(
            "{} of submission {} failed while {}: {}",
            self.kind, self.submission.id, self.stage, error
        );

        self.mark_failed(&error);
        if let Err(e) = self.ctx.store.commit(&self.submission).await {
            error!(
                "Failed to record failure of submission {}: {}",
                self.submission.id, e
            );
        }
        // Only set once the failure is committed, see `Drop`
        self.stage = JobStage::Failed;
    }

    async fn cleanup(&self) {
        if let Err(e) = self.paths.remove().await {
            warn!(
                "Failed to remove scratch directories of submission {}: {}",
                self.submission.id, e
            );
        }

        if self.owns_store {
            if let Err(e) = self.ctx.store.close().await {
                warn!("Failed to close submission store: {}", e);
            }
        }
    }
}

/// Settles a job whose future was dropped before `start` returned
///
/// A job timeout or an executor cancellation drops the pipeline wherever it
/// is suspended. The scratch trees are removed right here; the failure
/// commit cannot be awaited in `drop` and is handed to the runtime.
impl Drop for JobState {
    fn drop(&mut self) {
        if self.settled || self.stage == JobStage::Pending {
            return;
        }
        warn!(
            "{} of submission {} interrupted while {}",
            self.kind, self.submission.id, self.stage
        );

        if let Err(e) = self.paths.remove_blocking() {
            warn!(
                "Failed to remove scratch directories of submission {}: {}",
                self.submission.id, e
            );
        }

        // A final stage means only cleanup was cut short
        let record_failure = !self.stage.is_final();
        if !record_failure && !self.owns_store {
            return;
        }
        if record_failure {
            self.mark_failed(&JobError::Interrupted(self.stage));
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to record interruption of submission {}",
                self.submission.id
            );
            return;
        };
        let ctx = self.ctx.clone();
        let submission = self.submission.clone();
        let owns_store = self.owns_store;
        runtime.spawn(async move {
            if record_failure {
                if let Err(e) = ctx.store.commit(&submission).await {
                    error!(
                        "Failed to record interruption of submission {}: {}",
                        submission.id, e
                    );
                }
            }
            if owns_store {
                if let Err(e) = ctx.store.close().await {
                    warn!("Failed to close submission store: {}", e);
                }
            }
        });
    }
}

fn record_output(kind: JobKind, submission: &mut Submission, output: ExecutionOutput) {
    match kind {
        JobKind::Autograde => {
            if let Some(gradebook) = output.gradebook {
                submission.score = Some(gradebook.score);
                submission.properties = Some(gradebook.raw);
            }
            submission.logs = Some(output.logs);
            submission.auto_status = AutoStatus::AutomaticallyGraded;
        }
        JobKind::Feedback => {
            submission.feedback_status = FeedbackStatus::Generated;
        }
    }
}

/// Error message followed by whatever the transformation printed before failing
fn failure_logs(error: &JobError) -> String {
    let captured = match error {
        JobError::Execution(e) => e.logs().filter(|logs| !logs.is_empty()),
        _ => None,
    };

    match captured {
        Some(logs) => format!("{}\n\n{}", error, logs),
        None => error.to_string(),
    }
}
