//! Grading service
//!
//! The only way jobs reach the executor. Each request becomes one queue
//! entry; a submission with an entry still queued or running cannot be
//! submitted again until that entry is gone.

use grader_core::domain::job::JobKind;
use grader_core::domain::submission::SubmissionId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::context::JobContext;
use crate::error::SubmitError;
use crate::executor::{QueueEntry, TaskExecutor};
use crate::job::JobState;

type InFlight = Arc<Mutex<HashSet<SubmissionId>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<SubmissionId>> {
    in_flight.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a submission busy for as long as its queue entry exists
struct InFlightGuard {
    in_flight: InFlight,
    id: SubmissionId,
}

impl InFlightGuard {
    fn acquire(in_flight: &InFlight, id: SubmissionId) -> Option<Self> {
        if !lock(in_flight).insert(id) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.id);
    }
}

pub struct GradingService {
    executor: Arc<TaskExecutor>,
    ctx: Arc<JobContext>,
    in_flight: InFlight,
}

impl GradingService {
    pub fn new(executor: Arc<TaskExecutor>, ctx: Arc<JobContext>) -> Self {
        Self {
            executor,
            ctx,
            in_flight: Arc::default(),
        }
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Queues automatic grading of a submission
    pub fn grade(&self, id: SubmissionId) -> Result<(), SubmitError> {
        self.submit(JobKind::Autograde, id)
    }

    /// Queues feedback generation for a graded submission
    pub fn generate_feedback(&self, id: SubmissionId) -> Result<(), SubmitError> {
        self.submit(JobKind::Feedback, id)
    }

    /// Whether a job for `id` is queued or running
    pub fn is_in_flight(&self, id: SubmissionId) -> bool {
        lock(&self.in_flight).contains(&id)
    }

    fn submit(&self, kind: JobKind, id: SubmissionId) -> Result<(), SubmitError> {
        let guard = InFlightGuard::acquire(&self.in_flight, id)
            .ok_or(SubmitError::AlreadyInFlight(id))?;

        let ctx = self.ctx.clone();
        let label = format!("{}-{}", kind, id);
        let entry = QueueEntry::new(label, move || {
            let _busy = &guard;
            let ctx = ctx.clone();
            async move {
                // Loaded per attempt so a resubmitted entry sees fresh state
                let submission = ctx.store.load(id).await?;
                let stage = JobState::new(kind, submission, ctx).start().await;
                debug!("{} of submission {} ended {}", kind, id, stage);
                Ok(())
            }
        })
        .on_finish(move || {
            info!("Finished {} of submission {}", kind, id);
            Ok(())
        });

        // A rejected entry is dropped here, releasing the guard
        self.executor.submit(entry)?;
        info!("Queued {} of submission {}", kind, id);
        Ok(())
    }
}
