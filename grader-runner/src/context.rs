//! Shared context for pipeline jobs
//!
//! Contains everything a job needs besides the submission itself:
//! - Submission store for status commits
//! - Repository gateway for pulling and publishing trees
//! - Execution backend running the transformation
//! - Scratch directory bases and the retry policy

use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::ExecutionBackend;
use crate::repository::{RepositoryGateway, SubmissionStore};
use crate::retry::RetryPolicy;

/// Collaborators shared by every job of a service
pub struct JobContext {
    pub store: Arc<dyn SubmissionStore>,
    pub gateway: Arc<dyn RepositoryGateway>,
    pub backend: Arc<dyn ExecutionBackend>,
    /// Base directory of the per-job input trees
    pub input_base: PathBuf,
    /// Base directory of the per-job output trees
    pub output_base: PathBuf,
    /// Applied to git fetches and pushes
    pub retry: RetryPolicy,
}

impl JobContext {
    /// Creates a new job context
    ///
    /// # Arguments
    /// * `store` - Where submissions are loaded from and committed to
    /// * `gateway` - Git access for pulling and publishing
    /// * `backend` - Runs the transformation
    /// * `input_base` - Base for input scratch directories
    /// * `output_base` - Base for output scratch directories
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        gateway: Arc<dyn RepositoryGateway>,
        backend: Arc<dyn ExecutionBackend>,
        input_base: PathBuf,
        output_base: PathBuf,
    ) -> Self {
        Self {
            store,
            gateway,
            backend,
            input_base,
            output_base,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
