//! Submission persistence
//!
//! Jobs load a submission once and then only flush field values through
//! `commit`. Who owns the underlying session or file is up to the caller.

use anyhow::Context;
use async_trait::async_trait;
use grader_core::domain::submission::{Submission, SubmissionId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::StoreError;

/// Repository trait for submission records
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn load(&self, id: SubmissionId) -> Result<Submission, StoreError>;

    /// Flushes the current field values of `submission`
    async fn commit(&self, submission: &Submission) -> Result<(), StoreError>;

    /// Releases the underlying session; called by jobs that own the store
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory store recording every commit
#[derive(Debug, Default)]
pub struct MemoryStore {
    submissions: Mutex<BTreeMap<SubmissionId, Submission>>,
    commits: Mutex<Vec<Submission>>,
    closed: Mutex<bool>,
}

impl MemoryStore {
    pub fn new(submissions: impl IntoIterator<Item = Submission>) -> Self {
        Self {
            submissions: Mutex::new(submissions.into_iter().map(|s| (s.id, s)).collect()),
            ..Default::default()
        }
    }

    /// Current value of a submission
    pub fn get(&self, id: SubmissionId) -> Option<Submission> {
        lock(&self.submissions).get(&id).cloned()
    }

    /// Every committed snapshot, in commit order
    pub fn commits(&self) -> Vec<Submission> {
        lock(&self.commits).clone()
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn load(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.get(id).ok_or(StoreError::NotFound(id))
    }

    async fn commit(&self, submission: &Submission) -> Result<(), StoreError> {
        lock(&self.submissions).insert(submission.id, submission.clone());
        lock(&self.commits).push(submission.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        *lock(&self.closed) = true;
        Ok(())
    }
}

/// Store backed by a JSON array of submissions on disk
///
/// Every commit rewrites the whole document through a temporary file, so a
/// crash never leaves a truncated store behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles between concurrent jobs
    write_lock: AsyncMutex<()>,
}

impl JsonFileStore {
    /// Opens an existing store file, failing early if it is not a valid store
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let contents = std::fs::read(&path)
            .with_context(|| format!("Failed to read submission store {}", path.display()))?;
        let submissions: Vec<Submission> = serde_json::from_slice(&contents)
            .with_context(|| format!("Invalid submission store {}", path.display()))?;
        debug!(
            "Opened submission store {} ({} submissions)",
            path.display(),
            submissions.len()
        );

        Ok(Self {
            path,
            write_lock: AsyncMutex::new(()),
        })
    }

    async fn read_all(&self) -> Result<Vec<Submission>, StoreError> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_all(&self, submissions: &[Submission]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(submissions)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for JsonFileStore {
    async fn load(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.read_all()
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    async fn commit(&self, submission: &Submission) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut submissions = self.read_all().await?;

        let mut submission = submission.clone();
        submission.touch();
        match submissions.iter_mut().find(|s| s.id == submission.id) {
            Some(existing) => *existing = submission,
            None => submissions.push(submission),
        }

        self.write_all(&submissions).await?;
        debug!("Committed submissions to {}", self.path.display());
        Ok(())
    }
}
