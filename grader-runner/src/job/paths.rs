use grader_core::domain::job::JobKind;
use grader_core::domain::submission::SubmissionId;
use std::path::{Path, PathBuf};

/// Scratch directories of one job
///
/// Namespaced by job kind and submission id, so a grading and a feedback job
/// for the same submission never share a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl JobPaths {
    pub fn new(input_base: &Path, output_base: &Path, kind: JobKind, id: SubmissionId) -> Self {
        let name = format!("{}_{}", kind.scratch_prefix(), id);
        Self {
            input: input_base.join(&name),
            output: output_base.join(name),
        }
    }

    /// Removes both directories; missing ones are ignored
    pub async fn remove(&self) -> std::io::Result<()> {
        for dir in [&self.input, &self.output] {
            match tokio::fs::remove_dir_all(dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Same as [`JobPaths::remove`] for callers that cannot await
    pub fn remove_blocking(&self) -> std::io::Result<()> {
        for dir in [&self.input, &self.output] {
            match std::fs::remove_dir_all(dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}
