//! Job vocabulary shared between the service entry point and the runner

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a job produces for a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Grade the submitted files and record a score
    Autograde,
    /// Render feedback from an already graded submission
    Feedback,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Autograde => "autograde",
            JobKind::Feedback => "feedback",
        }
    }

    /// Prefix of the per-submission scratch directories
    pub fn scratch_prefix(&self) -> &'static str {
        match self {
            JobKind::Autograde => "submission",
            JobKind::Feedback => "feedback",
        }
    }

    /// Repository the job's results are published into
    pub fn target_repo(&self) -> RepoKind {
        match self {
            JobKind::Autograde => RepoKind::Autograde,
            JobKind::Feedback => RepoKind::Feedback,
        }
    }

    /// Branch name the results of `commit_hash` are published under
    pub fn result_branch(&self, commit_hash: &str) -> String {
        match self {
            JobKind::Autograde => format!("grade_{}", commit_hash),
            JobKind::Feedback => format!("feedback_{}", commit_hash),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of repository in the `{lecture}/{assignment}/{kind}/{owner}` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoKind {
    User,
    Group,
    Autograde,
    Feedback,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::User => "user",
            RepoKind::Group => "group",
            RepoKind::Autograde => "autograde",
            RepoKind::Feedback => "feedback",
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_branches() {
        assert_eq!(JobKind::Autograde.result_branch("abc123"), "grade_abc123");
        assert_eq!(JobKind::Feedback.result_branch("abc123"), "feedback_abc123");
    }

    #[test]
    fn test_targets_differ_per_kind() {
        assert_eq!(JobKind::Autograde.target_repo(), RepoKind::Autograde);
        assert_eq!(JobKind::Feedback.target_repo(), RepoKind::Feedback);
        assert_ne!(
            JobKind::Autograde.scratch_prefix(),
            JobKind::Feedback.scratch_prefix()
        );
    }
}
