//! Submission domain types

use serde::{Deserialize, Serialize};
use std::fmt;

pub type SubmissionId = i64;

/// A student's attempt at an assignment
///
/// Structure shared between the persistence layer (owns it) and the runner
/// (updates the grading fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    /// Commit in the student's repository that was submitted
    pub commit_hash: String,
    pub username: String,
    /// Owning group for group assignments
    #[serde(default)]
    pub group_name: Option<String>,
    pub assignment: AssignmentRef,
    #[serde(default)]
    pub auto_status: AutoStatus,
    #[serde(default)]
    pub feedback_status: FeedbackStatus,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub logs: Option<String>,
    /// Gradebook produced by the last successful grading run
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Submission {
    /// Name of the repository owner: the group for group assignments, the user otherwise
    pub fn owner(&self) -> Option<&str> {
        match self.assignment.assignment_type {
            AssignmentType::User => Some(self.username.as_str()),
            AssignmentType::Group => self.group_name.as_deref().filter(|g| !g.is_empty()),
        }
    }

    /// Marks the submission as modified now
    pub fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now());
    }
}

/// The assignment a submission belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRef {
    pub id: i64,
    pub lecture_code: String,
    #[serde(default)]
    pub assignment_type: AssignmentType,
    /// Gradebook template handed to the grading transformation
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    #[default]
    User,
    Group,
}

/// Automatic grading status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStatus {
    #[default]
    NotGraded,
    Pending,
    AutomaticallyGraded,
    GradingFailed,
}

impl AutoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoStatus::NotGraded => "not_graded",
            AutoStatus::Pending => "pending",
            AutoStatus::AutomaticallyGraded => "automatically_graded",
            AutoStatus::GradingFailed => "grading_failed",
        }
    }
}

impl fmt::Display for AutoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feedback generation status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    #[default]
    NotGenerated,
    Generating,
    Generated,
    GenerationFailed,
    FeedbackOutdated,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::NotGenerated => "not_generated",
            FeedbackStatus::Generating => "generating",
            FeedbackStatus::Generated => "generated",
            FeedbackStatus::GenerationFailed => "generation_failed",
            FeedbackStatus::FeedbackOutdated => "feedback_outdated",
        }
    }
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(assignment_type: AssignmentType, group: Option<&str>) -> Submission {
        Submission {
            id: 1,
            commit_hash: "abc".to_string(),
            username: "alice".to_string(),
            group_name: group.map(str::to_string),
            assignment: AssignmentRef {
                id: 3,
                lecture_code: "ds101".to_string(),
                assignment_type,
                properties: None,
            },
            auto_status: AutoStatus::default(),
            feedback_status: FeedbackStatus::default(),
            score: None,
            logs: None,
            properties: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_owner_follows_assignment_type() {
        assert_eq!(submission(AssignmentType::User, Some("g1")).owner(), Some("alice"));
        assert_eq!(submission(AssignmentType::Group, Some("g1")).owner(), Some("g1"));
        assert_eq!(submission(AssignmentType::Group, None).owner(), None);
        assert_eq!(submission(AssignmentType::Group, Some("")).owner(), None);
    }

    #[test]
    fn test_status_serialization_is_snake_case() {
        let json = serde_json::to_string(&AutoStatus::AutomaticallyGraded).unwrap();
        assert_eq!(json, "\"automatically_graded\"");

        let status: FeedbackStatus = serde_json::from_str("\"generation_failed\"").unwrap();
        assert_eq!(status, FeedbackStatus::GenerationFailed);
    }

    #[test]
    fn test_minimal_submission_deserializes_with_defaults() {
        let json = r#"{
            "id": 7,
            "commit_hash": "deadbeef",
            "username": "bob",
            "assignment": { "id": 2, "lecture_code": "ml" }
        }"#;

        let sub: Submission = serde_json::from_str(json).unwrap();
        assert_eq!(sub.auto_status, AutoStatus::NotGraded);
        assert_eq!(sub.feedback_status, FeedbackStatus::NotGenerated);
        assert_eq!(sub.assignment.assignment_type, AssignmentType::User);
        assert!(sub.score.is_none());
    }
}
