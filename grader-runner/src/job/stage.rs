use std::fmt;

/// Pipeline stage of a job
///
/// Stages advance linearly; `Failed` can be entered from any of them and
/// both `Done` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Pending,
    Pulling,
    Running,
    Publishing,
    Persisting,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Pulling => "pulling",
            JobStage::Running => "running",
            JobStage::Publishing => "publishing",
            JobStage::Persisting => "persisting",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
