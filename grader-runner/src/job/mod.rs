//! Job pipeline: stages, scratch paths and the result artifact

pub mod artifact;
mod paths;
mod stage;
mod state;

pub use artifact::Gradebook;
pub use paths::JobPaths;
pub use stage::JobStage;
pub use state::JobState;
