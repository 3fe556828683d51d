//! Repository layer
//!
//! Stateless access to the two external stores a job touches: the git
//! repositories holding submitted and published trees, and the submission
//! records. Both are trait-based so the pipeline can be tested with stubs.

mod gateway;
mod submissions;

// Re-export traits
pub use gateway::RepositoryGateway;
pub use submissions::SubmissionStore;

// Re-export implementations
pub use gateway::{GitGateway, RepoLocator};
pub use submissions::{JsonFileStore, MemoryStore};
