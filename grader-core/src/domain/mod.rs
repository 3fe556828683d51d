//! Core domain types
//!
//! These types represent the entities the runner mutates while grading.
//! They are owned by whatever persistence layer hosts them; the runner only
//! reads them, updates status fields and commits them back.

pub mod job;
pub mod submission;
