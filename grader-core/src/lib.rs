//! Grader Core
//!
//! Core types shared by the grading orchestration components.
//!
//! This crate contains:
//! - Domain types: submissions, assignments and their status fields
//! - Job vocabulary: job kinds and the repository kinds they read from and publish to

pub mod domain;
