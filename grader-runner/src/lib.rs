//! Grading runner
//!
//! Job orchestration for automatic grading and feedback generation:
//! - [`executor`]: bounded worker pool, the only place jobs run
//! - [`job`]: the pull, run, publish and persist pipeline of one submission
//! - [`backend`]: in-process, local subprocess and Kubernetes pod execution
//! - [`repository`]: git gateway and submission stores
//! - [`service`]: the entry point turning requests into queued jobs

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod job;
pub mod repository;
pub mod retry;
pub mod service;
