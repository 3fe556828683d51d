//! Service layer
//!
//! - [`GradingService`]: turns grading and feedback requests into queue entries
//! - [`LogBuffer`]: in-memory sink for captured transformation logs

mod grading;
mod log_buffer;

pub use grading::GradingService;
pub use log_buffer::LogBuffer;
