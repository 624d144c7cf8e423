//! Real-time job event streaming for in-process subscribers.

pub mod job_progress;
pub mod live;

pub use job_progress::{JobProgressEvent, ProgressBroadcaster};
pub use live::LiveProgress;
