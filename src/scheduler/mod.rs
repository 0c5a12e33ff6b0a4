//! Scheduler engine for job execution.
//!
//! This module provides the main scheduling loop that fires jobs when
//! their triggers come due, and the handle used to control it.

mod api;
mod engine;
mod handle;
mod types;

pub use api::SchedulerApi;
pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use types::{QueueResult, SchedulerError, SchedulerState};
