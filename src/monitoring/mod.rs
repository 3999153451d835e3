//! Monitoring Module
//!
//! Watching executions from the outside.
//!
//! # Components
//!
//! - [`ExecutionObserver`]: Status and progress events
//! - [`ExecutionTimeline`]: Node start/end timing for Gantt charts

pub mod observer;
pub mod timeline;

pub use observer::{ExecutionObserver, ObserverHub};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
