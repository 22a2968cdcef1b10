//! Generic bounded-concurrency scheduling for the flywheel pipeline.
//!
//! Every pipeline stage reuses the same two pieces:
//! - [`Stage`] — the domain transform contract (`process(task) -> tasks`)
//! - [`WorkDistributor`] — FCFS admission, lazy slot creation, and a
//!   credit-token system bounding execution to `max_slots * max_tasks_per_slot`
//!
//! Queues between stages are unbounded `tokio::sync::mpsc` channels; closing
//! a stage's head queue drains and shuts down everything downstream.

pub mod distributor;
pub mod stage;

pub use distributor::WorkDistributor;
pub use stage::{SlotId, Stage, StageFanout};
