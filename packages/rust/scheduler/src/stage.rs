//! The pipeline stage contract.
//!
//! A stage is the domain transform wrapped by a [`WorkDistributor`]: query
//! generation, scraping, filtering, crawling. Per task, a stage moves through
//! Queued → Admitted → Executing → Forwarded or Discarded; there is no paused
//! state, and a stage must never hold a task past Executing.
//!
//! [`WorkDistributor`]: crate::WorkDistributor

use std::future::Future;

use flywheel_shared::Result;

pub use flywheel_shared::StageFanout;

/// Identifier of one worker slot within a distributor. Slot ids are dense,
/// zero-based, and stable for the distributor's lifetime.
pub type SlotId = usize;

/// A polymorphic unit of domain logic run under a [`WorkDistributor`].
///
/// `process` must catch collaborator failures and convert them into
/// failure-result outputs per the stage's own policy; a returned `Err` (or a
/// panic) discards the task but never leaks the slot's credit.
///
/// [`WorkDistributor`]: crate::WorkDistributor
pub trait Stage: Send + Sync + 'static {
    /// Task type admitted from the head queue.
    type Input: Send + 'static;
    /// Task type forwarded to the tail queue.
    type Output: Send + 'static;

    /// Scheduling bounds: slots are created lazily up to `max_slots`, and
    /// each slot mints `max_tasks_per_slot` credit tokens.
    fn fanout(&self) -> StageFanout;

    /// Per-slot setup hook, run exactly once before the slot's first task.
    /// Binds slot-local external resources (e.g. an outbound proxy identity).
    fn setup_slot(&self, slot: SlotId) -> impl Future<Output = ()> + Send {
        let _ = slot;
        async {}
    }

    /// Execute the domain transform for one admitted task, producing zero or
    /// more output tasks. Runs concurrently with other executions on the same
    /// slot; blocking here must be collaborator I/O only.
    fn process(
        &self,
        slot: SlotId,
        task: Self::Input,
    ) -> impl Future<Output = Result<Vec<Self::Output>>> + Send;
}
