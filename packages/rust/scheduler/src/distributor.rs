//! Generic bounded-concurrency work distributor.
//!
//! The distributor wraps one [`Stage`] and turns it into a pipeline segment:
//! it admits tasks from a head queue, bounds concurrent execution to
//! `max_slots * max_tasks_per_slot`, and forwards every produced output to a
//! tail queue.
//!
//! The bound is a distributed counting semaphore implemented as a queue of
//! slot identifiers. Each slot mints `max_tasks_per_slot` credit tokens into
//! a shared availability queue at creation; admitting a task consumes one
//! token and determines which slot receives the task; the token is returned
//! only after that task's outputs have been forwarded. Admission is strictly
//! FCFS and single-threaded — one task is in flight toward assignment at a
//! time even when several slots are idle. That is a deliberate throughput
//! ceiling, not an accident.
//!
//! Slots are long-lived worker tasks: created lazily, never destroyed, each
//! with its own inbox. A slot spawns a fresh execution unit per task without
//! waiting for earlier ones, so the per-slot bound is enforced purely by how
//! many credits were minted for it — there is no local semaphore.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::stage::{SlotId, Stage};

/// Wraps a [`Stage`] with FCFS admission and credit-bounded fan-out.
pub struct WorkDistributor<S: Stage> {
    stage: Arc<S>,
    head: UnboundedReceiver<S::Input>,
    tail: UnboundedSender<S::Output>,
}

impl<S: Stage> WorkDistributor<S> {
    /// Wire a stage between a head receiver and a tail sender.
    pub fn new(stage: S, head: UnboundedReceiver<S::Input>, tail: UnboundedSender<S::Output>) -> Self {
        Self {
            stage: Arc::new(stage),
            head,
            tail,
        }
    }

    /// Spawn the admission loop onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the admission loop until the head queue closes, then drain.
    ///
    /// Each iteration: dequeue one task, lazily create a slot if below the
    /// cap, dequeue one credit token, and push the task onto the token's
    /// slot inbox. Returning drops the inboxes, which lets every slot drain
    /// and exit; in-flight execution units keep the tail open until their
    /// outputs are forwarded, so shutdown cascades cleanly downstream.
    pub async fn run(mut self) {
        let fanout = self.stage.fanout();
        let (credit_tx, mut credit_rx) = mpsc::unbounded_channel::<SlotId>();
        let mut inboxes: Vec<UnboundedSender<S::Input>> = Vec::new();

        while let Some(task) = self.head.recv().await {
            if inboxes.len() < fanout.max_slots {
                let slot = inboxes.len();
                let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
                inboxes.push(inbox_tx);

                // Mint the slot's credits before it starts; the inbox exists
                // before the worker does, so no registration handshake is
                // needed. The receiver lives in this scope, sends cannot fail.
                for _ in 0..fanout.max_tasks_per_slot {
                    let _ = credit_tx.send(slot);
                }

                debug!(slot, max_slots = fanout.max_slots, "slot created");
                tokio::spawn(run_slot(
                    Arc::clone(&self.stage),
                    slot,
                    inbox_rx,
                    self.tail.clone(),
                    credit_tx.clone(),
                ));
            }

            // Blocking dequeue of one credit: global capacity and target slot
            // in a single operation.
            let Some(slot) = credit_rx.recv().await else {
                break;
            };

            if inboxes[slot].send(task).is_err() {
                // Only reachable during teardown; the task is discarded.
                error!(slot, "slot inbox closed, task dropped");
            }
        }

        debug!(slots = inboxes.len(), "head queue closed, distributor draining");
    }
}

/// Slot worker loop: run the stage's setup hook exactly once, then hand each
/// inbox task to a fresh execution unit without waiting for earlier ones.
async fn run_slot<S: Stage>(
    stage: Arc<S>,
    slot: SlotId,
    mut inbox: UnboundedReceiver<S::Input>,
    tail: UnboundedSender<S::Output>,
    credits: UnboundedSender<SlotId>,
) {
    stage.setup_slot(slot).await;
    debug!(slot, "slot ready");

    while let Some(task) = inbox.recv().await {
        tokio::spawn(run_task(
            Arc::clone(&stage),
            slot,
            task,
            tail.clone(),
            credits.clone(),
        ));
    }

    debug!(slot, "slot inbox closed");
}

/// Execution unit: process one task, forward its outputs, then return the
/// slot's credit — exactly once, after forwarding, regardless of outcome.
async fn run_task<S: Stage>(
    stage: Arc<S>,
    slot: SlotId,
    task: S::Input,
    tail: UnboundedSender<S::Output>,
    credits: UnboundedSender<SlotId>,
) {
    // The nested spawn converts a stage panic into a JoinError so the credit
    // below is returned on every path.
    let executing = tokio::spawn(async move { stage.process(slot, task).await });

    let outputs = match executing.await {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(e)) => {
            warn!(slot, error = %e, "stage error escaped process, task discarded");
            Vec::new()
        }
        Err(e) => {
            error!(slot, error = %e, "stage panicked, task discarded");
            Vec::new()
        }
    };

    for output in outputs {
        if tail.send(output).is_err() {
            debug!(slot, "tail queue closed, remaining outputs dropped");
            break;
        }
    }

    let _ = credits.send(slot);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use flywheel_shared::{FlywheelError, Result, StageFanout};
    use tokio::sync::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    /// Stage that tracks the number of concurrently executing tasks.
    struct CountingStage {
        fanout: StageFanout,
        executing: AtomicUsize,
        max_observed: AtomicUsize,
        setups: AtomicUsize,
    }

    impl CountingStage {
        fn new(max_slots: usize, max_tasks_per_slot: usize) -> Self {
            Self {
                fanout: StageFanout {
                    max_slots,
                    max_tasks_per_slot,
                },
                executing: AtomicUsize::new(0),
                max_observed: AtomicUsize::new(0),
                setups: AtomicUsize::new(0),
            }
        }
    }

    impl Stage for Arc<CountingStage> {
        type Input = usize;
        type Output = usize;

        fn fanout(&self) -> StageFanout {
            self.fanout
        }

        async fn setup_slot(&self, _slot: SlotId) {
            self.setups.fetch_add(1, Ordering::SeqCst);
        }

        async fn process(&self, _slot: SlotId, task: usize) -> Result<Vec<usize>> {
            let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.executing.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![task])
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(v) = rx.recv().await {
            out.push(v);
        }
        out
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_slots_times_credits() {
        let stage = Arc::new(CountingStage::new(3, 2));
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(Arc::clone(&stage), head_rx, tail_tx).spawn();

        for i in 0..50 {
            head_tx.send(i).unwrap();
        }
        drop(head_tx);

        let outputs = collect(tail_rx).await;
        handle.await.unwrap();

        assert_eq!(outputs.len(), 50);
        assert!(
            stage.max_observed.load(Ordering::SeqCst) <= 6,
            "observed {} concurrent executions, bound is 6",
            stage.max_observed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn slots_are_created_lazily() {
        let stage = Arc::new(CountingStage::new(4, 2));
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(Arc::clone(&stage), head_rx, tail_tx).spawn();

        head_tx.send(0).unwrap();
        drop(head_tx);

        let outputs = collect(tail_rx).await;
        handle.await.unwrap();

        assert_eq!(outputs, vec![0]);
        assert_eq!(stage.setups.load(Ordering::SeqCst), 1, "one task, one slot");
    }

    #[tokio::test]
    async fn setup_runs_once_per_slot_under_burst() {
        let stage = Arc::new(CountingStage::new(3, 2));
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(Arc::clone(&stage), head_rx, tail_tx).spawn();

        for i in 0..30 {
            head_tx.send(i).unwrap();
        }
        drop(head_tx);

        collect(tail_rx).await;
        handle.await.unwrap();

        assert_eq!(stage.setups.load(Ordering::SeqCst), 3);
    }

    /// Stage that fails or panics on chosen tasks. Used to pin credit
    /// conservation: if any failure path leaked its credit, the second wave
    /// below would stall and the test would never finish.
    struct FaultyStage;

    impl Stage for FaultyStage {
        type Input = usize;
        type Output = usize;

        fn fanout(&self) -> StageFanout {
            StageFanout {
                max_slots: 2,
                max_tasks_per_slot: 2,
            }
        }

        async fn process(&self, _slot: SlotId, task: usize) -> Result<Vec<usize>> {
            if task % 7 == 3 {
                panic!("injected panic for task {task}");
            }
            if task % 2 == 1 {
                return Err(FlywheelError::Network(format!("injected failure {task}")));
            }
            Ok(vec![task])
        }
    }

    #[tokio::test]
    async fn credits_survive_errors_and_panics() {
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(FaultyStage, head_rx, tail_tx).spawn();

        // First wave exercises every failure mode; second wave only succeeds
        // if all four credits came back.
        for i in 0..20 {
            head_tx.send(i).unwrap();
        }
        for i in 100..120 {
            head_tx.send(i * 2).unwrap();
        }
        drop(head_tx);

        let outputs = collect(tail_rx).await;
        handle.await.unwrap();

        let first_wave_successes = (0..20).filter(|t| t % 7 != 3 && t % 2 == 0).count();
        assert_eq!(outputs.len(), first_wave_successes + 20);
    }

    /// Stage recording the order in which tasks start executing.
    struct OrderedStage {
        seen: Mutex<Vec<usize>>,
    }

    impl Stage for Arc<OrderedStage> {
        type Input = usize;
        type Output = usize;

        fn fanout(&self) -> StageFanout {
            // One slot, one credit: admission order is directly observable.
            StageFanout {
                max_slots: 1,
                max_tasks_per_slot: 1,
            }
        }

        async fn process(&self, _slot: SlotId, task: usize) -> Result<Vec<usize>> {
            self.seen.lock().await.push(task);
            Ok(vec![task])
        }
    }

    #[tokio::test]
    async fn admission_is_fcfs() {
        let stage = Arc::new(OrderedStage {
            seen: Mutex::new(Vec::new()),
        });
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(Arc::clone(&stage), head_rx, tail_tx).spawn();

        let order: Vec<usize> = vec![9, 1, 8, 2, 7, 3, 6, 4, 5];
        for &t in &order {
            head_tx.send(t).unwrap();
        }
        drop(head_tx);

        collect(tail_rx).await;
        handle.await.unwrap();

        assert_eq!(*stage.seen.lock().await, order);
    }

    /// Stage recording which tasks each slot received, in arrival order.
    struct StripedStage {
        seen: Mutex<std::collections::HashMap<SlotId, Vec<usize>>>,
    }

    impl Stage for Arc<StripedStage> {
        type Input = usize;
        type Output = usize;

        fn fanout(&self) -> StageFanout {
            // One credit per slot: each slot runs sequentially while the
            // three slots interleave.
            StageFanout {
                max_slots: 3,
                max_tasks_per_slot: 1,
            }
        }

        async fn process(&self, slot: SlotId, task: usize) -> Result<Vec<usize>> {
            self.seen.lock().await.entry(slot).or_default().push(task);
            tokio::time::sleep(Duration::from_millis(3)).await;
            Ok(vec![task])
        }
    }

    #[tokio::test]
    async fn admission_order_is_preserved_across_slots() {
        let stage = Arc::new(StripedStage {
            seen: Mutex::new(std::collections::HashMap::new()),
        });
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(Arc::clone(&stage), head_rx, tail_tx).spawn();

        for i in 0..30 {
            head_tx.send(i).unwrap();
        }
        drop(head_tx);

        collect(tail_rx).await;
        handle.await.unwrap();

        // Task i goes to the slot of the i-th dequeued credit, so every
        // slot's inbox sequence must be increasing in head order even while
        // slots run concurrently.
        let seen = stage.seen.lock().await;
        let mut all: Vec<usize> = Vec::new();
        for (slot, tasks) in seen.iter() {
            assert!(
                tasks.windows(2).all(|w| w[0] < w[1]),
                "slot {slot} received tasks out of admission order: {tasks:?}"
            );
            all.extend(tasks);
        }
        all.sort_unstable();
        assert_eq!(all, (0..30).collect::<Vec<_>>());
    }

    /// Fan-out stage: one input produces several outputs, all forwarded.
    struct FanOutStage;

    impl Stage for FanOutStage {
        type Input = usize;
        type Output = usize;

        fn fanout(&self) -> StageFanout {
            StageFanout {
                max_slots: 2,
                max_tasks_per_slot: 1,
            }
        }

        async fn process(&self, _slot: SlotId, task: usize) -> Result<Vec<usize>> {
            Ok(vec![task * 10, task * 10 + 1, task * 10 + 2])
        }
    }

    #[tokio::test]
    async fn all_outputs_of_a_task_are_forwarded() {
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (tail_tx, tail_rx) = mpsc::unbounded_channel();

        let handle = WorkDistributor::new(FanOutStage, head_rx, tail_tx).spawn();

        head_tx.send(1).unwrap();
        head_tx.send(2).unwrap();
        drop(head_tx);

        let mut outputs = collect(tail_rx).await;
        handle.await.unwrap();

        outputs.sort_unstable();
        assert_eq!(outputs, vec![10, 11, 12, 20, 21, 22]);
    }
}
