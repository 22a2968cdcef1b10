//! Greedy document batching in front of query generation.
//!
//! Query generation wants batches, the intake queue carries single documents
//! (seeds and re-injected summaries alike). The relay waits for one
//! document, then drains whatever else is already queued up to `max_batch`
//! and forwards the batch. No timers: a lone document becomes a batch of
//! one immediately.

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Relay documents into batches until the intake closes or the consumer
/// goes away.
pub async fn relay_batches(
    mut intake: UnboundedReceiver<String>,
    output: UnboundedSender<Vec<String>>,
    max_batch: usize,
) {
    while let Some(first) = intake.recv().await {
        let mut batch = vec![first];
        while batch.len() < max_batch {
            match intake.try_recv() {
                Ok(doc) => batch.push(doc),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        debug!(docs = batch.len(), "document batch relayed");
        if output.send(batch).is_err() {
            break;
        }
    }

    debug!("document intake closed, batcher exiting");
}
