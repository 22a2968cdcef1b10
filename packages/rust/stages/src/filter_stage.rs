//! Filter stage: scraped result batches in, admitted hits out.
//!
//! A thin scheduler adapter over [`SimilarityFilter`]. Failed search outcomes
//! are logged and dropped; hit batches are admitted in order and each
//! accepted hit goes forward as its own task, carrying the query that
//! produced it.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use flywheel_index::SimilarityFilter;
use flywheel_scheduler::{SlotId, Stage, StageFanout};
use flywheel_shared::{Result, SearchHit, SearchOutcome, Task, TaskLog};

/// Admits scraped results through the similarity gate.
pub struct FilterStage {
    filter: Arc<SimilarityFilter>,
    fanout: StageFanout,
    task_log: Option<TaskLog>,
}

impl FilterStage {
    pub fn new(
        filter: Arc<SimilarityFilter>,
        fanout: StageFanout,
        task_log: Option<TaskLog>,
    ) -> Self {
        Self {
            filter,
            fanout,
            task_log,
        }
    }
}

impl Stage for FilterStage {
    type Input = Task<String, SearchOutcome>;
    type Output = Task<String, SearchHit>;

    fn fanout(&self) -> StageFanout {
        self.fanout
    }

    #[instrument(skip_all, fields(slot = slot, query = %task.origin))]
    async fn process(&self, slot: SlotId, task: Self::Input) -> Result<Vec<Self::Output>> {
        let query = task.origin;

        let hits = match task.payload {
            SearchOutcome::Hits(hits) => hits,
            SearchOutcome::Failed { error } => {
                warn!(%slot, %query, %error, "failed search reached filter, dropping");
                return Ok(Vec::new());
            }
        };

        // Embedder or index trouble costs this batch its candidates, never
        // the slot's credit accounting.
        let verdicts = match self.filter.admit_batch(&hits).await {
            Ok(verdicts) => verdicts,
            Err(error) => {
                warn!(%slot, %query, %error, "batch admission failed, dropping batch");
                return Ok(Vec::new());
            }
        };
        let accepted = verdicts.iter().filter(|v| v.accepted).count();
        info!(%slot, candidates = verdicts.len(), accepted, "batch filtered");

        if let Some(log) = &self.task_log {
            for verdict in &verdicts {
                if let Err(error) = log
                    .append(&serde_json::json!({
                        "query": query,
                        "url": verdict.hit.url,
                        "score": verdict.score,
                        "accepted": verdict.accepted,
                    }))
                    .await
                {
                    warn!(%error, "filter log append failed");
                }
            }
        }

        Ok(verdicts
            .into_iter()
            .filter(|v| v.accepted)
            .map(|v| Task::new(query.clone(), v.hit))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flywheel_index::HashEmbedder;
    use flywheel_shared::FilterConfig;

    fn stage() -> FilterStage {
        let filter = Arc::new(SimilarityFilter::new(
            Arc::new(HashEmbedder::new(64)),
            &FilterConfig {
                vector_dimension: 64,
                ..FilterConfig::default()
            },
        ));
        FilterStage::new(
            filter,
            StageFanout {
                max_slots: 9,
                max_tasks_per_slot: 1,
            },
            None,
        )
    }

    fn hit(title: &str, snippet: &str) -> SearchHit {
        SearchHit {
            url: format!("https://example.com/{}", title.replace(' ', "-")),
            title: title.into(),
            snippet: snippet.into(),
        }
    }

    #[tokio::test]
    async fn failed_outcome_yields_no_output() {
        let stage = stage();
        let outputs = stage
            .process(
                0,
                Task::new(
                    "query".into(),
                    SearchOutcome::Failed {
                        error: "retries exhausted".into(),
                    },
                ),
            )
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn accepted_hits_carry_their_query() {
        let stage = stage();
        let outputs = stage
            .process(
                0,
                Task::new(
                    "rust language".into(),
                    SearchOutcome::Hits(vec![hit("rust homepage", "the rust language site")]),
                ),
            )
            .await
            .unwrap();

        // First candidate ever seen bootstraps the index and is admitted.
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].origin, "rust language");
        assert_eq!(outputs[0].payload.title, "rust homepage");
    }

    #[tokio::test]
    async fn duplicate_across_batches_is_dropped() {
        let stage = stage();
        let first = stage
            .process(
                0,
                Task::new(
                    "q".into(),
                    SearchOutcome::Hits(vec![hit("same title", "same snippet")]),
                ),
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = stage
            .process(
                1,
                Task::new(
                    "q".into(),
                    SearchOutcome::Hits(vec![hit("same title", "same snippet")]),
                ),
            )
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn embedder_failure_drops_batch_without_error() {
        use async_trait::async_trait;
        use flywheel_index::Embedder;
        use flywheel_shared::FlywheelError;

        struct BrokenEmbedder;

        #[async_trait]
        impl Embedder for BrokenEmbedder {
            async fn encode(&self, _text: &str) -> flywheel_shared::Result<Vec<f32>> {
                Err(FlywheelError::Network("embedding service down".into()))
            }

            fn dimension(&self) -> usize {
                2
            }
        }

        let filter = Arc::new(SimilarityFilter::new(
            Arc::new(BrokenEmbedder),
            &flywheel_shared::FilterConfig {
                vector_dimension: 2,
                ..flywheel_shared::FilterConfig::default()
            },
        ));
        let stage = FilterStage::new(
            filter,
            StageFanout {
                max_slots: 1,
                max_tasks_per_slot: 1,
            },
            None,
        );

        let outputs = stage
            .process(
                0,
                Task::new(
                    "q".into(),
                    SearchOutcome::Hits(vec![hit("title", "snippet")]),
                ),
            )
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn empty_hit_list_yields_no_output() {
        let stage = stage();
        let outputs = stage
            .process(0, Task::new("q".into(), SearchOutcome::Hits(Vec::new())))
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }
}
