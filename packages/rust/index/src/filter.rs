//! The similarity-gated admission filter.
//!
//! Decides whether a candidate `(title, snippet)` is worth keeping by
//! scoring it against two independent embedding spaces. Accepted candidates
//! are inserted back into the indices before the next candidate in the same
//! batch is scored, so admission gets strictly harder as the run progresses:
//! every acceptance enlarges the comparison set (positive-feedback dedup),
//! and later batch members are deduplicated against earlier ones.
//!
//! Admission policy (see DESIGN.md): the single `accept_threshold` doubles as
//! the relevance gate. Two edges are pinned explicitly: empty indices accept
//! the candidate outright (bootstrap), and scores at or above
//! `duplicate_cutoff` are rejected as near-exact duplicates that the
//! relevance gate would otherwise re-admit.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use flywheel_shared::{FilterConfig, Result, SearchHit};

use crate::embedder::Embedder;
use crate::store::VectorIndex;

/// One scored admission decision.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    /// The candidate under consideration.
    pub hit: SearchHit,
    /// Averaged nearest-neighbor similarity across both spaces.
    pub score: f32,
    /// Whether the candidate was admitted (and indexed).
    pub accepted: bool,
}

/// Both embedding spaces, locked together: the batch's insert-then-compare
/// sequence must be sequential, and cross-slot batches must not interleave.
struct Indices {
    title: VectorIndex,
    snippet: VectorIndex,
}

/// Similarity-gated, order-dependent, monotone admission filter.
pub struct SimilarityFilter {
    embedder: Arc<dyn Embedder>,
    indices: Mutex<Indices>,
    accept_threshold: f32,
    duplicate_cutoff: f32,
    nearest_neighbors: usize,
}

impl SimilarityFilter {
    /// Build a filter with in-memory indices.
    pub fn new(embedder: Arc<dyn Embedder>, config: &FilterConfig) -> Self {
        let dimension = embedder.dimension();
        Self {
            embedder,
            indices: Mutex::new(Indices {
                title: VectorIndex::new(dimension),
                snippet: VectorIndex::new(dimension),
            }),
            accept_threshold: config.accept_threshold,
            duplicate_cutoff: config.duplicate_cutoff,
            nearest_neighbors: config.nearest_neighbors,
        }
    }

    /// Build a filter with checkpoint-backed indices under `dir`.
    pub fn open(embedder: Arc<dyn Embedder>, config: &FilterConfig, dir: &Path) -> Result<Self> {
        let dimension = embedder.dimension();
        let title = VectorIndex::open(dimension, dir.join("title.index.json"))?;
        let snippet = VectorIndex::open(dimension, dir.join("snippet.index.json"))?;

        info!(
            title_entries = title.len(),
            snippet_entries = snippet.len(),
            "similarity filter opened"
        );

        Ok(Self {
            embedder,
            indices: Mutex::new(Indices { title, snippet }),
            accept_threshold: config.accept_threshold,
            duplicate_cutoff: config.duplicate_cutoff,
            nearest_neighbors: config.nearest_neighbors,
        })
    }

    /// Score and admit one batch of candidates, in order.
    ///
    /// The whole batch runs under a single index lock; each acceptance
    /// inserts both embeddings before the next candidate is scored.
    /// Rejection leaves the indices untouched. Checkpoints are written once
    /// per batch, after the last insert.
    pub async fn admit_batch(&self, candidates: &[SearchHit]) -> Result<Vec<FilterVerdict>> {
        let mut indices = self.indices.lock().await;
        let mut verdicts = Vec::with_capacity(candidates.len());
        let mut inserted = false;

        for hit in candidates {
            let title_vec = self.embedder.encode(&hit.title).await?;
            let snippet_vec = self.embedder.encode(&hit.snippet).await?;

            let score = batch_score(&indices, &title_vec, &snippet_vec, self.nearest_neighbors)?;
            let accepted = self.decide(&indices, score);

            if accepted {
                indices.title.add(title_vec)?;
                indices.snippet.add(snippet_vec)?;
                inserted = true;
            }

            debug!(url = %hit.url, score, accepted, "candidate scored");
            verdicts.push(FilterVerdict {
                hit: hit.clone(),
                score,
                accepted,
            });
        }

        if inserted {
            indices.title.checkpoint()?;
            indices.snippet.checkpoint()?;
        }

        Ok(verdicts)
    }

    /// Current number of accepted entries (title space).
    pub async fn indexed_count(&self) -> usize {
        self.indices.lock().await.title.len()
    }

    fn decide(&self, indices: &Indices, score: f32) -> bool {
        // Nothing to compare against yet: admit and seed the indices.
        if indices.title.is_empty() && indices.snippet.is_empty() {
            return true;
        }
        score >= self.accept_threshold && score < self.duplicate_cutoff
    }
}

/// `(avg title neighbor similarity + avg snippet neighbor similarity) / 2`,
/// where an empty index contributes 0.
fn batch_score(
    indices: &Indices,
    title_vec: &[f32],
    snippet_vec: &[f32],
    k: usize,
) -> Result<f32> {
    let title_avg = average_distance(indices.title.search(title_vec, k)?);
    let snippet_avg = average_distance(indices.snippet.search(snippet_vec, k)?);
    Ok((title_avg + snippet_avg) / 2.0)
}

fn average_distance(neighbors: Vec<crate::store::Neighbor>) -> f32 {
    if neighbors.is_empty() {
        return 0.0;
    }
    neighbors.iter().map(|n| n.distance).sum::<f32>() / neighbors.len() as f32
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;

    /// Embedder returning hand-picked vectors per exact text.
    struct StubEmbedder {
        vectors: HashMap<String, Vec<f32>>,
    }

    impl StubEmbedder {
        fn new(entries: &[(&str, [f32; 2])]) -> Arc<Self> {
            Arc::new(Self {
                vectors: entries
                    .iter()
                    .map(|(text, v)| (text.to_string(), v.to_vec()))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn encode(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self
                .vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| vec![0.0, 0.0]))
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn hit(title: &str, snippet: &str) -> SearchHit {
        SearchHit {
            url: format!("https://example.com/{title}"),
            title: title.into(),
            snippet: snippet.into(),
        }
    }

    fn config() -> FilterConfig {
        FilterConfig {
            accept_threshold: 0.5,
            duplicate_cutoff: 0.95,
            nearest_neighbors: 1,
            vector_dimension: 2,
            ..FilterConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_indices_accept_first_candidate() {
        let embedder = StubEmbedder::new(&[("t1", [1.0, 0.0]), ("s1", [0.0, 1.0])]);
        let filter = SimilarityFilter::new(embedder, &config());

        let verdicts = filter.admit_batch(&[hit("t1", "s1")]).await.unwrap();
        assert!(verdicts[0].accepted);
        assert_eq!(verdicts[0].score, 0.0);
        assert_eq!(filter.indexed_count().await, 1);
    }

    #[tokio::test]
    async fn exact_duplicate_scores_high_and_is_rejected() {
        let embedder = StubEmbedder::new(&[("t1", [1.0, 0.0]), ("s1", [0.0, 1.0])]);
        let filter = SimilarityFilter::new(embedder, &config());

        filter.admit_batch(&[hit("t1", "s1")]).await.unwrap();
        let verdicts = filter.admit_batch(&[hit("t1", "s1")]).await.unwrap();

        // Monotonicity: a duplicate of an accepted pair always clears the
        // relevance threshold...
        assert!(verdicts[0].score >= 0.5);
        assert!((verdicts[0].score - 1.0).abs() < 1e-5);
        // ...but the duplicate cutoff rejects it.
        assert!(!verdicts[0].accepted);
    }

    #[tokio::test]
    async fn rejection_never_mutates_the_index() {
        let embedder = StubEmbedder::new(&[
            ("t1", [1.0, 0.0]),
            ("s1", [0.0, 1.0]),
            ("far-title", [-1.0, 0.0]),
            ("far-snippet", [0.0, -1.0]),
        ]);
        let filter = SimilarityFilter::new(embedder, &config());

        filter.admit_batch(&[hit("t1", "s1")]).await.unwrap();
        let before = filter.indexed_count().await;

        // Dissimilar candidate: score well below threshold.
        let verdicts = filter
            .admit_batch(&[hit("far-title", "far-snippet")])
            .await
            .unwrap();
        assert!(!verdicts[0].accepted);
        assert!(verdicts[0].score < 0.5);
        assert_eq!(filter.indexed_count().await, before);

        // Rejecting it again produces the identical verdict.
        let again = filter
            .admit_batch(&[hit("far-title", "far-snippet")])
            .await
            .unwrap();
        assert_eq!(again[0].score, verdicts[0].score);
        assert!(!again[0].accepted);
    }

    #[tokio::test]
    async fn related_candidate_passes_the_relevance_gate() {
        // cos([1,0], [0.8,0.6]) = 0.8 in both spaces: related, not duplicate.
        let embedder = StubEmbedder::new(&[
            ("t1", [1.0, 0.0]),
            ("s1", [1.0, 0.0]),
            ("t2", [0.8, 0.6]),
            ("s2", [0.8, 0.6]),
        ]);
        let filter = SimilarityFilter::new(embedder, &config());

        filter.admit_batch(&[hit("t1", "s1")]).await.unwrap();
        let verdicts = filter.admit_batch(&[hit("t2", "s2")]).await.unwrap();

        assert!((verdicts[0].score - 0.8).abs() < 1e-5);
        assert!(verdicts[0].accepted);
        assert_eq!(filter.indexed_count().await, 2);
    }

    #[tokio::test]
    async fn intra_batch_duplicates_are_deduplicated() {
        let embedder = StubEmbedder::new(&[("t1", [1.0, 0.0]), ("s1", [0.0, 1.0])]);
        let filter = SimilarityFilter::new(embedder, &config());

        // Same candidate twice in ONE batch: the first insert must be
        // visible to the second comparison.
        let verdicts = filter
            .admit_batch(&[hit("t1", "s1"), hit("t1", "s1")])
            .await
            .unwrap();

        assert!(verdicts[0].accepted);
        assert!(!verdicts[1].accepted);
        assert_eq!(filter.indexed_count().await, 1);
    }

    #[tokio::test]
    async fn acceptance_is_harder_after_similar_insert() {
        // Candidate scores 0.6 against index {x}: accepted in a run where x
        // is present at threshold 0.5, but its own duplicate (score 1.0)
        // is not — acceptance probability is non-increasing as the index
        // grows toward the candidate.
        let embedder = StubEmbedder::new(&[
            ("x-t", [1.0, 0.0]),
            ("x-s", [1.0, 0.0]),
            ("c-t", [0.6, 0.8]),
            ("c-s", [0.6, 0.8]),
        ]);
        let filter = SimilarityFilter::new(embedder, &config());

        filter.admit_batch(&[hit("x-t", "x-s")]).await.unwrap();

        let first = filter.admit_batch(&[hit("c-t", "c-s")]).await.unwrap();
        assert!(first[0].accepted);

        let second = filter.admit_batch(&[hit("c-t", "c-s")]).await.unwrap();
        assert!(second[0].score > first[0].score);
        assert!(!second[0].accepted);
    }

    #[tokio::test]
    async fn checkpointed_filter_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("fw-filter-{}", uuid::Uuid::now_v7()));
        let embedder = StubEmbedder::new(&[("t1", [1.0, 0.0]), ("s1", [0.0, 1.0])]);

        {
            let filter =
                SimilarityFilter::open(embedder.clone(), &config(), &dir).unwrap();
            filter.admit_batch(&[hit("t1", "s1")]).await.unwrap();
        }

        let reopened = SimilarityFilter::open(embedder, &config(), &dir).unwrap();
        assert_eq!(reopened.indexed_count().await, 1);

        // The duplicate is still recognized across the restart.
        let verdicts = reopened.admit_batch(&[hit("t1", "s1")]).await.unwrap();
        assert!(!verdicts[0].accepted);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
