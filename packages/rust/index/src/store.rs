//! Append-only flat vector index with JSON checkpointing.
//!
//! Entries are never removed or updated: the index strictly grows as
//! accepted candidates are inserted, which is what makes the filter's
//! admission decisions a function of index history. Similarity is the inner
//! product of L2-normalized vectors (cosine; higher = more similar).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flywheel_shared::{FlywheelError, Result};

/// One nearest-neighbor match: cosine similarity and the entry's insertion id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Cosine similarity in `[-1, 1]`.
    pub distance: f32,
    /// Zero-based insertion order of the matched entry.
    pub id: usize,
}

/// On-disk checkpoint shape.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

/// Append-only nearest-neighbor index over normalized embeddings.
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    checkpoint_path: Option<PathBuf>,
}

impl VectorIndex {
    /// Create an empty in-memory index.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            checkpoint_path: None,
        }
    }

    /// Open an index backed by a checkpoint file: reload it if present and
    /// readable, otherwise start fresh (logged, never fatal).
    pub fn open(dimension: usize, checkpoint_path: impl Into<PathBuf>) -> Result<Self> {
        let path = checkpoint_path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FlywheelError::io(parent, e))?;
        }

        let vectors = match load_checkpoint(&path, dimension) {
            Some(vectors) => {
                info!(path = %path.display(), entries = vectors.len(), "index checkpoint loaded");
                vectors
            }
            None => Vec::new(),
        };

        Ok(Self {
            dimension,
            vectors,
            checkpoint_path: Some(path),
        })
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Append one vector, returning its insertion id. The vector is
    /// L2-normalized on the way in so search reduces to a dot product.
    pub fn add(&mut self, mut vector: Vec<f32>) -> Result<usize> {
        if vector.len() != self.dimension {
            return Err(FlywheelError::Index(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            )));
        }

        normalize(&mut vector);
        self.vectors.push(vector);
        Ok(self.vectors.len() - 1)
    }

    /// Return up to `k` nearest neighbors of `query`, most similar first.
    /// An empty index yields no neighbors.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(FlywheelError::Index(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }

        let mut normalized = query.to_vec();
        normalize(&mut normalized);

        let mut neighbors: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(id, v)| Neighbor {
                distance: dot(&normalized, v),
                id,
            })
            .collect();

        neighbors.sort_by(|a, b| b.distance.total_cmp(&a.distance));
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Persist the index to its checkpoint file, if one is configured.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(path) = &self.checkpoint_path else {
            return Ok(());
        };

        let checkpoint = Checkpoint {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let content = serde_json::to_string(&checkpoint)
            .map_err(|e| FlywheelError::Index(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| FlywheelError::io(path, e))?;
        Ok(())
    }
}

/// Read a checkpoint, returning `None` when absent, unreadable, or of a
/// different dimensionality.
fn load_checkpoint(path: &Path, dimension: usize) -> Option<Vec<Vec<f32>>> {
    let content = std::fs::read_to_string(path).ok()?;

    match serde_json::from_str::<Checkpoint>(&content) {
        Ok(checkpoint) if checkpoint.dimension == dimension => Some(checkpoint.vectors),
        Ok(checkpoint) => {
            warn!(
                path = %path.display(),
                found = checkpoint.dimension,
                expected = dimension,
                "checkpoint dimension mismatch, starting fresh"
            );
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting fresh");
            None
        }
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
