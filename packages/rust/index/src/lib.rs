//! Embeddings, nearest-neighbor search, and the similarity-gated filter.
//!
//! - [`Embedder`] — the embedding-model collaborator trait, with an HTTP
//!   client and a deterministic hash embedder for tests/offline runs
//! - [`VectorIndex`] — append-only cosine-similarity index with JSON
//!   checkpoints
//! - [`SimilarityFilter`] — the accept/reject/feedback admission algorithm

pub mod embedder;
pub mod filter;
pub mod store;

pub use embedder::{Embedder, HashEmbedder, HttpEmbedder};
pub use filter::{FilterVerdict, SimilarityFilter};
pub use store::{Neighbor, VectorIndex};
