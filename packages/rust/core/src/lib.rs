//! Pipeline assembly for the flywheel: batching, the crawl budget, and the
//! recursive stage chain.
//!
//! [`Pipeline`] wires the four stages through work distributors, feeds
//! successful crawl summaries back into the intake, and runs to quiescence.
//! [`CrawlBudget`] bounds the recursion.

pub mod batcher;
pub mod budget;
pub mod pipeline;

pub use budget::CrawlBudget;
pub use pipeline::{Pipeline, RunSummary};
