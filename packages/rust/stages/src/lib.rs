//! Concrete pipeline stages and their collaborator clients.
//!
//! Each stage is a [`Stage`] implementation run under a work distributor:
//! - [`QueryGenStage`] — seed-document batches to search queries
//! - [`ScrapeStage`] — queries to search-result batches, via rotating
//!   outbound identities
//! - [`FilterStage`] — result batches through the similarity gate
//! - [`CrawlStage`] — admitted hits to summarized crawl reports
//!
//! Collaborators (language model, search engine, proxy control, crawl
//! service) sit behind traits with HTTP implementations, so stage logic
//! tests against stubs.
//!
//! [`Stage`]: flywheel_scheduler::Stage

pub mod crawl;
pub mod filter_stage;
pub mod llm;
pub mod proxy;
pub mod query_gen;
pub mod search;

pub use crawl::{
    CrawlGate, CrawlPoll, CrawlService, CrawlSettings, CrawlStage, HttpCrawlService, OpenGate,
};
pub use filter_stage::FilterStage;
pub use llm::{ChatMessage, HttpLanguageModel, LanguageModel};
pub use proxy::{HttpProxyControl, NullProxyControl, ProxyControl};
pub use query_gen::QueryGenStage;
pub use search::{HttpSearchEngine, ScrapeSettings, ScrapeStage, SearchEngine};
