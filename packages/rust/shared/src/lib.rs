//! Shared types, error model, and configuration for the flywheel pipeline.
//!
//! This crate is the foundation depended on by all other flywheel crates.
//! It provides:
//! - [`FlywheelError`] — the unified error type
//! - Domain types ([`Task`], [`SearchHit`], [`CrawlReport`], [`TaskId`])
//! - Configuration ([`AppConfig`], config loading and validation)
//! - [`TaskLog`] — append-only per-stage audit logs

pub mod config;
pub mod error;
pub mod tasklog;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlerConfig, FilterConfig, LimitsConfig, LlmConfig, ProxyConfig, SearchConfig,
    StageFanout, StagesConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_config,
};
pub use error::{FlywheelError, Result};
pub use tasklog::TaskLog;
pub use types::{CrawlReport, CrawlStatus, SearchHit, SearchOutcome, Task, TaskId};
