//! Core domain types shared by every pipeline stage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for task identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-sortable task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task envelope
// ---------------------------------------------------------------------------

/// The immutable unit of work relayed between stages.
///
/// `origin` is the input that produced `payload`; both are opaque to the
/// scheduler. A stage never mutates an envelope in place — it produces a new
/// one for each output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task<T, U> {
    /// The input that produced this payload.
    pub origin: T,
    /// The stage's output for that input.
    pub payload: U,
}

impl<T, U> Task<T, U> {
    /// Wrap an origin/payload pair into a new envelope.
    pub fn new(origin: T, payload: U) -> Self {
        Self { origin, payload }
    }
}

// ---------------------------------------------------------------------------
// Search types
// ---------------------------------------------------------------------------

/// One result row from the search-engine collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Result URL.
    pub url: String,
    /// Result title.
    pub title: String,
    /// Result snippet/description.
    pub snippet: String,
}

/// Outcome of scraping one query. Retry exhaustion produces `Failed` rather
/// than an escaped error, so the scheduler's credit accounting is untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SearchOutcome {
    /// Search succeeded with zero or more hits.
    Hits(Vec<SearchHit>),
    /// All retry attempts exhausted.
    Failed { error: String },
}

// ---------------------------------------------------------------------------
// Crawl types
// ---------------------------------------------------------------------------

/// Terminal status of a crawl attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrawlStatus {
    /// Page fetched and summarized.
    Success,
    /// Crawl service reported failure or the poll timed out.
    Failed,
    /// Domain matched the static blocklist; no fetch was enqueued.
    Blocked,
}

/// Result task emitted by the crawl stage for every admitted URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    /// The crawled URL.
    pub url: String,
    /// Terminal status.
    pub status: CrawlStatus,
    /// Summarized page content on success, diagnostic text otherwise.
    pub content: String,
}

impl CrawlReport {
    /// Whether this report carries usable content for re-injection.
    pub fn is_success(&self) -> bool {
        self.status == CrawlStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_unique_and_displays() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn envelope_roundtrip() {
        let task = Task::new("seed doc".to_string(), vec!["query one".to_string()]);
        let json = serde_json::to_string(&task).expect("serialize");
        let parsed: Task<String, Vec<String>> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.origin, "seed doc");
        assert_eq!(parsed.payload.len(), 1);
    }

    #[test]
    fn crawl_status_serializes_screaming() {
        let json = serde_json::to_string(&CrawlStatus::Success).expect("serialize");
        assert_eq!(json, "\"SUCCESS\"");
        let json = serde_json::to_string(&CrawlStatus::Failed).expect("serialize");
        assert_eq!(json, "\"FAILED\"");
    }

    #[test]
    fn report_success_check() {
        let report = CrawlReport {
            url: "https://example.com/a".into(),
            status: CrawlStatus::Blocked,
            content: "URL blocked by facebook".into(),
        };
        assert!(!report.is_success());
    }
}
