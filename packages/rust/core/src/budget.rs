//! The run-wide crawl budget.
//!
//! One shared counter caps how many URLs the whole run may crawl, and a
//! seen-URL set keeps re-injected content from crawling the same page twice.
//! Both are what terminates the recursion: once the budget is spent the
//! collector stops feeding summaries back in, and the pipeline drains.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, info};

use flywheel_stages::CrawlGate;

struct BudgetState {
    crawled: usize,
    seen: HashSet<String>,
}

/// Counts crawl admissions against a hard cap and deduplicates URLs.
pub struct CrawlBudget {
    limit: usize,
    state: Mutex<BudgetState>,
}

impl CrawlBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(BudgetState {
                crawled: 0,
                seen: HashSet::new(),
            }),
        }
    }

    /// Number of admissions so far.
    pub fn crawled_count(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.crawled,
            Err(poisoned) => poisoned.into_inner().crawled,
        }
    }

    /// Whether the cap has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.crawled_count() >= self.limit
    }
}

impl CrawlGate for CrawlBudget {
    /// Admit `url` if it is new and the cap has headroom. Admission is
    /// charged here, at submission, not at crawl completion: a failed crawl
    /// still spends budget, which keeps the run bounded even when every
    /// crawl fails.
    fn admit(&self, url: &str) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.seen.contains(url) {
            debug!(%url, "url already crawled this run");
            return false;
        }
        if state.crawled >= self.limit {
            return false;
        }

        state.seen.insert(url.to_string());
        state.crawled += 1;
        if state.crawled == self.limit {
            info!(limit = self.limit, "crawl budget exhausted");
        }
        true
    }
}
