//! Search scraping: queries in, result batches out.
//!
//! Each slot owns one outbound identity with a sampled fetch budget. Before a
//! fetch the slot waits a jittered interval; when the budget runs out it
//! renews the identity, waits out the renewal cooldown, and samples a fresh
//! budget. Request failures are retried a bounded number of times; retry
//! exhaustion forwards a `SearchOutcome::Failed` instead of escaping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use flywheel_scheduler::{SlotId, Stage, StageFanout};
use flywheel_shared::{
    FlywheelError, ProxyConfig, Result, SearchConfig, SearchHit, SearchOutcome, Task, TaskLog,
};

use crate::proxy::ProxyControl;

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("flywheel/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Search engine collaborator
// ---------------------------------------------------------------------------

/// Runs one web search and returns parsed result rows.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// Scrapes an HTML results page from a search frontend.
pub struct HttpSearchEngine {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchEngine {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FlywheelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SearchEngine for HttpSearchEngine {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| FlywheelError::config(format!("search endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("num", &limit.to_string());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FlywheelError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlywheelError::Network(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| FlywheelError::Network(format!("{}: {e}", self.endpoint)))?;

        Ok(parse_results(&html, limit))
    }
}

/// Extract result rows from a search results page. Rows missing a link or
/// title are skipped; at most `limit` rows are returned.
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchHit> {
    // Literal selectors, parse cannot fail.
    let row = Selector::parse("div.result, div.g").expect("row selector");
    let title = Selector::parse("h3, a.result-title").expect("title selector");
    let link = Selector::parse("a[href]").expect("link selector");
    let snippet = Selector::parse("p.snippet, div.snippet, span.snippet").expect("snippet selector");

    let document = Html::parse_document(html);
    let mut hits = Vec::new();

    for element in document.select(&row) {
        let Some(href) = element
            .select(&link)
            .filter_map(|a| a.value().attr("href"))
            .find(|href| href.starts_with("http"))
        else {
            continue;
        };

        let title_text: String = match element.select(&title).next() {
            Some(node) => node.text().collect::<String>().trim().to_string(),
            None => continue,
        };
        if title_text.is_empty() {
            continue;
        }

        let snippet_text: String = element
            .select(&snippet)
            .next()
            .map(|node| node.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        hits.push(SearchHit {
            url: href.to_string(),
            title: title_text,
            snippet: snippet_text,
        });
        if hits.len() == limit {
            break;
        }
    }

    hits
}

// ---------------------------------------------------------------------------
// Scrape stage
// ---------------------------------------------------------------------------

/// Pacing and retry knobs for the scrape stage, in real time units so tests
/// can shrink the waits to milliseconds.
#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    /// Results requested per query.
    pub url_limit: usize,
    /// Retries after the first failed attempt.
    pub max_request_retries: usize,
    /// Inclusive range of fetches served per identity.
    pub fetches_per_identity: [u64; 2],
    /// Inclusive jitter range of the inter-fetch wait.
    pub wait_between_fetches: [Duration; 2],
    /// Inclusive jitter range of the post-renewal cooldown.
    pub wait_after_renewal: [Duration; 2],
}

impl ScrapeSettings {
    /// Derive settings from the search and proxy config sections.
    pub fn from_config(search: &SearchConfig, proxy: &ProxyConfig) -> Self {
        let secs = |range: [u64; 2]| [Duration::from_secs(range[0]), Duration::from_secs(range[1])];
        Self {
            url_limit: search.url_limit,
            max_request_retries: search.max_request_retries,
            fetches_per_identity: proxy.fetches_per_identity,
            wait_between_fetches: secs(proxy.wait_between_fetches_secs),
            wait_after_renewal: secs(proxy.wait_after_renewal_secs),
        }
    }
}

/// Per-slot identity state: fetches remaining before the next renewal.
struct SlotBudget {
    remaining: u64,
}

/// Runs search queries through rotating outbound identities.
pub struct ScrapeStage {
    engine: Arc<dyn SearchEngine>,
    proxy: Arc<dyn ProxyControl>,
    fanout: StageFanout,
    settings: ScrapeSettings,
    budgets: Mutex<HashMap<SlotId, SlotBudget>>,
    task_log: Option<TaskLog>,
}

impl ScrapeStage {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        proxy: Arc<dyn ProxyControl>,
        fanout: StageFanout,
        settings: ScrapeSettings,
        task_log: Option<TaskLog>,
    ) -> Self {
        Self {
            engine,
            proxy,
            fanout,
            settings,
            budgets: Mutex::new(HashMap::new()),
            task_log,
        }
    }

    fn sample_budget(&self) -> u64 {
        let [lo, hi] = self.settings.fetches_per_identity;
        rand::thread_rng().gen_range(lo..=hi)
    }

    fn sample_wait(range: [Duration; 2]) -> Duration {
        let [lo, hi] = range;
        if hi <= lo {
            return lo;
        }
        let millis = rand::thread_rng().gen_range(lo.as_millis()..=hi.as_millis());
        Duration::from_millis(millis as u64)
    }

    /// Take one fetch from the slot's budget, renewing the identity first if
    /// the budget is spent. A failed renewal keeps the old identity rather
    /// than stalling the slot. The renewal cooldown runs outside the budgets
    /// lock so other slots keep fetching.
    async fn charge_fetch(&self, slot: SlotId) {
        {
            let mut budgets = self.budgets.lock().await;
            let budget = budgets.entry(slot).or_insert_with(|| SlotBudget {
                remaining: self.sample_budget(),
            });
            if budget.remaining > 0 {
                budget.remaining -= 1;
                return;
            }
        }

        match self.proxy.renew_identity(slot).await {
            Ok(()) => {
                let cooldown = Self::sample_wait(self.settings.wait_after_renewal);
                debug!(%slot, cooldown_ms = cooldown.as_millis() as u64, "renewal cooldown");
                tokio::time::sleep(cooldown).await;

                let mut budgets = self.budgets.lock().await;
                if let Some(budget) = budgets.get_mut(&slot) {
                    budget.remaining = self.sample_budget().saturating_sub(1);
                }
            }
            Err(error) => {
                warn!(%slot, %error, "identity renewal failed, reusing current identity");
            }
        }
    }

    async fn search_with_retries(&self, query: &str) -> Result<Vec<SearchHit>> {
        let mut attempt = 0usize;
        loop {
            match self.engine.search(query, self.settings.url_limit).await {
                Ok(hits) => return Ok(hits),
                Err(error) if attempt < self.settings.max_request_retries => {
                    attempt += 1;
                    warn!(%error, attempt, "search attempt failed, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Stage for ScrapeStage {
    type Input = Task<String, String>;
    type Output = Task<String, SearchOutcome>;

    fn fanout(&self) -> StageFanout {
        self.fanout
    }

    /// Bind a fresh identity to the slot before its first fetch.
    async fn setup_slot(&self, slot: SlotId) {
        if let Err(error) = self.proxy.renew_identity(slot).await {
            warn!(%slot, %error, "initial identity renewal failed, using default identity");
        }
        self.budgets.lock().await.insert(
            slot,
            SlotBudget {
                remaining: self.sample_budget(),
            },
        );
    }

    #[instrument(skip_all, fields(slot = slot, query = %task.payload))]
    async fn process(&self, slot: SlotId, task: Self::Input) -> Result<Vec<Self::Output>> {
        tokio::time::sleep(Self::sample_wait(self.settings.wait_between_fetches)).await;
        self.charge_fetch(slot).await;

        let query = task.payload;
        let outcome = match self.search_with_retries(&query).await {
            Ok(hits) => {
                info!(%slot, hits = hits.len(), "search scraped");
                SearchOutcome::Hits(hits)
            }
            Err(error) => {
                warn!(%slot, %error, "search retries exhausted");
                SearchOutcome::Failed {
                    error: error.to_string(),
                }
            }
        };

        if let Some(log) = &self.task_log {
            if let Err(error) = log
                .append(&serde_json::json!({ "query": query, "outcome": outcome }))
                .await
            {
                warn!(%error, "scrape log append failed");
            }
        }

        Ok(vec![Task::new(query, outcome)])
    }
}
