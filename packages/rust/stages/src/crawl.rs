//! Crawl stage: admitted hits in, summarized crawl reports out.
//!
//! The crawl itself is delegated to an external service: submit the URL,
//! then poll a status endpoint until the page is ready or a deadline
//! passes. Blocked domains are reported without ever reaching the service,
//! and the [`CrawlGate`] lets the pipeline cap the total number of crawls
//! and drop URLs it has already seen. Completed pages are summarized by the
//! language model before being forwarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use flywheel_scheduler::{SlotId, Stage, StageFanout};
use flywheel_shared::{
    CrawlReport, CrawlStatus, CrawlerConfig, FlywheelError, Result, SearchHit, Task, TaskLog,
};

use crate::llm::{strip_preamble, ChatMessage, LanguageModel, SUMMARY_PREAMBLE};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("flywheel/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Crawl service collaborator
// ---------------------------------------------------------------------------

/// One observation of a submitted crawl.
#[derive(Debug, Clone)]
pub enum CrawlPoll {
    /// Still in the service's queue.
    Pending,
    /// Page fetched; raw text attached.
    Completed { content: String },
    /// The service gave up on the URL.
    Failed,
}

/// External crawler with a submit/poll interface.
#[async_trait]
pub trait CrawlService: Send + Sync {
    /// Enqueue `url`. Returns whether the service accepted it.
    async fn submit(&self, url: &str) -> Result<bool>;

    /// Poll the crawl state of a previously submitted `url`.
    async fn status(&self, url: &str) -> Result<CrawlPoll>;
}

#[derive(Serialize)]
struct CrawlRequest<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    accepted: bool,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for the crawl service's two endpoints.
pub struct HttpCrawlService {
    client: reqwest::Client,
    crawl_endpoint: String,
    status_endpoint: String,
}

impl HttpCrawlService {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FlywheelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            crawl_endpoint: config.crawl_endpoint.clone(),
            status_endpoint: config.status_endpoint.clone(),
        })
    }
}

#[async_trait]
impl CrawlService for HttpCrawlService {
    async fn submit(&self, url: &str) -> Result<bool> {
        let response = self
            .client
            .post(&self.crawl_endpoint)
            .json(&CrawlRequest { url })
            .send()
            .await
            .map_err(|e| FlywheelError::Network(format!("{}: {e}", self.crawl_endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlywheelError::Network(format!(
                "{}: HTTP {status}",
                self.crawl_endpoint
            )));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| FlywheelError::malformed(format!("crawl submit response: {e}")))?;
        Ok(parsed.accepted)
    }

    async fn status(&self, url: &str) -> Result<CrawlPoll> {
        let response = self
            .client
            .post(&self.status_endpoint)
            .json(&CrawlRequest { url })
            .send()
            .await
            .map_err(|e| FlywheelError::Network(format!("{}: {e}", self.status_endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlywheelError::Network(format!(
                "{}: HTTP {status}",
                self.status_endpoint
            )));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| FlywheelError::malformed(format!("crawl status response: {e}")))?;

        match parsed.status.as_str() {
            "PENDING" => Ok(CrawlPoll::Pending),
            "COMPLETED" => Ok(CrawlPoll::Completed {
                content: parsed.content.unwrap_or_default(),
            }),
            "FAILED" => Ok(CrawlPoll::Failed),
            other => Err(FlywheelError::malformed(format!(
                "unknown crawl status {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Crawl gate
// ---------------------------------------------------------------------------

/// Pipeline-level admission for crawl attempts: the run-wide URL cap plus
/// seen-URL dedup. A rejected URL produces no report at all.
pub trait CrawlGate: Send + Sync {
    fn admit(&self, url: &str) -> bool;
}

/// Gate that admits everything; for runs and tests without a crawl cap.
pub struct OpenGate;

impl CrawlGate for OpenGate {
    fn admit(&self, _url: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Crawl stage
// ---------------------------------------------------------------------------

/// Poll pacing knobs, in real time units so tests can shrink them.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Substring matches against the lowercased URL host.
    pub blocked_domains: Vec<String>,
}

impl CrawlSettings {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            blocked_domains: config.blocked_domains.clone(),
        }
    }
}

/// Crawls admitted URLs and summarizes their content.
pub struct CrawlStage {
    service: Arc<dyn CrawlService>,
    llm: Arc<dyn LanguageModel>,
    gate: Arc<dyn CrawlGate>,
    fanout: StageFanout,
    settings: CrawlSettings,
    task_log: Option<TaskLog>,
}

impl CrawlStage {
    pub fn new(
        service: Arc<dyn CrawlService>,
        llm: Arc<dyn LanguageModel>,
        gate: Arc<dyn CrawlGate>,
        fanout: StageFanout,
        settings: CrawlSettings,
        task_log: Option<TaskLog>,
    ) -> Self {
        Self {
            service,
            llm,
            gate,
            fanout,
            settings,
            task_log,
        }
    }

    /// Blocklist entry matching the URL's host, if any.
    fn blocked_by(&self, url: &str) -> Option<&str> {
        let host = Url::parse(url).ok()?.host_str()?.to_lowercase();
        self.settings
            .blocked_domains
            .iter()
            .find(|domain| host.contains(domain.as_str()))
            .map(String::as_str)
    }

    /// Poll until the crawl resolves or the deadline passes.
    async fn await_crawl(&self, url: &str) -> Result<CrawlPoll> {
        let deadline = tokio::time::Instant::now() + self.settings.poll_timeout;
        loop {
            match self.service.status(url).await? {
                CrawlPoll::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        debug!(%url, "crawl poll deadline passed");
                        return Ok(CrawlPoll::Failed);
                    }
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                resolved => return Ok(resolved),
            }
        }
    }

    async fn summarize(&self, content: &str) -> Result<String> {
        let response = self
            .llm
            .respond(&[ChatMessage::user(format!(
                "Summarize the following text in a brief paragraph. Begin your \
                 response with the line \"{SUMMARY_PREAMBLE}\".\n\n{content}"
            ))])
            .await?;
        Ok(strip_preamble(&response, SUMMARY_PREAMBLE).to_string())
    }

    async fn crawl_one(&self, url: &str) -> CrawlReport {
        let submitted = match self.service.submit(url).await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%url, %error, "crawl submission failed");
                false
            }
        };
        if !submitted {
            return CrawlReport {
                url: url.to_string(),
                status: CrawlStatus::Failed,
                content: "crawl service did not accept the URL".into(),
            };
        }

        let poll = match self.await_crawl(url).await {
            Ok(poll) => poll,
            Err(error) => {
                warn!(%url, %error, "crawl polling failed");
                CrawlPoll::Failed
            }
        };

        let content = match poll {
            CrawlPoll::Completed { content } => content,
            _ => {
                return CrawlReport {
                    url: url.to_string(),
                    status: CrawlStatus::Failed,
                    content: "crawl did not complete".into(),
                };
            }
        };

        match self.summarize(&content).await {
            Ok(summary) => CrawlReport {
                url: url.to_string(),
                status: CrawlStatus::Success,
                content: summary,
            },
            Err(error) => {
                warn!(%url, %error, "summarization failed");
                CrawlReport {
                    url: url.to_string(),
                    status: CrawlStatus::Failed,
                    content: format!("summarization failed: {error}"),
                }
            }
        }
    }
}

impl Stage for CrawlStage {
    type Input = Task<String, SearchHit>;
    type Output = Task<String, CrawlReport>;

    fn fanout(&self) -> StageFanout {
        self.fanout
    }

    #[instrument(skip_all, fields(slot = slot, url = %task.payload.url))]
    async fn process(&self, slot: SlotId, task: Self::Input) -> Result<Vec<Self::Output>> {
        let query = task.origin;
        let url = task.payload.url;

        let report = if let Some(domain) = self.blocked_by(&url) {
            info!(%slot, %url, %domain, "domain blocked");
            CrawlReport {
                url: url.clone(),
                status: CrawlStatus::Blocked,
                content: format!("domain matched blocklist entry {domain}"),
            }
        } else if !self.gate.admit(&url) {
            debug!(%slot, %url, "crawl not admitted");
            return Ok(Vec::new());
        } else {
            let report = self.crawl_one(&url).await;
            info!(%slot, %url, status = ?report.status, "crawl finished");
            report
        };

        if let Some(log) = &self.task_log {
            if let Err(error) = log
                .append(&serde_json::json!({
                    "query": query,
                    "url": report.url,
                    "status": report.status,
                }))
                .await
            {
                warn!(%error, "crawl log append failed");
            }
        }

        Ok(vec![Task::new(query, report)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedModel {
        response: String,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn respond(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok(self.response.clone())
        }
    }

    /// Service stub replaying scripted polls after a successful submit.
    struct ScriptedService {
        accept: bool,
        polls: Mutex<Vec<CrawlPoll>>,
        submits: AtomicUsize,
    }

    impl ScriptedService {
        fn new(accept: bool, polls: Vec<CrawlPoll>) -> Arc<Self> {
            Arc::new(Self {
                accept,
                polls: Mutex::new(polls),
                submits: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CrawlService for ScriptedService {
        async fn submit(&self, _url: &str) -> Result<bool> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(self.accept)
        }

        async fn status(&self, _url: &str) -> Result<CrawlPoll> {
            Ok(self
                .polls
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(CrawlPoll::Pending))
        }
    }

    fn settings() -> CrawlSettings {
        CrawlSettings {
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(20),
            blocked_domains: vec!["facebook".into(), "pinterest".into()],
        }
    }

    fn stage(service: Arc<ScriptedService>, summary: &str) -> CrawlStage {
        CrawlStage::new(
            service,
            Arc::new(ScriptedModel {
                response: summary.into(),
            }),
            Arc::new(OpenGate),
            StageFanout {
                max_slots: 2,
                max_tasks_per_slot: 4,
            },
            settings(),
            None,
        )
    }

    fn input(url: &str) -> Task<String, SearchHit> {
        Task::new(
            "query".into(),
            SearchHit {
                url: url.into(),
                title: "title".into(),
                snippet: "snippet".into(),
            },
        )
    }

    #[tokio::test]
    async fn completed_crawl_is_summarized() {
        let service = ScriptedService::new(
            true,
            vec![CrawlPoll::Completed {
                content: "long page text".into(),
            }],
        );
        let summary = format!("{SUMMARY_PREAMBLE}\nA short summary.");
        let stage = stage(service, &summary);

        let outputs = stage.process(0, input("https://example.com/a")).await.unwrap();
        assert_eq!(outputs.len(), 1);
        let report = &outputs[0].payload;
        assert_eq!(report.status, CrawlStatus::Success);
        assert_eq!(report.content, "A short summary.");
        assert_eq!(outputs[0].origin, "query");
    }

    #[tokio::test]
    async fn pending_forever_times_out_as_failed() {
        let service = ScriptedService::new(true, Vec::new());
        let stage = stage(service, "unused");

        let outputs = stage.process(0, input("https://example.com/slow")).await.unwrap();
        assert_eq!(outputs[0].payload.status, CrawlStatus::Failed);
    }

    #[tokio::test]
    async fn blocked_domain_never_reaches_the_service() {
        let service = ScriptedService::new(true, Vec::new());
        let stage = stage(service.clone(), "unused");

        let outputs = stage
            .process(0, input("https://www.facebook.com/some-page"))
            .await
            .unwrap();

        assert_eq!(outputs[0].payload.status, CrawlStatus::Blocked);
        assert_eq!(service.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_submission_is_a_failed_report() {
        let service = ScriptedService::new(false, Vec::new());
        let stage = stage(service, "unused");

        let outputs = stage.process(0, input("https://example.com/no")).await.unwrap();
        assert_eq!(outputs[0].payload.status, CrawlStatus::Failed);
    }

    #[tokio::test]
    async fn closed_gate_drops_the_task_silently() {
        struct ClosedGate;
        impl CrawlGate for ClosedGate {
            fn admit(&self, _url: &str) -> bool {
                false
            }
        }

        let service = ScriptedService::new(true, Vec::new());
        let stage = CrawlStage::new(
            service.clone(),
            Arc::new(ScriptedModel {
                response: "unused".into(),
            }),
            Arc::new(ClosedGate),
            StageFanout {
                max_slots: 1,
                max_tasks_per_slot: 1,
            },
            settings(),
            None,
        );

        let outputs = stage.process(0, input("https://example.com/b")).await.unwrap();
        assert!(outputs.is_empty());
        assert_eq!(service.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_poll_is_a_failed_report() {
        let service = ScriptedService::new(true, vec![CrawlPoll::Failed]);
        let stage = stage(service, "unused");

        let outputs = stage.process(0, input("https://example.com/c")).await.unwrap();
        assert_eq!(outputs[0].payload.status, CrawlStatus::Failed);
    }
}
