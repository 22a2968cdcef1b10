//! Pipeline assembly: wiring stages, recursion, and shutdown.
//!
//! The four stages are chained through unbounded queues, each wrapped in its
//! own work distributor. A batching relay sits in front of query generation,
//! and the collector at the tail feeds successful crawl summaries back into
//! the intake queue — the flywheel. Two things end a run: the crawl budget
//! is spent, or the collector sees no report for the idle timeout. Either
//! way the collector drops the intake sender, the relay exits, and closure
//! cascades down the chain until the report queue drains.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, instrument, warn};

use flywheel_index::SimilarityFilter;
use flywheel_scheduler::WorkDistributor;
use flywheel_shared::{AppConfig, CrawlReport, CrawlStatus, Result, Task, TaskLog};
use flywheel_stages::{
    CrawlGate, CrawlService, CrawlSettings, CrawlStage, FilterStage, LanguageModel, ProxyControl,
    QueryGenStage, ScrapeSettings, ScrapeStage, SearchEngine,
};

use crate::batcher::relay_batches;
use crate::budget::CrawlBudget;

/// What a finished run produced.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// URLs admitted to the crawler.
    pub crawled_urls: usize,
    /// Reports with usable summaries.
    pub succeeded: usize,
    /// Crawls that failed or timed out.
    pub failed: usize,
    /// URLs rejected by the domain blocklist.
    pub blocked: usize,
    /// Every report the run emitted, in collection order.
    pub reports: Vec<CrawlReport>,
}

/// The assembled flywheel, ready to run on seed documents.
pub struct Pipeline {
    config: AppConfig,
    llm: Arc<dyn LanguageModel>,
    search: Arc<dyn SearchEngine>,
    proxy: Arc<dyn ProxyControl>,
    crawler: Arc<dyn CrawlService>,
    filter: Arc<SimilarityFilter>,
    /// Directory for per-stage task logs; `None` disables audit logging.
    log_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchEngine>,
        proxy: Arc<dyn ProxyControl>,
        crawler: Arc<dyn CrawlService>,
        filter: Arc<SimilarityFilter>,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            llm,
            search,
            proxy,
            crawler,
            filter,
            log_dir,
        }
    }

    fn stage_log(&self, name: &str) -> Option<TaskLog> {
        let dir = self.log_dir.as_ref()?;
        match TaskLog::open(dir.join(format!("{name}.json"))) {
            Ok(log) => Some(log),
            Err(error) => {
                warn!(%name, %error, "task log unavailable, stage runs unlogged");
                None
            }
        }
    }

    /// Run the flywheel to quiescence and collect every crawl report.
    #[instrument(skip_all, fields(seeds = seeds.len()))]
    pub async fn run(&self, seeds: Vec<String>) -> Result<RunSummary> {
        let budget = Arc::new(CrawlBudget::new(self.config.limits.crawled_urls_limit));

        let (doc_tx, doc_rx) = mpsc::unbounded_channel::<String>();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Vec<String>>();
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (hit_tx, hit_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        tokio::spawn(relay_batches(doc_rx, batch_tx, self.config.llm.max_batch));

        WorkDistributor::new(
            QueryGenStage::new(
                Arc::clone(&self.llm),
                self.config.stages.query_gen,
                self.config.llm.queries_per_batch,
                self.stage_log("query_gen"),
            ),
            batch_rx,
            query_tx,
        )
        .spawn();

        WorkDistributor::new(
            ScrapeStage::new(
                Arc::clone(&self.search),
                Arc::clone(&self.proxy),
                self.config.stages.scrape,
                ScrapeSettings::from_config(&self.config.search, &self.config.proxy),
                self.stage_log("scrape"),
            ),
            query_rx,
            outcome_tx,
        )
        .spawn();

        WorkDistributor::new(
            FilterStage::new(
                Arc::clone(&self.filter),
                self.config.stages.filter,
                self.stage_log("filter"),
            ),
            outcome_rx,
            hit_tx,
        )
        .spawn();

        WorkDistributor::new(
            CrawlStage::new(
                Arc::clone(&self.crawler),
                Arc::clone(&self.llm),
                Arc::clone(&budget) as Arc<dyn CrawlGate>,
                self.config.stages.crawl,
                CrawlSettings::from_config(&self.config.crawler),
                self.stage_log("crawl"),
            ),
            hit_rx,
            report_tx,
        )
        .spawn();

        for seed in seeds {
            // Send only fails if the relay died, which means the run is
            // already shutting down.
            let _ = doc_tx.send(seed);
        }

        let summary = collect(
            report_rx,
            doc_tx,
            Arc::clone(&budget),
            Duration::from_secs(self.config.limits.idle_timeout_secs),
        )
        .await;

        info!(
            crawled = summary.crawled_urls,
            succeeded = summary.succeeded,
            failed = summary.failed,
            blocked = summary.blocked,
            indexed = self.filter.indexed_count().await,
            "run complete"
        );
        Ok(summary)
    }
}

/// Tail collector: gather reports, re-inject successful summaries, and
/// decide when the run is over.
///
/// Holding `intake` keeps the whole pipeline alive; dropping it starts the
/// shutdown cascade. It is dropped when the crawl budget is spent or when no
/// report arrives within `idle_timeout`. Collection continues after the drop
/// until the report queue closes, so in-flight work is never lost.
async fn collect(
    mut reports: UnboundedReceiver<Task<String, CrawlReport>>,
    intake: UnboundedSender<String>,
    budget: Arc<CrawlBudget>,
    idle_timeout: Duration,
) -> RunSummary {
    let mut intake = Some(intake);
    let mut summary = RunSummary {
        crawled_urls: 0,
        succeeded: 0,
        failed: 0,
        blocked: 0,
        reports: Vec::new(),
    };

    loop {
        let task = match tokio::time::timeout(idle_timeout, reports.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(_) => {
                if intake.take().is_some() {
                    info!("no report within idle timeout, closing intake");
                }
                continue;
            }
        };

        let report = task.payload;
        match report.status {
            CrawlStatus::Success => summary.succeeded += 1,
            CrawlStatus::Failed => summary.failed += 1,
            CrawlStatus::Blocked => summary.blocked += 1,
        }

        if report.is_success() {
            if budget.is_exhausted() {
                if intake.take().is_some() {
                    info!("crawl budget spent, closing intake");
                }
            } else if let Some(tx) = &intake {
                let _ = tx.send(report.content.clone());
            }
        }

        summary.reports.push(report);
    }

    summary.crawled_urls = budget.crawled_count();
    summary
}
