//! Application configuration for the flywheel pipeline.
//!
//! User config lives at `~/.flywheel/flywheel.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlywheelError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "flywheel.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".flywheel";

// ---------------------------------------------------------------------------
// Config structs (matching flywheel.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run-wide limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Language-model collaborator settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Search-engine collaborator settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Anonymizing-proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Similarity-gated filter settings.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Crawl-service collaborator settings.
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Per-stage scheduler fan-out.
    #[serde(default)]
    pub stages: StagesConfig,
}

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap on crawled URLs; recursion halts once reached.
    #[serde(default = "default_crawled_urls_limit")]
    pub crawled_urls_limit: usize,

    /// Seconds of collector silence after which the run is considered
    /// quiescent and shut down. Must cover `crawler.poll_timeout_secs`, or a
    /// single slow crawl would end re-injection mid-run.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Directory for task logs and index checkpoints.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            crawled_urls_limit: default_crawled_urls_limit(),
            idle_timeout_secs: default_idle_timeout_secs(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_crawled_urls_limit() -> usize {
    100
}
fn default_idle_timeout_secs() -> u64 {
    330
}
fn default_data_dir() -> String {
    "~/.flywheel/data".into()
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Chat-completions endpoint of the model server.
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with each request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Number of queries requested per generation batch.
    #[serde(default = "default_queries_per_batch")]
    pub queries_per_batch: usize,

    /// Maximum seed documents folded into one model call.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            queries_per_batch: default_queries_per_batch(),
            max_batch: default_max_batch(),
        }
    }
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:8000/v1/chat/completions".into()
}
fn default_api_key_env() -> String {
    "FLYWHEEL_LLM_API_KEY".into()
}
fn default_model() -> String {
    "meta-llama/Llama-3.1-8B-Instruct".into()
}
fn default_queries_per_batch() -> usize {
    25
}
fn default_max_batch() -> usize {
    30
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search endpoint scraped for results.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Results requested per query.
    #[serde(default = "default_url_limit")]
    pub url_limit: usize,

    /// Retry attempts per query before emitting a failure task.
    #[serde(default = "default_max_request_retries")]
    pub max_request_retries: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            url_limit: default_url_limit(),
            max_request_retries: default_max_request_retries(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://www.google.com/search".into()
}
fn default_url_limit() -> usize {
    10
}
fn default_max_request_retries() -> usize {
    2
}

/// `[proxy]` section. Ranges are `[low, high]` pairs sampled per slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy control endpoint (identity renewal).
    #[serde(default = "default_proxy_control")]
    pub control_endpoint: String,

    /// Fetches allowed per identity before a proactive renewal.
    #[serde(default = "default_fetches_per_identity")]
    pub fetches_per_identity: [u64; 2],

    /// Seconds slept between consecutive fetches.
    #[serde(default = "default_wait_between_fetches")]
    pub wait_between_fetches_secs: [u64; 2],

    /// Seconds slept around an identity renewal.
    #[serde(default = "default_wait_after_renewal")]
    pub wait_after_renewal_secs: [u64; 2],
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            control_endpoint: default_proxy_control(),
            fetches_per_identity: default_fetches_per_identity(),
            wait_between_fetches_secs: default_wait_between_fetches(),
            wait_after_renewal_secs: default_wait_after_renewal(),
        }
    }
}

fn default_proxy_control() -> String {
    "http://127.0.0.1:9051/renew".into()
}
fn default_fetches_per_identity() -> [u64; 2] {
    [10, 20]
}
fn default_wait_between_fetches() -> [u64; 2] {
    [15, 20]
}
fn default_wait_after_renewal() -> [u64; 2] {
    [40, 100]
}

/// `[filter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Embedding service endpoint.
    #[serde(default = "default_embed_endpoint")]
    pub embed_endpoint: String,

    /// Embedding dimensionality.
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: usize,

    /// Neighbors consulted per index (k).
    #[serde(default = "default_nearest_neighbors")]
    pub nearest_neighbors: usize,

    /// Admission threshold on the averaged similarity score.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f32,

    /// Scores at or above this are treated as near-exact duplicates and
    /// rejected even though they pass the relevance gate.
    #[serde(default = "default_duplicate_cutoff")]
    pub duplicate_cutoff: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            embed_endpoint: default_embed_endpoint(),
            vector_dimension: default_vector_dimension(),
            nearest_neighbors: default_nearest_neighbors(),
            accept_threshold: default_accept_threshold(),
            duplicate_cutoff: default_duplicate_cutoff(),
        }
    }
}

fn default_embed_endpoint() -> String {
    "http://127.0.0.1:5678/encode".into()
}
fn default_vector_dimension() -> usize {
    384
}
fn default_nearest_neighbors() -> usize {
    1
}
fn default_accept_threshold() -> f32 {
    0.5
}
fn default_duplicate_cutoff() -> f32 {
    0.95
}

/// `[crawler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Crawl-submission endpoint.
    #[serde(default = "default_crawl_endpoint")]
    pub crawl_endpoint: String,

    /// Crawl-status endpoint.
    #[serde(default = "default_status_endpoint")]
    pub status_endpoint: String,

    /// Seconds between status polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds after which a pending crawl is declared failed.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Domains rejected without enqueueing a fetch (substring match on host).
    #[serde(default = "default_blocked_domains")]
    pub blocked_domains: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawl_endpoint: default_crawl_endpoint(),
            status_endpoint: default_status_endpoint(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            blocked_domains: default_blocked_domains(),
        }
    }
}

fn default_crawl_endpoint() -> String {
    "http://127.0.0.1:1234/crawl".into()
}
fn default_status_endpoint() -> String {
    "http://127.0.0.1:1234/crawl_status".into()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_poll_timeout_secs() -> u64 {
    300
}
fn default_blocked_domains() -> Vec<String> {
    [
        "facebook",
        "twitter",
        "google",
        "youtube",
        "linkedin",
        "instagram",
        "tiktok",
        "telegram",
        "reddit",
        "x.com",
        "threads.com",
        "pinterest",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Scheduler fan-out for one stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageFanout {
    /// Maximum worker slots (lazy, monotonic).
    pub max_slots: usize,
    /// Credit tokens minted per slot.
    pub max_tasks_per_slot: usize,
}

/// `[stages]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Query generation fan-out.
    #[serde(default = "default_query_gen_fanout")]
    pub query_gen: StageFanout,

    /// Scraper fan-out.
    #[serde(default = "default_scrape_fanout")]
    pub scrape: StageFanout,

    /// Filter fan-out.
    #[serde(default = "default_filter_fanout")]
    pub filter: StageFanout,

    /// Crawler fan-out.
    #[serde(default = "default_crawl_fanout")]
    pub crawl: StageFanout,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            query_gen: default_query_gen_fanout(),
            scrape: default_scrape_fanout(),
            filter: default_filter_fanout(),
            crawl: default_crawl_fanout(),
        }
    }
}

fn default_query_gen_fanout() -> StageFanout {
    StageFanout {
        max_slots: 1,
        max_tasks_per_slot: 1,
    }
}
fn default_scrape_fanout() -> StageFanout {
    StageFanout {
        max_slots: 4,
        max_tasks_per_slot: 4,
    }
}
fn default_filter_fanout() -> StageFanout {
    StageFanout {
        max_slots: 9,
        max_tasks_per_slot: 1,
    }
}
fn default_crawl_fanout() -> StageFanout {
    StageFanout {
        max_slots: 2,
        max_tasks_per_slot: 4,
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.flywheel/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FlywheelError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.flywheel/flywheel.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FlywheelError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| FlywheelError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FlywheelError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FlywheelError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FlywheelError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Validate collaborator endpoints and tunables before the pipeline starts.
///
/// Every failure here is fatal: no stage starts partially configured.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for (name, endpoint) in [
        ("llm.endpoint", &config.llm.endpoint),
        ("search.endpoint", &config.search.endpoint),
        ("filter.embed_endpoint", &config.filter.embed_endpoint),
        ("crawler.crawl_endpoint", &config.crawler.crawl_endpoint),
        ("crawler.status_endpoint", &config.crawler.status_endpoint),
    ] {
        url::Url::parse(endpoint)
            .map_err(|e| FlywheelError::config(format!("{name} is not a valid URL: {e}")))?;
    }

    if config.limits.crawled_urls_limit == 0 {
        return Err(FlywheelError::config("limits.crawled_urls_limit must be > 0"));
    }
    if config.limits.idle_timeout_secs < config.crawler.poll_timeout_secs {
        return Err(FlywheelError::config(
            "limits.idle_timeout_secs must be >= crawler.poll_timeout_secs",
        ));
    }
    if !(0.0..=1.0).contains(&config.filter.accept_threshold) {
        return Err(FlywheelError::config(
            "filter.accept_threshold must be within [0, 1]",
        ));
    }
    if config.filter.duplicate_cutoff < config.filter.accept_threshold {
        return Err(FlywheelError::config(
            "filter.duplicate_cutoff must be >= filter.accept_threshold",
        ));
    }
    if config.filter.nearest_neighbors == 0 {
        return Err(FlywheelError::config("filter.nearest_neighbors must be > 0"));
    }

    for (name, fanout) in [
        ("stages.query_gen", config.stages.query_gen),
        ("stages.scrape", config.stages.scrape),
        ("stages.filter", config.stages.filter),
        ("stages.crawl", config.stages.crawl),
    ] {
        if fanout.max_slots == 0 || fanout.max_tasks_per_slot == 0 {
            return Err(FlywheelError::config(format!(
                "{name}: max_slots and max_tasks_per_slot must be > 0"
            )));
        }
    }

    for (name, range) in [
        ("proxy.fetches_per_identity", config.proxy.fetches_per_identity),
        (
            "proxy.wait_between_fetches_secs",
            config.proxy.wait_between_fetches_secs,
        ),
        (
            "proxy.wait_after_renewal_secs",
            config.proxy.wait_after_renewal_secs,
        ),
    ] {
        if range[0] > range[1] {
            return Err(FlywheelError::config(format!(
                "{name}: range low {} exceeds high {}",
                range[0], range[1]
            )));
        }
    }

    Ok(())
}
