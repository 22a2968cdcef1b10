//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tracing::info;

use flywheel_core::Pipeline;
use flywheel_index::{HttpEmbedder, SimilarityFilter};
use flywheel_shared::{AppConfig, init_config, load_config, load_config_from, validate_config};
use flywheel_stages::{
    HttpCrawlService, HttpLanguageModel, HttpProxyControl, HttpSearchEngine, NullProxyControl,
    ProxyControl,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Flywheel — grow a web corpus from a handful of seed documents.
#[derive(Parser)]
#[command(
    name = "flywheel",
    version,
    about = "Recursively collect and summarize web content from seed documents.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline on seed documents until quiescence.
    Run {
        /// Seed document files, one document per file.
        #[arg(required = true)]
        seeds: Vec<PathBuf>,

        /// Config file path (defaults to ~/.flywheel/flywheel.toml).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the crawled-URLs cap for this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Write the full run summary as JSON to this file.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Skip outbound identity rotation (no proxy sidecar).
        #[arg(long)]
        no_proxy: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "flywheel=info",
        1 => "flywheel=debug",
        _ => "flywheel=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            seeds,
            config,
            limit,
            out,
            no_proxy,
        } => cmd_run(&seeds, config.as_deref(), limit, out.as_deref(), no_proxy).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn cmd_run(
    seeds: &[PathBuf],
    config_path: Option<&Path>,
    limit: Option<usize>,
    out: Option<&Path>,
    no_proxy: bool,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(limit) = limit {
        config.limits.crawled_urls_limit = limit;
    }
    validate_config(&config)?;

    let mut documents = Vec::with_capacity(seeds.len());
    for path in seeds {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre!("cannot read seed file '{}': {e}", path.display()))?;
        if content.trim().is_empty() {
            return Err(eyre!("seed file '{}' is empty", path.display()));
        }
        documents.push(content);
    }

    let data_dir = expand_tilde(&config.limits.data_dir)?;
    std::fs::create_dir_all(&data_dir)
        .map_err(|e| eyre!("cannot create data dir '{}': {e}", data_dir.display()))?;

    // The key is read from the configured env var, never from the config
    // file itself.
    let api_key = std::env::var(&config.llm.api_key_env).ok();
    let llm = Arc::new(HttpLanguageModel::new(
        config.llm.endpoint.clone(),
        config.llm.model.clone(),
        api_key,
    )?);

    let search = Arc::new(HttpSearchEngine::new(config.search.endpoint.clone())?);
    let proxy: Arc<dyn ProxyControl> = if no_proxy {
        Arc::new(NullProxyControl)
    } else {
        Arc::new(HttpProxyControl::new(config.proxy.control_endpoint.clone())?)
    };
    let crawler = Arc::new(HttpCrawlService::new(&config.crawler)?);

    let embedder = Arc::new(HttpEmbedder::new(
        config.filter.embed_endpoint.clone(),
        config.filter.vector_dimension,
    )?);
    let filter = Arc::new(SimilarityFilter::open(
        embedder,
        &config.filter,
        &data_dir.join("index"),
    )?);

    info!(
        seeds = documents.len(),
        limit = config.limits.crawled_urls_limit,
        data_dir = %data_dir.display(),
        "starting run"
    );

    let log_dir = data_dir.join("tasks");
    let pipeline = Pipeline::new(config, llm, search, proxy, crawler, filter, Some(log_dir));
    let summary = pipeline.run(documents).await?;

    println!();
    println!("  Run complete.");
    println!("  Crawled: {}", summary.crawled_urls);
    println!("  Success: {}", summary.succeeded);
    println!("  Failed:  {}", summary.failed);
    println!("  Blocked: {}", summary.blocked);
    println!();

    if let Some(out) = out {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(out, json)
            .map_err(|e| eyre!("cannot write summary to '{}': {e}", out.display()))?;
        println!("  Summary written to {}", out.display());
        println!();
    }

    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

/// Expand a leading `~/` against the user's home directory.
fn expand_tilde(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| eyre!("cannot determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(path))
}
