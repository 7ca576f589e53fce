//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use catalogsync_core::{ProgressReporter, RunServices};
use catalogsync_shared::{
    AppConfig, RunConfig, RunOverrides, RunStats, init_config, load_config, load_config_from,
};
use catalogsync_storage::{DEFAULT_DATASET, Storage};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Durable queue of sitemap documents.
const SITEMAP_QUEUE: &str = "sitemaps";

/// Durable queue of product URLs.
const PRODUCT_QUEUE: &str = "products";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// catalogsync: ingest storefront catalogs through sitemaps and the storefront API.
#[derive(Parser)]
#[command(
    name = "catalogsync",
    version,
    about = "Ingest storefront product catalogs into a local dataset, once per product.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.catalogsync/catalogsync.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

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
    /// Discover, resolve, and store products.
    Run(RunArgs),

    /// Print stored dataset items as JSON lines.
    Export {
        /// Database path (defaults to output.database).
        #[arg(long)]
        database: Option<PathBuf>,

        /// Maximum number of items to print.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments of `catalogsync run`.
#[derive(Args)]
pub(crate) struct RunArgs {
    /// Sitemap or product URL to start from (repeatable).
    #[arg(long = "start-url")]
    pub start_urls: Vec<String>,

    /// Storefront access token.
    #[arg(long, env = "STOREFRONT_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Product request ceiling for this run (0 = unlimited).
    #[arg(long)]
    pub limit: Option<usize>,

    /// Database path (defaults to output.database).
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Keep the request queues of the previous run instead of starting fresh.
    #[arg(long)]
    pub resume: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Load the config file named by `--config`, else the default one.
pub(crate) fn load_app_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags and the `debug_log` setting.
pub(crate) fn init_tracing(cli: &Cli, debug_log: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match (cli.verbose, debug_log) {
        (0, false) => "catalogsync=info",
        (0, true) | (1, _) => "catalogsync=debug",
        _ => "catalogsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(&config, args).await,
        Command::Export { database, limit } => cmd_export(&config, database, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, args: RunArgs) -> Result<()> {
    let overrides = RunOverrides {
        start_urls: args.start_urls,
        access_token: args.access_token,
        max_requests_per_crawl: args.limit,
        database: args.database,
    };
    // Configuration failures surface here, before any network activity.
    let run_config = RunConfig::resolve(config, &overrides)?;

    let storage = Arc::new(Storage::open(&run_config.database).await?);
    if !args.resume {
        for queue in [SITEMAP_QUEUE, PRODUCT_QUEUE] {
            let purged = storage.purge_queue(queue).await?;
            if purged > 0 {
                info!(queue, purged, "cleared request queue of previous run");
            }
        }
    }

    let services = RunServices {
        sitemaps: Arc::new(storage.queue(SITEMAP_QUEUE).await?),
        products: Arc::new(storage.queue(PRODUCT_QUEUE).await?),
        store: storage.clone(),
        sink: storage.clone(),
    };

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight batches");
            token.cancel();
        }
    });

    info!(
        database = %run_config.database.display(),
        start_urls = run_config.start_urls.len(),
        resume = args.resume,
        "starting catalog run"
    );

    let reporter = CliProgress::new();
    let stats = catalogsync_core::run(&run_config, services, cancel, &reporter).await?;

    // Print summary
    println!();
    println!("  Catalog run complete.");
    println!("  Product URLs:   {}", stats.count);
    println!("  Sitemaps:       {}", stats.sitemaps_fetched);
    println!(
        "  Batches:        {} ok, {} failed",
        stats.batches_succeeded, stats.batches_failed
    );
    println!("  Items emitted:  {}", stats.items_emitted);
    println!("  Already seen:   {}", stats.items_skipped);
    if stats.requests_failed + stats.transform_failures > 0 {
        println!(
            "  Failures:       {} requests, {} transforms",
            stats.requests_failed, stats.transform_failures
        );
    }
    if stats.items_dropped > 0 {
        println!(
            "  Write failures: {} records, left for the next run",
            stats.items_dropped
        );
    }
    println!("  Database:       {}", run_config.database.display());
    println!();

    Ok(())
}

async fn cmd_export(
    config: &AppConfig,
    database: Option<PathBuf>,
    limit: Option<usize>,
) -> Result<()> {
    let path = database.unwrap_or_else(|| PathBuf::from(&config.output.database));
    let storage = Storage::open_readonly(&path).await?;

    let items = storage.list_items(DEFAULT_DATASET, limit).await?;
    for item in &items {
        let line = serde_json::to_string(item)
            .map_err(|e| eyre!("failed to serialize item: {e}"))?;
        println!("{line}");
    }
    info!(count = items.len(), path = %path.display(), "exported dataset items");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn product_handled(&self, url: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Queueing [{current}/{total}] {url}"));
    }

    fn done(&self, _stats: &RunStats) {
        self.spinner.finish_and_clear();
    }
}
