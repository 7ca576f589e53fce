//! Application configuration for catalogsync.
//!
//! User config lives at `~/.catalogsync/catalogsync.toml`.
//! CLI flags override config file values, which override defaults.
//! [`RunConfig::resolve`] merges and validates everything before any network
//! activity begins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::types::parse_date;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "catalogsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".catalogsync";

// ---------------------------------------------------------------------------
// Config structs (matching catalogsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Raise the default log filter to debug.
    #[serde(default)]
    pub debug_log: bool,

    /// Discovery and crawl limits.
    #[serde(default)]
    pub crawl: CrawlSection,

    /// Storefront query API settings.
    #[serde(default)]
    pub storefront: StorefrontSection,

    /// Output buffering and storage.
    #[serde(default)]
    pub output: OutputSection,

    /// Operator-supplied transforms.
    #[serde(default)]
    pub transform: TransformSection,
}

/// A start URL: either a direct URL or a remote list of URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartUrl {
    /// A sitemap URL or a direct product URL.
    Url { url: String },
    /// A plain-text document listing URLs, fetched once.
    RequestsFromUrl { requests_from_url: String },
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    #[serde(default)]
    pub start_urls: Vec<StartUrl>,

    /// Maximum concurrent sitemap fetches.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Product request ceiling; 0 means unlimited.
    #[serde(default)]
    pub max_requests_per_crawl: usize,

    /// Retries for a sitemap fetch before the URL is abandoned.
    #[serde(default = "default_sitemap_retries")]
    pub sitemap_retries: u32,

    /// Per-fetch timeout for sitemap documents.
    #[serde(default = "default_sitemap_timeout_secs")]
    pub sitemap_timeout_secs: u64,

    /// Hard ceiling on sitemap documents fetched per walk.
    #[serde(default = "default_max_sitemap_documents")]
    pub max_sitemap_documents: usize,

    /// Skip product entries whose `lastmod` is older than this date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_since: Option<String>,

    /// Regex a leaf sitemap URL must match to count as a product.
    #[serde(default = "default_product_path_pattern")]
    pub product_path_pattern: String,

    /// Regex a nested sitemap URL must match to be walked.
    #[serde(default = "default_product_sitemap_pattern")]
    pub product_sitemap_pattern: String,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            start_urls: Vec::new(),
            max_concurrency: default_max_concurrency(),
            max_requests_per_crawl: 0,
            sitemap_retries: default_sitemap_retries(),
            sitemap_timeout_secs: default_sitemap_timeout_secs(),
            max_sitemap_documents: default_max_sitemap_documents(),
            updated_since: None,
            product_path_pattern: default_product_path_pattern(),
            product_sitemap_pattern: default_product_sitemap_pattern(),
        }
    }
}

fn default_max_concurrency() -> usize {
    20
}
fn default_sitemap_retries() -> u32 {
    5
}
fn default_sitemap_timeout_secs() -> u64 {
    10
}
fn default_max_sitemap_documents() -> usize {
    1000
}
fn default_product_path_pattern() -> String {
    "/products/".into()
}
fn default_product_sitemap_pattern() -> String {
    r"sitemap_products_\d+".into()
}

/// `[storefront]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorefrontSection {
    /// Storefront API version segment of the endpoint path.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Name of the env var holding the access token (never store the token itself).
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,

    /// Origin used for every batch instead of the product URL's origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_domain: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Debounce interval before a partially filled batch is flushed.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum in-flight batches per origin.
    #[serde(default = "default_per_host_concurrency")]
    pub per_host_concurrency: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries for a batch that failed at the transport level.
    #[serde(default = "default_query_retries")]
    pub max_retries: u32,
}

impl Default for StorefrontSection {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            access_token_env: default_access_token_env(),
            shop_domain: None,
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            per_host_concurrency: default_per_host_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_query_retries(),
        }
    }
}

fn default_api_version() -> String {
    "2024-07".into()
}
fn default_access_token_env() -> String {
    "STOREFRONT_ACCESS_TOKEN".into()
}
fn default_batch_size() -> usize {
    10
}
fn default_flush_interval_ms() -> u64 {
    300
}
fn default_per_host_concurrency() -> usize {
    2
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_query_retries() -> u32 {
    1
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    /// Buffer records and write them in chunks of `buffer_size`.
    #[serde(default = "default_true")]
    pub buffer_writes: bool,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// libSQL database holding the queue, run state, and dataset.
    #[serde(default = "default_database")]
    pub database: String,

    /// Currency used when a variant carries no currency code.
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            buffer_writes: true,
            buffer_size: default_buffer_size(),
            database: default_database(),
            currency: default_currency(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_buffer_size() -> usize {
    100
}
fn default_database() -> String {
    "var/catalogsync.db".into()
}
fn default_currency() -> String {
    "USD".into()
}

/// `[transform]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSection {
    /// Lifecycle hook invoked with `label` = SETUP / FILTER_SITEMAP_URL / RUN / FINISHED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend_scraper_function: Option<String>,

    /// Per-record hook applied after the built-in record mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend_output_function: Option<String>,

    /// Free-form data exposed to transforms as `customData`.
    #[serde(default = "empty_object")]
    pub custom_data: serde_json::Value,
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            extend_scraper_function: None,
            extend_output_function: None,
            custom_data: empty_object(),
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config file + CLI flags, validated)
// ---------------------------------------------------------------------------

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub start_urls: Vec<String>,
    pub access_token: Option<String>,
    pub max_requests_per_crawl: Option<usize>,
    pub database: Option<PathBuf>,
}

/// Storefront query settings, ready for use.
#[derive(Debug, Clone)]
pub struct StorefrontSettings {
    pub api_version: String,
    pub access_token: String,
    pub shop_domain: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub per_host_concurrency: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl StorefrontSettings {
    /// GraphQL endpoint for a batch addressed to `origin`.
    pub fn endpoint_for(&self, origin: &str) -> String {
        let api_origin = match self.shop_domain.as_deref().map(str::trim) {
            Some(domain) if !domain.is_empty() => domain.trim_end_matches('/'),
            _ => origin,
        };
        format!("{api_origin}/api/{}/graphql.json", self.api_version)
    }
}

/// Sitemap walk limits, ready for use.
#[derive(Debug, Clone)]
pub struct WalkSettings {
    pub max_concurrency: usize,
    pub retries: u32,
    pub timeout: Duration,
    pub max_documents: usize,
}

/// Fully merged and validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub start_urls: Vec<StartUrl>,
    pub max_requests_per_crawl: usize,
    pub updated_since: Option<DateTime<Utc>>,
    pub product_path_pattern: Regex,
    pub product_sitemap_pattern: Regex,
    pub walk: WalkSettings,
    pub storefront: StorefrontSettings,
    pub buffer_writes: bool,
    pub buffer_size: usize,
    pub database: PathBuf,
    pub currency: String,
    pub extend_scraper_function: Option<String>,
    pub extend_output_function: Option<String>,
    pub custom_data: serde_json::Value,
    pub debug_log: bool,
}

impl RunConfig {
    /// Merge `config` with `overrides` and validate the result.
    ///
    /// The access token comes from the override, else from the env var named
    /// by `storefront.access_token_env`.
    pub fn resolve(config: &AppConfig, overrides: &RunOverrides) -> Result<Self> {
        let token = overrides
            .access_token
            .clone()
            .or_else(|| std::env::var(&config.storefront.access_token_env).ok());
        Self::resolve_with_token(config, overrides, token)
    }

    /// Like [`RunConfig::resolve`] but with an explicitly supplied token.
    pub fn resolve_with_token(
        config: &AppConfig,
        overrides: &RunOverrides,
        access_token: Option<String>,
    ) -> Result<Self> {
        let mut start_urls = config.crawl.start_urls.clone();
        start_urls.extend(
            overrides
                .start_urls
                .iter()
                .map(|url| StartUrl::Url { url: url.clone() }),
        );
        if start_urls.is_empty() {
            return Err(CatalogError::config("missing start URLs"));
        }

        let access_token = access_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                CatalogError::config(format!(
                    "storefront access token not found. Set the {} environment variable \
                     or pass --access-token",
                    config.storefront.access_token_env
                ))
            })?;

        let sf = &config.storefront;
        if sf.batch_size == 0 {
            return Err(CatalogError::config("storefront.batch_size must be at least 1"));
        }
        if sf.per_host_concurrency == 0 {
            return Err(CatalogError::config(
                "storefront.per_host_concurrency must be at least 1",
            ));
        }
        if config.crawl.max_concurrency == 0 {
            return Err(CatalogError::config("crawl.max_concurrency must be at least 1"));
        }
        if config.output.buffer_size == 0 {
            return Err(CatalogError::config("output.buffer_size must be at least 1"));
        }

        let updated_since = match config.crawl.updated_since.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_date(raw).ok_or_else(|| {
                CatalogError::config(format!("crawl.updated_since is not a date: {raw}"))
            })?),
            _ => None,
        };

        let database = overrides
            .database
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.output.database));

        Ok(Self {
            start_urls,
            max_requests_per_crawl: overrides
                .max_requests_per_crawl
                .unwrap_or(config.crawl.max_requests_per_crawl),
            updated_since,
            product_path_pattern: compile_pattern(
                "crawl.product_path_pattern",
                &config.crawl.product_path_pattern,
            )?,
            product_sitemap_pattern: compile_pattern(
                "crawl.product_sitemap_pattern",
                &config.crawl.product_sitemap_pattern,
            )?,
            walk: WalkSettings {
                max_concurrency: config.crawl.max_concurrency,
                retries: config.crawl.sitemap_retries,
                timeout: Duration::from_secs(config.crawl.sitemap_timeout_secs),
                max_documents: config.crawl.max_sitemap_documents,
            },
            storefront: StorefrontSettings {
                api_version: sf.api_version.clone(),
                access_token,
                shop_domain: sf.shop_domain.clone(),
                batch_size: sf.batch_size,
                flush_interval: Duration::from_millis(sf.flush_interval_ms),
                per_host_concurrency: sf.per_host_concurrency,
                request_timeout: Duration::from_secs(sf.request_timeout_secs),
                max_retries: sf.max_retries,
            },
            buffer_writes: config.output.buffer_writes,
            buffer_size: config.output.buffer_size,
            database,
            currency: config.output.currency.clone(),
            extend_scraper_function: config.transform.extend_scraper_function.clone(),
            extend_output_function: config.transform.extend_output_function.clone(),
            custom_data: config.transform.custom_data.clone(),
            debug_log: config.debug_log,
        })
    }
}

fn compile_pattern(field: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| CatalogError::config(format!("{field} is not a valid regex: {e}")))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.catalogsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CatalogError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.catalogsync/catalogsync.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CatalogError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CatalogError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CatalogError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CatalogError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
