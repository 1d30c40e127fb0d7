//! Application configuration for feedwatch.
//!
//! User config lives at `~/.feedwatch/feedwatch.toml`.
//! CLI flags override config file values, which override defaults.
//! API keys are never stored in the file; the config only names the
//! environment variables that hold them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FeedwatchError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "feedwatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".feedwatch";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "feedwatch.db";

// ---------------------------------------------------------------------------
// Config structs (matching feedwatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Periodic refresh settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Pipeline batch sizes and the approval bound.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Malpedia bibliography source.
    #[serde(default)]
    pub malpedia: MalpediaConfig,

    /// Feeds to poll.
    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            schedule: ScheduleConfig::default(),
            pipeline: PipelineSettings::default(),
            storage: StorageConfig::default(),
            malpedia: MalpediaConfig::default(),
            feeds: default_feeds(),
        }
    }
}

/// Which LLM vendor answers enrichment calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Anthropic,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Active provider.
    #[serde(default)]
    pub provider: LlmProvider,

    /// Chat model used with the OpenAI provider.
    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    /// Chat model used with the Anthropic provider.
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,

    /// Name of the env var holding the OpenAI key.
    #[serde(default = "default_openai_key_env")]
    pub openai_api_key_env: String,

    /// Name of the env var holding the Anthropic key.
    #[serde(default = "default_anthropic_key_env")]
    pub anthropic_api_key_env: String,

    /// Override for the provider's API base URL (proxies, tests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Embedding model (always served by the OpenAI-compatible endpoint).
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Upper bound on concurrent LLM calls inside one summarize batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Screen new titles with the chat model before storing them.
    #[serde(default = "default_true")]
    pub relevance_filter: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            openai_api_key_env: default_openai_key_env(),
            anthropic_api_key_env: default_anthropic_key_env(),
            base_url: None,
            embedding_model: default_embedding_model(),
            max_concurrency: default_max_concurrency(),
            relevance_filter: true,
        }
    }
}

impl LlmConfig {
    /// Model name for the active provider.
    pub fn active_model(&self) -> &str {
        match self.provider {
            LlmProvider::OpenAi => &self.openai_model,
            LlmProvider::Anthropic => &self.anthropic_model,
        }
    }

    /// Env var name for the active provider's key.
    pub fn active_key_env(&self) -> &str {
        match self.provider {
            LlmProvider::OpenAi => &self.openai_api_key_env,
            LlmProvider::Anthropic => &self.anthropic_api_key_env,
        }
    }

    /// The active provider's key, if its env var is set and non-blank.
    pub fn api_key(&self) -> Option<String> {
        read_key(self.active_key_env())
    }

    /// The OpenAI key, used for embeddings regardless of chat provider.
    pub fn openai_api_key(&self) -> Option<String> {
        read_key(&self.openai_api_key_env)
    }
}

fn read_key(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_openai_model() -> String {
    "gpt-4o-mini".into()
}
fn default_anthropic_model() -> String {
    "claude-3-5-haiku-20241022".into()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_max_concurrency() -> usize {
    5
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Minutes between scheduled refreshes.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_minutes: u64,

    /// Lookback used by scheduled refreshes.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Whether scheduled refreshes only take entries since the last fetch.
    #[serde(default)]
    pub since_last_fetch: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fetch_interval_minutes: default_fetch_interval(),
            lookback_days: default_lookback_days(),
            since_last_fetch: false,
        }
    }
}

fn default_fetch_interval() -> u64 {
    30
}
fn default_lookback_days() -> u32 {
    1
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Seconds to wait for an approve/decline before proceeding anyway.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,

    #[serde(default = "default_scrape_batch")]
    pub scrape_batch_size: usize,

    #[serde(default = "default_summarize_batch")]
    pub summarize_batch_size: usize,

    #[serde(default = "default_embed_batch")]
    pub embed_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout(),
            scrape_batch_size: default_scrape_batch(),
            summarize_batch_size: default_summarize_batch(),
            embed_batch_size: default_embed_batch(),
        }
    }
}

fn default_approval_timeout() -> u64 {
    300
}
fn default_scrape_batch() -> usize {
    10
}
fn default_summarize_batch() -> usize {
    10
}
fn default_embed_batch() -> usize {
    50
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; defaults to `~/.feedwatch/feedwatch.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

/// `[malpedia]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalpediaConfig {
    /// Skipped entirely when false; also skipped while the key is unset.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the env var holding the Malpedia API token.
    #[serde(default = "default_malpedia_key_env")]
    pub api_key_env: String,

    /// Service root; the bibliography lives at `{base_url}/api/get/bib`.
    #[serde(default = "default_malpedia_base_url")]
    pub base_url: String,
}

impl Default for MalpediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: default_malpedia_key_env(),
            base_url: default_malpedia_base_url(),
        }
    }
}

impl MalpediaConfig {
    /// The API token, if its env var is set and non-blank.
    pub fn api_key(&self) -> Option<String> {
        read_key(&self.api_key_env)
    }
}

fn default_malpedia_key_env() -> String {
    "MALPEDIA_API_KEY".into()
}
fn default_malpedia_base_url() -> String {
    "https://malpedia.caad.fkie.fraunhofer.de".into()
}

/// `[[feeds]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Human-readable source name.
    pub name: String,
    /// RSS or Atom URL.
    pub url: String,
    /// Disabled feeds are kept in config but never polled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn feed(name: &str, url: &str, enabled: bool) -> FeedConfig {
    FeedConfig {
        name: name.into(),
        url: url.into(),
        enabled,
    }
}

fn default_feeds() -> Vec<FeedConfig> {
    vec![
        feed("The Hacker News", "https://feeds.feedburner.com/TheHackersNews", true),
        feed("BleepingComputer", "https://www.bleepingcomputer.com/feed/", true),
        feed("Krebs on Security", "https://krebsonsecurity.com/feed/", true),
        feed("SecurityWeek", "https://feeds.feedburner.com/securityweek", true),
        feed("Dark Reading", "https://www.darkreading.com/rss.xml", true),
        feed("CISA Alerts", "https://www.cisa.gov/cybersecurity-advisories/all.xml", true),
        feed("Sophos News", "https://news.sophos.com/en-us/feed/", true),
        feed("Infosecurity Magazine", "https://www.infosecurity-magazine.com/rss/news/", true),
        feed("HackRead", "https://hackread.com/feed/", true),
        feed("SC Media", "https://www.scworld.com/rss", true),
        feed("Cyber Defense Magazine", "https://www.cyberdefensemagazine.com/feed/", false),
        feed("The Record", "https://therecord.media/feed", true),
        feed("Schneier on Security", "https://www.schneier.com/feed/atom/", true),
    ]
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, derived from the file config)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bound on the wait in `confirm`.
    pub approval_timeout: Duration,
    pub scrape_batch_size: usize,
    pub summarize_batch_size: usize,
    pub embed_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            approval_timeout: Duration::from_secs(p.approval_timeout_secs),
            scrape_batch_size: p.scrape_batch_size.max(1),
            summarize_batch_size: p.summarize_batch_size.max(1),
            embed_batch_size: p.embed_batch_size.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.feedwatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FeedwatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.feedwatch/feedwatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path: explicit setting or the default location.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.storage.database_path {
        Some(path) => Ok(path.clone()),
        None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
    }
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
    let content = std::fs::read_to_string(path).map_err(|e| FeedwatchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        FeedwatchError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FeedwatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FeedwatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FeedwatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject feeds that are not plain http(s) URLs and nonsensical schedules.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for feed in &config.feeds {
        let parsed = Url::parse(&feed.url).map_err(|e| {
            FeedwatchError::validation(format!("feed '{}' has an invalid URL: {e}", feed.name))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FeedwatchError::validation(format!(
                "feed '{}' must use http or https, got {}",
                feed.name,
                parsed.scheme()
            )));
        }
    }

    if Url::parse(&config.malpedia.base_url).is_err() {
        return Err(FeedwatchError::validation(format!(
            "malpedia.base_url is not a valid URL: {}",
            config.malpedia.base_url
        )));
    }

    if config.schedule.fetch_interval_minutes == 0 {
        return Err(FeedwatchError::config(
            "schedule.fetch_interval_minutes must be at least 1",
        ));
    }

    Ok(())
}

/// Check that the active provider's API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    match config.llm.api_key() {
        Some(_) => Ok(()),
        None => Err(FeedwatchError::config(format!(
            "LLM API key not found. Set the {} environment variable.",
            config.llm.active_key_env()
        ))),
    }
}
