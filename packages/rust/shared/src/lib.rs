//! Shared types, error model, and configuration for feedwatch.
//!
//! This crate is the foundation depended on by all other feedwatch crates.
//! It provides:
//! - [`FeedwatchError`] — the unified error type
//! - Run and article types ([`Stage`], [`CostEstimate`], [`RefreshStatus`], ...)
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)
//! - URL helpers ([`is_file_url`])

pub mod config;
pub mod error;
pub mod types;
pub mod urls;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, FeedConfig, LlmConfig, LlmProvider, MalpediaConfig, PipelineConfig,
    PipelineSettings, ScheduleConfig, StorageConfig, config_dir, config_file_path, database_path,
    init_config, load_config, load_config_from, validate_api_key, validate_config,
};
pub use error::{FeedwatchError, Result};
pub use types::{
    ActualCost, ArticleStats, CostDecision, CostEstimate, DecisionOutcome, MAX_LOOKBACK_DAYS,
    MIN_LOOKBACK_DAYS, NewArticle, PendingEmbedding, PendingSummary, RefreshRequest,
    RefreshStatus, RunId, Stage, TriggerOutcome, UnscrapedArticle,
};
pub use urls::is_file_url;
