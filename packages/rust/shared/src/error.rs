//! Error types for feedwatch.
//!
//! Library crates use [`FeedwatchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all feedwatch operations.
#[derive(Debug, thiserror::Error)]
pub enum FeedwatchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching feeds or articles.
    #[error("network error: {0}")]
    Network(String),

    /// Feed or HTML parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM provider error (API, rate limit exhaustion, or response decoding).
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (out-of-range argument, bad URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline stage failed in a way the stage itself could not absorb.
    #[error("pipeline stage {stage} failed: {message}")]
    Pipeline { stage: String, message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FeedwatchError>;

impl FeedwatchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a pipeline error tagged with the stage it escaped from.
    pub fn pipeline(stage: impl std::fmt::Display, msg: impl Into<String>) -> Self {
        Self::Pipeline {
            stage: stage.to_string(),
            message: msg.into(),
        }
    }

    /// Whether this error came back from a provider as a rate-limit signal.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Llm(msg) | Self::Network(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("429") || msg.contains("rate limit")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = FeedwatchError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = FeedwatchError::validation("lookback_days 400 out of range");
        assert!(err.to_string().contains("lookback_days 400"));
    }

    #[test]
    fn pipeline_error_carries_stage() {
        let err = FeedwatchError::pipeline("scrape", "storage went away");
        assert_eq!(
            err.to_string(),
            "pipeline stage scrape failed: storage went away"
        );
    }

    #[test]
    fn rate_limit_detection() {
        assert!(FeedwatchError::Llm("HTTP 429 Too Many Requests".into()).is_rate_limited());
        assert!(FeedwatchError::Llm("Rate limit reached for model".into()).is_rate_limited());
        assert!(!FeedwatchError::Llm("HTTP 500".into()).is_rate_limited());
        assert!(!FeedwatchError::Storage("429".into()).is_rate_limited());
    }
}
