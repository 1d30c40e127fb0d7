//! Core domain types for feedwatch runs and articles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FeedwatchError, Result};

/// Smallest accepted lookback window in days.
pub const MIN_LOOKBACK_DAYS: u32 = 1;

/// Largest accepted lookback window in days.
pub const MAX_LOOKBACK_DAYS: u32 = 365;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// Monotonically increasing identifier assigned to each started run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A pipeline stage. Before the first run there is no stage at all, which
/// is how the idle state is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Scrape,
    Confirm,
    Summarize,
    Skipped,
    Embed,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Scrape => "scrape",
            Self::Confirm => "confirm",
            Self::Summarize => "summarize",
            Self::Skipped => "skipped",
            Self::Embed => "embed",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Position in the fixed stage order. `Summarize` and `Skipped` are the
    /// two branches of the same slot.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Fetch => 1,
            Self::Scrape => 2,
            Self::Confirm => 3,
            Self::Summarize | Self::Skipped => 4,
            Self::Embed => 5,
            Self::Done | Self::Error => 6,
        }
    }

    /// `Done` and `Error` end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run requests and outcomes
// ---------------------------------------------------------------------------

/// Parameters of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// How far back to accept feed entries, in days (1..=365).
    pub lookback_days: u32,
    /// Only accept entries newer than each source's last successful fetch.
    pub since_last_fetch: bool,
}

impl RefreshRequest {
    /// Build a request, rejecting a lookback outside `1..=365`.
    pub fn new(lookback_days: u32, since_last_fetch: bool) -> Result<Self> {
        if !(MIN_LOOKBACK_DAYS..=MAX_LOOKBACK_DAYS).contains(&lookback_days) {
            return Err(FeedwatchError::validation(format!(
                "lookback_days must be between {MIN_LOOKBACK_DAYS} and {MAX_LOOKBACK_DAYS}, got {lookback_days}"
            )));
        }
        Ok(Self {
            lookback_days,
            since_last_fetch,
        })
    }

    /// Build a request from untrusted input, clamping the lookback into range.
    pub fn clamped(lookback_days: i64, since_last_fetch: bool) -> Self {
        let days = lookback_days.clamp(MIN_LOOKBACK_DAYS as i64, MAX_LOOKBACK_DAYS as i64);
        Self {
            lookback_days: days as u32,
            since_last_fetch,
        }
    }
}

impl Default for RefreshRequest {
    fn default() -> Self {
        Self {
            lookback_days: MIN_LOOKBACK_DAYS,
            since_last_fetch: false,
        }
    }
}

/// Result of a trigger attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    /// `false` iff another run already held the gate.
    pub started: bool,
    /// Identifier of the run that was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl TriggerOutcome {
    pub fn started(run_id: RunId) -> Self {
        Self {
            started: true,
            run_id: Some(run_id),
        }
    }

    pub fn already_running() -> Self {
        Self {
            started: false,
            run_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cost checkpoint
// ---------------------------------------------------------------------------

/// Pre-enrichment cost estimate awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Run the estimate belongs to.
    pub run_id: RunId,
    /// Items waiting for summarization.
    pub pending_item_count: usize,
    /// Estimated spend in USD (deliberately inflated).
    pub estimated_cost: f64,
    /// Model the estimate was priced against.
    pub model: String,
}

/// Human decision on a [`CostEstimate`]. "No decision" is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostDecision {
    Approved,
    Declined,
}

/// What happened to an approve/decline call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The decision reached the waiting run.
    Accepted,
    /// No run is waiting in `confirm`.
    NoPendingDecision,
    /// The decision was addressed to a run other than the one waiting.
    StaleRun,
}

/// Spend actually incurred by the summarize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualCost {
    /// Run the report belongs to.
    pub run_id: RunId,
    /// Items processed by the summarize stage.
    pub item_count: usize,
    /// Spend in USD computed from the token delta.
    pub actual_cost: f64,
    /// Model the spend was priced against.
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Snapshot returned by the controller's status read path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub is_refreshing: bool,
    pub stage: Option<Stage>,
    pub run_id: Option<RunId>,
    pub cost_estimate: Option<CostEstimate>,
    pub actual_cost: Option<ActualCost>,
}

// ---------------------------------------------------------------------------
// Articles
// ---------------------------------------------------------------------------

/// A feed entry ready to be stored as a new article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewArticle {
    pub source_id: i64,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// An article that still needs its body scraped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnscrapedArticle {
    pub id: String,
    pub url: String,
}

/// An article with scraped content and no summary yet.
#[derive(Debug, Clone)]
pub struct PendingSummary {
    pub id: String,
    pub title: String,
    pub url: String,
    pub content: String,
}

/// A summarized article that has no embedding yet.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub id: String,
    pub title: String,
    pub summary: String,
}

/// Aggregate article counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleStats {
    pub sources: usize,
    pub articles: usize,
    pub scraped: usize,
    pub scrape_failed: usize,
    pub summarized: usize,
    pub embedded: usize,
}
