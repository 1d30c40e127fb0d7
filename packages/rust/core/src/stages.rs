//! Collaborator seams consumed by the pipeline controller.
//!
//! The controller treats every stage as an opaque batch function. Each trait
//! is object-safe so the controller can hold `Arc<dyn ...>` handles and tests
//! can swap in scripted fakes.

use std::sync::Arc;

use async_trait::async_trait;
use feedwatch_shared::Result;

/// Removes items the later stages can never process.
#[async_trait]
pub trait Cleanup: Send + Sync {
    /// Returns the number of items removed.
    async fn remove_unprocessable(&self) -> Result<usize>;
}

/// One source of new items, invoked once per run.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Pull new items and return how many were stored.
    async fn fetch(&self, lookback_days: u32, since_last_fetch: bool) -> Result<usize>;
}

/// Screens candidate titles before a source stores them.
///
/// Classification never fails the fetch: a filter that cannot decide
/// accepts.
#[async_trait]
pub trait RelevanceFilter: Send + Sync {
    /// One verdict per title, in order.
    async fn classify(&self, titles: &[String]) -> Vec<bool>;
}

/// Filter that keeps everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl RelevanceFilter for AcceptAll {
    async fn classify(&self, titles: &[String]) -> Vec<bool> {
        vec![true; titles.len()]
    }
}

/// Fills in item bodies. Returns 0 once nothing is left.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn process_batch(&self, limit: usize) -> Result<usize>;
}

/// The cost-gated enrichment stage.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Items waiting for enrichment.
    async fn count_pending(&self) -> Result<usize>;

    /// Enrich up to `limit` items. Returns 0 once nothing is left.
    async fn process_batch(&self, limit: usize) -> Result<usize>;
}

/// Computes vectors for enriched items. Returns 0 once nothing is left.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn process_batch(&self, limit: usize) -> Result<usize>;
}

/// What the controller needs to know about the LLM provider.
pub trait ProviderInfo: Send + Sync {
    fn has_api_key(&self) -> bool;

    /// Model that estimates and actual costs are priced against.
    fn model_name(&self) -> String;
}

/// Everything a run calls, bundled for the controller.
#[derive(Clone)]
pub struct PipelineStages {
    pub cleanup: Arc<dyn Cleanup>,
    pub sources: Vec<Arc<dyn FeedSource>>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub enricher: Arc<dyn Enricher>,
    pub embedder: Arc<dyn Embedder>,
    pub provider: Arc<dyn ProviderInfo>,
}
