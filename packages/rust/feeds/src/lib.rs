//! Article sources: RSS/Atom feeds and the Malpedia bibliography.
//!
//! [`FeedFetcher`] downloads every enabled feed from the configuration,
//! keeps the entries newer than the run's cutoff, and stores the new ones as
//! articles. One `fetch` call covers all feeds, and a feed that fails to
//! download or parse is logged and skipped. [`MalpediaFetcher`] does the same
//! for the Malpedia BibTeX library.
//!
//! Both sources pass the titles of unseen entries through a
//! [`RelevanceFilter`] before storing them.

mod malpedia;
mod parser;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedwatch_core::{AcceptAll, FeedSource, RelevanceFilter};
use feedwatch_shared::{FeedConfig, FeedwatchError, NewArticle, Result, is_file_url};
use feedwatch_storage::Storage;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

pub use malpedia::{BibEntry, MalpediaFetcher, MalpediaReport, parse_bibtex};
pub use parser::{FeedEntry, parse_date, parse_feed};

/// Maximum number of redirects to follow when fetching a feed.
const MAX_REDIRECTS: usize = 5;

/// Default timeout in seconds for one feed download.
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Maximum feed size we accept (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// Feed-reader User-Agent; browser UAs tend to trip WAF challenges on feed endpoints.
const USER_AGENT: &str = concat!("feedwatch/", env!("CARGO_PKG_VERSION"), " (feed reader)");

const ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml, text/xml, */*;q=0.8";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// HTTP settings for feed downloads.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Timeout for one feed download in seconds.
    pub timeout_secs: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Per-feed outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub new_articles: usize,
    pub skipped_old: usize,
    pub skipped_files: usize,
    pub skipped_irrelevant: usize,
}

// ---------------------------------------------------------------------------
// FeedFetcher
// ---------------------------------------------------------------------------

/// Fetches all enabled feeds into storage.
pub struct FeedFetcher {
    client: Client,
    storage: Arc<Storage>,
    feeds: Vec<FeedConfig>,
    relevance: Arc<dyn RelevanceFilter>,
}

impl FeedFetcher {
    pub fn new(storage: Arc<Storage>, feeds: Vec<FeedConfig>) -> Result<Self> {
        Self::with_options(storage, feeds, &FetchOptions::default())
    }

    pub fn with_options(
        storage: Arc<Storage>,
        feeds: Vec<FeedConfig>,
        opts: &FetchOptions,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(opts)?,
            storage,
            feeds,
            relevance: Arc::new(AcceptAll),
        })
    }

    /// Screen new titles with `filter` before storing them.
    pub fn with_relevance(mut self, filter: Arc<dyn RelevanceFilter>) -> Self {
        self.relevance = filter;
        self
    }

    /// Fetch one feed and store its new entries.
    #[instrument(skip_all, fields(feed = %feed.name))]
    pub async fn fetch_feed(
        &self,
        feed: &FeedConfig,
        lookback_days: u32,
        since_last_fetch: bool,
    ) -> Result<FeedReport> {
        let source_id = self.storage.upsert_source(&feed.name, &feed.url).await?;
        let last_fetched = self.storage.source_last_fetched(source_id).await?;
        let cutoff = cutoff(lookback_days, since_last_fetch, last_fetched);

        let body = download(&self.client, &feed.url).await?;
        let entries = parse_feed(&body)?;
        debug!(entries = entries.len(), %cutoff, "feed parsed");

        let mut report = FeedReport::default();
        let mut candidates = Vec::new();
        for entry in entries {
            if is_file_url(&entry.link) {
                report.skipped_files += 1;
                continue;
            }
            match entry.published {
                Some(published) if published < cutoff => {
                    report.skipped_old += 1;
                    continue;
                }
                // Undated entries are only trusted on a source's first fetch.
                None if last_fetched.is_some() => {
                    report.skipped_old += 1;
                    continue;
                }
                _ => {}
            }
            if self.storage.article_exists(&entry.link).await? {
                continue;
            }

            candidates.push(NewArticle {
                source_id,
                title: entry.title,
                url: entry.link,
                author: entry.author,
                published_at: entry.published,
            });
        }

        let (inserted, rejected) =
            store_relevant(&self.storage, self.relevance.as_ref(), candidates).await?;
        report.new_articles = inserted;
        report.skipped_irrelevant = rejected;

        self.storage.mark_source_fetched(source_id, Utc::now()).await?;
        info!(
            new = report.new_articles,
            old = report.skipped_old,
            files = report.skipped_files,
            irrelevant = report.skipped_irrelevant,
            "feed fetched"
        );
        Ok(report)
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    fn name(&self) -> &str {
        "rss"
    }

    async fn fetch(&self, lookback_days: u32, since_last_fetch: bool) -> Result<usize> {
        let mut total = 0;
        for feed in self.feeds.iter().filter(|f| f.enabled) {
            match self.fetch_feed(feed, lookback_days, since_last_fetch).await {
                Ok(report) => total += report.new_articles,
                Err(e) => warn!(feed = %feed.name, error = %e, "feed fetch failed, skipping"),
            }
        }
        info!(total, "all feeds fetched");
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Classify candidate titles and store the ones `filter` keeps.
/// Returns `(inserted, rejected)`.
async fn store_relevant(
    storage: &Storage,
    filter: &dyn RelevanceFilter,
    candidates: Vec<NewArticle>,
) -> Result<(usize, usize)> {
    if candidates.is_empty() {
        return Ok((0, 0));
    }
    let titles: Vec<String> = candidates.iter().map(|c| c.title.clone()).collect();
    let verdicts = filter.classify(&titles).await;

    let mut inserted = 0;
    let mut rejected = 0;
    // A verdict list shorter than the candidates keeps the remainder.
    let verdicts = verdicts.into_iter().chain(std::iter::repeat(true));
    for (article, keep) in candidates.iter().zip(verdicts) {
        if !keep {
            rejected += 1;
            continue;
        }
        if storage.insert_article_if_new(article).await? {
            inserted += 1;
        }
    }
    Ok((inserted, rejected))
}

/// Oldest publication time accepted for this fetch.
fn cutoff(
    lookback_days: u32,
    since_last_fetch: bool,
    last_fetched: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let lookback = Utc::now() - chrono::Duration::days(i64::from(lookback_days));
    match (since_last_fetch, last_fetched) {
        (true, Some(last)) => last,
        _ => lookback,
    }
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &FetchOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| FeedwatchError::Network(format!("failed to build HTTP client: {e}")))
}

async fn download(client: &Client, url: &str) -> Result<String> {
    read_body(client.get(url).header(reqwest::header::ACCEPT, ACCEPT), url).await
}

/// Send `request` and return the body of a successful, size-capped response.
async fn read_body(request: reqwest::RequestBuilder, url: &str) -> Result<String> {
    let response = request
        .send()
        .await
        .map_err(|e| FeedwatchError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FeedwatchError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(FeedwatchError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| FeedwatchError::Network(format!("{url}: failed to read body: {e}")))
}
