//! Malpedia bibliography source.
//!
//! Malpedia publishes its whole reference library as one BibTeX document
//! (several MB). Each entry carries a title, a publication date, a URL and
//! optionally an author and organization. Only the fields we store are
//! extracted, with the same regex approach as the feed parser.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use feedwatch_core::{AcceptAll, FeedSource, RelevanceFilter};
use feedwatch_shared::{FeedwatchError, MalpediaConfig, NewArticle, Result, is_file_url};
use feedwatch_storage::Storage;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use crate::{FetchOptions, build_client, cutoff, read_body, store_relevant};

const SOURCE_NAME: &str = "Malpedia";

/// The library is large; allow it more time than a feed.
const MALPEDIA_TIMEOUT_SECS: u64 = 60;

static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)@\w+\{[^,]+,(.*?)\n\}").expect("bib entry regex"));

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\btitle\s*=\s*\{\{(.+?)\}\}").expect("bib title regex"));

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bdate\s*=\s*\{(\d{4}-\d{2}-\d{2})\}").expect("bib date regex")
});

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\burl\s*=\s*\{(.+?)\}").expect("bib url regex"));

static AUTHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bauthor\s*=\s*\{(.+?)\}").expect("bib author regex"));

static ORG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\borganization\s*=\s*\{(.+?)\}").expect("bib organization regex")
});

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One bibliography entry. Entries without a URL or title are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BibEntry {
    pub title: String,
    pub url: String,
    pub date: Option<NaiveDate>,
    pub author: Option<String>,
    pub organization: Option<String>,
}

impl BibEntry {
    /// `Author (Organization)`, or whichever of the two is present.
    pub fn display_author(&self) -> Option<String> {
        match (&self.author, &self.organization) {
            (Some(author), Some(org)) => Some(format!("{author} ({org})")),
            (Some(one), None) | (None, Some(one)) => Some(one.clone()),
            (None, None) => None,
        }
    }

    /// Midnight UTC of the entry date.
    fn published(&self) -> Option<DateTime<Utc>> {
        self.date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }
}

/// Extract the entries of a BibTeX document.
pub fn parse_bibtex(text: &str) -> Vec<BibEntry> {
    ENTRY_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let body = caps.get(1)?.as_str();
            let url = capture(&URL_RE, body)?;
            let title = capture(&TITLE_RE, body)?;
            Some(BibEntry {
                title,
                url,
                date: capture(&DATE_RE, body)
                    .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
                author: capture(&AUTHOR_RE, body),
                organization: capture(&ORG_RE, body),
            })
        })
        .collect()
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Outcome counters for one library fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MalpediaReport {
    pub new_articles: usize,
    /// Undated or older than the cutoff.
    pub skipped_old: usize,
    pub skipped_files: usize,
    pub skipped_irrelevant: usize,
}

/// Pulls recent entries from the Malpedia library into storage.
pub struct MalpediaFetcher {
    client: Client,
    storage: Arc<Storage>,
    config: MalpediaConfig,
    api_key: Option<String>,
    relevance: Arc<dyn RelevanceFilter>,
}

impl MalpediaFetcher {
    /// Build a fetcher, reading the token from the env var named in `config`.
    pub fn new(storage: Arc<Storage>, config: MalpediaConfig) -> Result<Self> {
        let api_key = config.api_key();
        Self::with_api_key(storage, config, api_key)
    }

    pub fn with_api_key(
        storage: Arc<Storage>,
        config: MalpediaConfig,
        api_key: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(&FetchOptions {
                timeout_secs: MALPEDIA_TIMEOUT_SECS,
            })?,
            storage,
            config,
            api_key,
            relevance: Arc::new(AcceptAll),
        })
    }

    /// Screen new titles with `filter` before storing them.
    pub fn with_relevance(mut self, filter: Arc<dyn RelevanceFilter>) -> Self {
        self.relevance = filter;
        self
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Download the library and store its new, recent entries.
    #[instrument(skip(self, api_key))]
    pub async fn fetch_library(
        &self,
        api_key: &str,
        lookback_days: u32,
        since_last_fetch: bool,
    ) -> Result<MalpediaReport> {
        let source_url = format!("{}/library", self.base_url());
        let source_id = self.storage.upsert_source(SOURCE_NAME, &source_url).await?;
        let last_fetched = self.storage.source_last_fetched(source_id).await?;
        let cutoff = cutoff(lookback_days, since_last_fetch, last_fetched);

        let bib_url = format!("{}/api/get/bib", self.base_url());
        let request = self
            .client
            .get(&bib_url)
            .header(reqwest::header::AUTHORIZATION, format!("APIToken {api_key}"));
        let body = read_body(request, &bib_url).await?;
        let entries = parse_bibtex(&body);
        debug!(entries = entries.len(), %cutoff, "library parsed");

        let mut report = MalpediaReport::default();
        let mut candidates = Vec::new();
        for entry in entries {
            let Some(published) = entry.published().filter(|p| *p >= cutoff) else {
                report.skipped_old += 1;
                continue;
            };
            if is_file_url(&entry.url) {
                report.skipped_files += 1;
                continue;
            }
            if self.storage.article_exists(&entry.url).await? {
                continue;
            }
            candidates.push(NewArticle {
                source_id,
                author: entry.display_author(),
                title: entry.title,
                url: entry.url,
                published_at: Some(published),
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
            "malpedia fetched"
        );
        Ok(report)
    }
}

#[async_trait]
impl FeedSource for MalpediaFetcher {
    fn name(&self) -> &str {
        "malpedia"
    }

    async fn fetch(&self, lookback_days: u32, since_last_fetch: bool) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let Some(api_key) = self.api_key.as_deref() else {
            info!(env = %self.config.api_key_env, "Malpedia API key not set, skipping");
            return Ok(0);
        };

        match self
            .fetch_library(api_key, lookback_days, since_last_fetch)
            .await
        {
            Ok(report) => Ok(report.new_articles),
            Err(e @ FeedwatchError::Storage(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "malpedia fetch failed, skipping");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{RejectContaining, test_storage};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day(days_ago: i64) -> String {
        (Utc::now() - chrono::Duration::days(days_ago))
            .format("%Y-%m-%d")
            .to_string()
    }

    fn bib_entry(key: &str, title: &str, url: &str, date: Option<&str>) -> String {
        let mut entry = format!(
            "@online{{{key},\nauthor = {{Jane Doe}},\norganization = {{ACME Labs}},\n\
             title = {{{{{title}}}}},\n"
        );
        if let Some(date) = date {
            entry.push_str(&format!("date = {{{date}}},\n"));
        }
        entry.push_str(&format!(
            "url = {{{url}}},\nlanguage = {{English}},\nurldate = {{2026-01-01}}\n}}\n"
        ));
        entry
    }

    fn config(server: &MockServer) -> MalpediaConfig {
        MalpediaConfig {
            base_url: server.uri(),
            ..MalpediaConfig::default()
        }
    }

    async fn serve_library(server: &MockServer, body: String) {
        Mock::given(method("GET"))
            .and(path("/api/get/bib"))
            .and(header("authorization", "APIToken secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[test]
    fn parses_fields_and_drops_incomplete_entries() {
        let text = [
            bib_entry("a", "Loader Analysis", "https://acme.example/a", Some("2026-03-04")),
            "@online{b,\ntitle = {{No link here}},\ndate = {2026-03-04}\n}\n".to_string(),
            "@online{c,\nurl = {https://acme.example/c},\ndate = {2026-03-04}\n}\n".to_string(),
        ]
        .concat();

        let entries = parse_bibtex(&text);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.title, "Loader Analysis");
        assert_eq!(entry.url, "https://acme.example/a");
        assert_eq!(entry.date, NaiveDate::from_ymd_opt(2026, 3, 4));
        assert_eq!(entry.display_author().as_deref(), Some("Jane Doe (ACME Labs)"));
    }

    #[test]
    fn author_display_falls_back() {
        let mut entry = BibEntry {
            title: "t".into(),
            url: "u".into(),
            date: None,
            author: None,
            organization: Some("ACME Labs".into()),
        };
        assert_eq!(entry.display_author().as_deref(), Some("ACME Labs"));
        entry.organization = None;
        assert_eq!(entry.display_author(), None);
    }

    #[tokio::test]
    async fn stores_recent_relevant_entries() {
        let server = MockServer::start().await;
        let today = day(0);
        let body = [
            bib_entry("fresh", "New loader targets VPNs", "https://acme.example/loader", Some(&today)),
            bib_entry("old", "Ancient worm", "https://acme.example/worm", Some("2019-05-01")),
            bib_entry("file", "Slides", "https://acme.example/slides.PDF", Some(&today)),
            bib_entry("undated", "Undated note", "https://acme.example/note", None),
            bib_entry("webinar", "Webinar: threat trends", "https://acme.example/w", Some(&today)),
        ]
        .concat();
        serve_library(&server, body).await;

        let storage = test_storage().await;
        let fetcher =
            MalpediaFetcher::with_api_key(Arc::clone(&storage), config(&server), Some("secret".into()))
                .unwrap()
                .with_relevance(Arc::new(RejectContaining("Webinar")));

        let report = fetcher.fetch_library("secret", 1, false).await.unwrap();
        assert_eq!(
            report,
            MalpediaReport {
                new_articles: 1,
                skipped_old: 2,
                skipped_files: 1,
                skipped_irrelevant: 1,
            }
        );
        assert!(storage.article_exists("https://acme.example/loader").await.unwrap());

        // Known URLs are neither classified nor inserted again.
        let report = fetcher.fetch_library("secret", 1, false).await.unwrap();
        assert_eq!(report.new_articles, 0);
        assert_eq!(report.skipped_irrelevant, 1);
        assert_eq!(storage.stats().await.unwrap().sources, 1);
    }

    #[tokio::test]
    async fn since_last_fetch_widens_past_lookback() {
        let server = MockServer::start().await;
        serve_library(
            &server,
            bib_entry("recent", "Botnet takedown", "https://acme.example/botnet", Some(&day(2))),
        )
        .await;

        let storage = test_storage().await;
        let config = config(&server);
        let source_id = storage
            .upsert_source(SOURCE_NAME, &format!("{}/library", config.base_url))
            .await
            .unwrap();
        storage
            .mark_source_fetched(source_id, Utc::now() - chrono::Duration::days(3))
            .await
            .unwrap();

        let fetcher =
            MalpediaFetcher::with_api_key(Arc::clone(&storage), config, Some("secret".into()))
                .unwrap();
        assert_eq!(fetcher.fetch_library("secret", 1, false).await.unwrap().new_articles, 0);
        assert_eq!(fetcher.fetch(1, true).await.unwrap(), 0);

        // The previous call stamped the source; reset the stamp and retry.
        storage
            .mark_source_fetched(source_id, Utc::now() - chrono::Duration::days(3))
            .await
            .unwrap();
        assert_eq!(fetcher.fetch(1, true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_key_or_disabled_source_skips_the_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let fetcher = MalpediaFetcher::with_api_key(Arc::clone(&storage), config(&server), None)
            .unwrap();
        assert_eq!(fetcher.fetch(1, false).await.unwrap(), 0);

        let disabled = MalpediaConfig {
            enabled: false,
            ..config(&server)
        };
        let fetcher =
            MalpediaFetcher::with_api_key(Arc::clone(&storage), disabled, Some("secret".into()))
                .unwrap();
        assert_eq!(fetcher.fetch(1, false).await.unwrap(), 0);
        assert_eq!(storage.stats().await.unwrap().sources, 0);
    }

    #[tokio::test]
    async fn download_failure_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/get/bib"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let fetcher =
            MalpediaFetcher::with_api_key(Arc::clone(&storage), config(&server), Some("bad".into()))
                .unwrap();
        assert_eq!(fetcher.fetch(1, false).await.unwrap(), 0);
        assert_eq!(storage.stats().await.unwrap().articles, 0);
    }
}
