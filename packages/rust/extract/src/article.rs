//! Batch scraper for article bodies.
//!
//! Each batch pulls unscraped articles from storage, downloads them
//! concurrently under a semaphore, extracts readable text, and writes the
//! result back. Any article that yields no text is stored with an empty body
//! so the next batch moves on.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedwatch_core::ContentExtractor;
use feedwatch_shared::{FeedwatchError, Result, UnscrapedArticle, is_file_url};
use feedwatch_storage::Storage;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::text::{extract_article_text, page_title};

/// Browser-like User-Agent; many news sites reject obvious bots.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Settings for article downloads.
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    /// Timeout for a single HTTP request.
    pub request_timeout: Duration,
    /// Hard bound on download plus extraction for one article.
    pub article_timeout: Duration,
    /// Articles downloaded at the same time.
    pub concurrency: usize,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            article_timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }
}

/// Fills in article bodies; the pipeline's [`ContentExtractor`].
pub struct ArticleScraper {
    client: Client,
    storage: Arc<Storage>,
    opts: ScrapeOptions,
    /// Allow localhost/private IPs (for tests against mock servers).
    allow_localhost: bool,
}

impl ArticleScraper {
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        Self::with_options(storage, ScrapeOptions::default())
    }

    pub fn with_options(storage: Arc<Storage>, opts: ScrapeOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(opts.request_timeout)
            .build()
            .map_err(|e| FeedwatchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            storage,
            opts,
            allow_localhost: false,
        })
    }

    /// Allow scraping localhost/private IPs (for tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Scrape up to `limit` articles. Returns how many were handled,
    /// including failures and removed file URLs.
    #[instrument(skip(self))]
    pub async fn scrape_batch(&self, limit: usize) -> Result<usize> {
        let articles = self.storage.unscraped_articles(limit).await?;
        if articles.is_empty() {
            return Ok(0);
        }
        let total = articles.len();

        let mut removed = Vec::new();
        let mut tasks = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.opts.concurrency.max(1)));

        for UnscrapedArticle { id, url } in articles {
            if is_file_url(&url) {
                info!(%url, "file URL, removing article");
                removed.push(id);
                continue;
            }
            if !self.allow_localhost && is_blocked_target(&url) {
                warn!(%url, "refusing to scrape private address");
                tasks.spawn(async move { (id, None) });
                continue;
            }

            let client = self.client.clone();
            let sem = Arc::clone(&semaphore);
            let timeout = self.opts.article_timeout;
            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (id, None);
                };
                let text = match tokio::time::timeout(timeout, fetch_text(&client, &url)).await
                {
                    Ok(Ok(text)) => text,
                    Ok(Err(e)) => {
                        debug!(%url, error = %e, "download failed");
                        None
                    }
                    Err(_) => {
                        warn!(%url, timeout_secs = timeout.as_secs(), "scrape timed out");
                        None
                    }
                };
                (id, text)
            });
        }

        self.storage.delete_articles(&removed).await?;

        let mut scraped = 0;
        while let Some(joined) = tasks.join_next().await {
            let (id, text) = joined
                .map_err(|e| FeedwatchError::pipeline("scrape", format!("task failed: {e}")))?;
            match text {
                Some(text) => {
                    debug!(article = %id, chars = text.len(), "article scraped");
                    self.storage.set_article_content(&id, &text).await?;
                    scraped += 1;
                }
                None => self.storage.set_article_content(&id, "").await?,
            }
        }

        info!(scraped, removed = removed.len(), total, "scrape batch done");
        Ok(total)
    }
}

#[async_trait]
impl ContentExtractor for ArticleScraper {
    async fn process_batch(&self, limit: usize) -> Result<usize> {
        self.scrape_batch(limit).await
    }
}

/// Download a page and extract its text. `Ok(None)` means the page had no
/// usable content.
async fn fetch_text(client: &Client, url: &str) -> Result<Option<String>> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, ACCEPT)
        .send()
        .await
        .map_err(|e| FeedwatchError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FeedwatchError::Network(format!("{url}: HTTP {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| FeedwatchError::Network(format!("{url}: body read failed: {e}")))?;

    let text = extract_article_text(&body);
    if text.is_none() {
        debug!(%url, title = ?page_title(&body), "no extractable content");
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Feed entries are untrusted; never follow them into local networks.
fn is_blocked_target(url: &str) -> bool {
    let Ok(url) = Url::parse(url) else {
        return true;
    };
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedwatch_shared::NewArticle;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = "A newly disclosed flaw in the appliance's management interface \
        lets unauthenticated attackers execute commands as root; exploitation began within days.";

    async fn seeded_storage(urls: &[String]) -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("fw_extract_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        let src = storage
            .upsert_source("test", "https://feeds.example.com/rss")
            .await
            .unwrap();
        for url in urls {
            storage
                .insert_article_if_new(&NewArticle {
                    source_id: src,
                    title: url.clone(),
                    url: url.clone(),
                    author: None,
                    published_at: None,
                })
                .await
                .unwrap();
        }
        Arc::new(storage)
    }

    #[test]
    fn blocks_private_targets() {
        assert!(is_blocked_target("http://127.0.0.1/admin"));
        assert!(is_blocked_target("http://10.1.2.3/"));
        assert!(is_blocked_target("http://[::1]/"));
        assert!(is_blocked_target("http://router.local/"));
        assert!(is_blocked_target("ftp://example.com/file"));
        assert!(!is_blocked_target("https://www.bleepingcomputer.com/news/"));
    }

    #[tokio::test]
    async fn batch_scrapes_marks_failures_and_drops_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<html><body><article><p>{BODY}</p></article></body></html>"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let urls = vec![
            format!("{}/story", server.uri()),
            format!("{}/gone", server.uri()),
            format!("{}/advisory.pdf", server.uri()),
        ];
        let storage = seeded_storage(&urls).await;
        let scraper = ArticleScraper::new(Arc::clone(&storage))
            .unwrap()
            .allow_localhost();

        assert_eq!(scraper.process_batch(10).await.unwrap(), 3);
        assert_eq!(scraper.process_batch(10).await.unwrap(), 0);

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.articles, 2);
        assert_eq!(stats.scraped, 1);
        assert_eq!(stats.scrape_failed, 1);

        let pending = storage.unsummarized_articles(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, BODY);
    }

    #[tokio::test]
    async fn private_targets_are_marked_failed_without_fetching() {
        let storage = seeded_storage(&["http://127.0.0.1:9/internal".to_string()]).await;
        let scraper = ArticleScraper::new(Arc::clone(&storage)).unwrap();

        assert_eq!(scraper.process_batch(5).await.unwrap(), 1);
        assert_eq!(storage.stats().await.unwrap().scrape_failed, 1);
    }

    #[tokio::test]
    async fn slow_pages_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<article><p>{BODY}</p></article>"))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let storage = seeded_storage(&[format!("{}/slow", server.uri())]).await;
        let opts = ScrapeOptions {
            article_timeout: Duration::from_millis(50),
            ..ScrapeOptions::default()
        };
        let scraper = ArticleScraper::with_options(Arc::clone(&storage), opts)
            .unwrap()
            .allow_localhost();

        assert_eq!(scraper.process_batch(5).await.unwrap(), 1);
        assert_eq!(storage.stats().await.unwrap().scrape_failed, 1);
    }
}
