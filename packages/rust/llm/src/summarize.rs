//! Article summarization, the pipeline's cost-gated [`Enricher`].

use std::sync::Arc;

use async_trait::async_trait;
use feedwatch_core::{Enricher, ProviderInfo};
use feedwatch_shared::{FeedwatchError, PendingSummary, Result};
use feedwatch_storage::{SUMMARY_FAILED_MARKER, Storage};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::client::{ChatRequest, LlmClient};

/// Article bodies are cut to this many characters before prompting.
pub const MAX_INPUT_CHARS: usize = 12_000;

const SUMMARY_PROMPT: &str = r#"You are a senior cybersecurity threat intelligence analyst.
Given an article title and its full content, produce a structured analysis as a JSON object
with these exact keys:

- "executive_summary": a concise paragraph (3-5 sentences) capturing the essence and
  significance of the threat, vulnerability, or finding.
- "novelty": what is new or noteworthy about the reported tactics, techniques and tooling.
  If nothing is particularly novel, say so briefly.
- "details": an array of strings, one technical finding each. Include IOCs, affected
  systems and versions, CVE IDs, CVSS scores, timelines and attribution where available.
- "mitigations": an array of strings, one actionable defensive step each.

Respond ONLY with valid JSON."#;

#[derive(Debug, Default, Deserialize)]
struct StructuredSummary {
    #[serde(default)]
    executive_summary: Option<String>,
    #[serde(default)]
    novelty: Option<String>,
    #[serde(default)]
    details: Vec<String>,
    #[serde(default)]
    mitigations: Vec<String>,
}

impl StructuredSummary {
    fn to_markdown(&self) -> String {
        let mut out = String::from("# Executive Summary\n");
        out.push_str(
            self.executive_summary
                .as_deref()
                .unwrap_or("No summary available."),
        );
        out.push_str("\n\n# Novelty\n");
        out.push_str(
            self.novelty
                .as_deref()
                .unwrap_or("Nothing particularly novel reported."),
        );
        out.push_str("\n\n# Details\n");
        for point in &self.details {
            out.push_str(&format!("- {point}\n"));
        }
        out.push_str("\n# Mitigations\n");
        for point in &self.mitigations {
            out.push_str(&format!("- {point}\n"));
        }
        out.trim_end().to_string()
    }
}

/// Summarizes scraped articles through the configured LLM.
pub struct Summarizer {
    client: Arc<LlmClient>,
    storage: Arc<Storage>,
}

impl Summarizer {
    pub fn new(client: Arc<LlmClient>, storage: Arc<Storage>) -> Self {
        Self { client, storage }
    }

    /// Summarize up to `limit` articles. Failures are stored with the
    /// failed marker so they leave the queue.
    #[instrument(skip(self))]
    pub async fn summarize_batch(&self, limit: usize) -> Result<usize> {
        if !self.client.has_api_key() {
            info!("no LLM API key configured, skipping summarization");
            return Ok(0);
        }

        let articles = self.storage.unsummarized_articles(limit).await?;
        if articles.is_empty() {
            return Ok(0);
        }
        let total = articles.len();

        let semaphore = Arc::new(Semaphore::new(self.client.max_concurrency()));
        let mut tasks = JoinSet::new();
        for article in articles {
            let client = Arc::clone(&self.client);
            let sem = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (article.id, Err(FeedwatchError::Llm("semaphore closed".into())));
                };
                let result = summarize_article(&client, &article).await;
                (article.id, result)
            });
        }

        // Writes stay on this task; only the LLM calls fan out. Every task is
        // drained before a storage error is returned, so no paid-for summary
        // is aborted mid-flight.
        let model = self.client.model_name();
        let mut summarized = 0;
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // The article stays queued for the next batch.
                    warn!(error = %e, "summarize task failed");
                    continue;
                }
            };
            let saved = match result {
                Ok(summary) => {
                    let saved = self.storage.save_summary(&id, &summary, &model).await;
                    if saved.is_ok() {
                        summarized += 1;
                    }
                    saved
                }
                Err(e) => {
                    warn!(article = %id, error = %e, "summarization failed");
                    self.storage
                        .save_summary(&id, "", SUMMARY_FAILED_MARKER)
                        .await
                }
            };
            if let Err(e) = saved {
                warn!(article = %id, error = %e, "could not store summary");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(summarized, total, "summarize batch done");
        Ok(total)
    }
}

#[async_trait]
impl Enricher for Summarizer {
    async fn count_pending(&self) -> Result<usize> {
        self.storage.count_unsummarized().await
    }

    async fn process_batch(&self, limit: usize) -> Result<usize> {
        self.summarize_batch(limit).await
    }
}

async fn summarize_article(client: &LlmClient, article: &PendingSummary) -> Result<String> {
    let content = truncate_chars(&article.content, MAX_INPUT_CHARS);
    let user = format!("Title: {}\n\nArticle Content:\n{content}", article.title);

    let completion = client
        .chat(&ChatRequest {
            system: SUMMARY_PROMPT,
            user: &user,
            temperature: 0.3,
            max_tokens: 2500,
            json_mode: true,
        })
        .await?;

    let parsed: StructuredSummary = serde_json::from_str(strip_code_fence(&completion.text))
        .map_err(|e| FeedwatchError::Llm(format!("summary is not valid JSON: {e}")))?;
    Ok(parsed.to_markdown())
}

/// Truncate to `max_chars` characters, marking the cut.
fn truncate_chars(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((cut, _)) => format!("{}\n\n[Content truncated...]", &content[..cut]),
    }
}

/// Some models wrap JSON in a Markdown code fence even when told not to.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
