//! LLM title screening used by the sources before they store anything.

use std::sync::Arc;

use async_trait::async_trait;
use feedwatch_core::{ProviderInfo, RelevanceFilter};
use feedwatch_shared::{FeedwatchError, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::client::{ChatRequest, LlmClient};

/// Titles classified per chat call.
pub const RELEVANCE_BATCH: usize = 25;

const RELEVANCE_PROMPT: &str = r#"You are a cybersecurity threat-intelligence triage analyst.
Classify each article title as RELEVANT or IRRELEVANT to cybersecurity threat research.

RELEVANT: malware analysis, exploits, vulnerabilities (CVEs), attack campaigns, threat actors,
zero-days, supply chain attacks, security advisories, novel attack techniques or tooling,
breach investigations with technical details, proof-of-concept exploits, security tool
releases, botnets, ransomware operations, C2 infrastructure, phishing campaigns,
firmware and hardware security research.

IRRELEVANT only if the article is about nothing but business or financial news, regulatory or
legal actions, fines or lawsuits, mergers and acquisitions, product marketing, hiring,
opinion without technical substance, awards, conference announcements or executive moves.

When in doubt, classify as RELEVANT.

Respond with a JSON object {"relevant": [true, false, ...]} holding one boolean per title,
in the order given."#;

#[derive(Debug, Deserialize)]
struct Verdicts {
    #[serde(default)]
    relevant: Option<Vec<bool>>,
}

/// Classifies titles with the configured chat model. Token usage flows to
/// the session accountant through [`LlmClient::chat`].
pub struct TitleRelevance {
    client: Arc<LlmClient>,
}

impl TitleRelevance {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }

    async fn classify_batch(&self, titles: &[String]) -> Result<Vec<bool>> {
        let numbered = titles
            .iter()
            .enumerate()
            .map(|(i, title)| format!("{}. \"{title}\"", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!("Titles:\n{numbered}");

        let completion = self
            .client
            .chat(&ChatRequest {
                system: RELEVANCE_PROMPT,
                user: &user,
                temperature: 0.0,
                max_tokens: 300,
                json_mode: true,
            })
            .await?;

        let parsed: Verdicts = serde_json::from_str(completion.text.trim())
            .map_err(|e| FeedwatchError::Llm(format!("relevance reply is not valid JSON: {e}")))?;
        Ok(fit_verdicts(parsed.relevant.unwrap_or_default(), titles.len()))
    }
}

#[async_trait]
impl RelevanceFilter for TitleRelevance {
    #[instrument(skip_all, fields(titles = titles.len()))]
    async fn classify(&self, titles: &[String]) -> Vec<bool> {
        if !self.client.has_api_key() {
            return vec![true; titles.len()];
        }

        let mut verdicts = Vec::with_capacity(titles.len());
        for batch in titles.chunks(RELEVANCE_BATCH) {
            match self.classify_batch(batch).await {
                Ok(batch_verdicts) => verdicts.extend(batch_verdicts),
                Err(e) => {
                    warn!(error = %e, size = batch.len(), "relevance check failed, accepting batch");
                    verdicts.extend(std::iter::repeat_n(true, batch.len()));
                }
            }
        }
        debug!(
            rejected = verdicts.iter().filter(|keep| !**keep).count(),
            "titles classified"
        );
        verdicts
    }
}

/// Pad a short answer with acceptances and drop any surplus.
fn fit_verdicts(mut verdicts: Vec<bool>, len: usize) -> Vec<bool> {
    verdicts.resize(len, true);
    verdicts
}
