//! Summary embeddings, the pipeline's final [`Embedder`] stage.

use std::sync::Arc;

use async_trait::async_trait;
use feedwatch_core::Embedder;
use feedwatch_shared::Result;
use feedwatch_storage::Storage;
use tracing::{debug, info, instrument, warn};

use crate::client::LlmClient;

/// Embeds `title + "\n" + summary` for every summarized article.
pub struct SummaryEmbedder {
    client: Arc<LlmClient>,
    storage: Arc<Storage>,
}

impl SummaryEmbedder {
    pub fn new(client: Arc<LlmClient>, storage: Arc<Storage>) -> Self {
        Self { client, storage }
    }

    /// Embed up to `limit` articles in one API call.
    ///
    /// A failed call leaves the batch queued for the next run and returns 0
    /// so the stage ends instead of hammering the API.
    #[instrument(skip(self))]
    pub async fn embed_batch(&self, limit: usize) -> Result<usize> {
        if !self.client.has_embedding_key() {
            debug!("no OpenAI API key configured, skipping embeddings");
            return Ok(0);
        }

        let articles = self.storage.unembedded_articles(limit).await?;
        if articles.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = articles
            .iter()
            .map(|a| format!("{}\n{}", a.title, a.summary))
            .collect();

        let vectors = match self.client.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(error = %e, count = articles.len(), "embedding request failed");
                return Ok(0);
            }
        };

        let mut stored = 0;
        let mut vectors = vectors.into_iter();
        for article in &articles {
            match vectors.next() {
                Some(vector) if !vector.is_empty() => {
                    self.storage.save_embedding(&article.id, &vector).await?;
                    stored += 1;
                }
                _ => {
                    warn!(article = %article.id, "no embedding returned");
                    self.storage.save_embedding(&article.id, &[]).await?;
                }
            }
        }

        info!(
            stored,
            total = articles.len(),
            model = self.client.embedding_model(),
            "embed batch done"
        );
        Ok(articles.len())
    }
}

#[async_trait]
impl Embedder for SummaryEmbedder {
    async fn process_batch(&self, limit: usize) -> Result<usize> {
        self.embed_batch(limit).await
    }
}
