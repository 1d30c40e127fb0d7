//! Removal of articles no later stage can process.

use std::sync::Arc;

use async_trait::async_trait;
use feedwatch_core::Cleanup;
use feedwatch_shared::{Result, is_file_url};
use feedwatch_storage::Storage;
use tracing::info;

/// Deletes articles whose URL points at a downloadable file.
pub struct FileUrlCleanup {
    storage: Arc<Storage>,
}

impl FileUrlCleanup {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Cleanup for FileUrlCleanup {
    async fn remove_unprocessable(&self) -> Result<usize> {
        let doomed: Vec<String> = self
            .storage
            .list_article_urls()
            .await?
            .into_iter()
            .filter(|(_, url)| is_file_url(url))
            .map(|(id, _)| id)
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }
        let removed = self.storage.delete_articles(&doomed).await?;
        info!(removed, "removed file-URL articles");
        Ok(removed)
    }
}
