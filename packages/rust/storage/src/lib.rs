//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding feed sources and
//! articles, plus the per-article progress markers the pipeline stages use as
//! their work queues.
//!
//! **Access rules:**
//! - pipeline runs: read-write via [`Storage::open`]
//! - reporting commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use feedwatch_shared::{
    ArticleStats, FeedwatchError, NewArticle, PendingEmbedding, PendingSummary, Result,
    UnscrapedArticle,
};
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// `summary_model` value recorded when summarization failed for an article.
pub const SUMMARY_FAILED_MARKER: &str = "failed";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn db_err(e: libsql::Error) -> FeedwatchError {
    FeedwatchError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FeedwatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FeedwatchError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    FeedwatchError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(FeedwatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    async fn count(&self, sql: &str) -> Result<usize> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as usize),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Source operations
    // -----------------------------------------------------------------------

    /// Insert a source, or rename the existing one with the same URL.
    /// Returns the source id.
    pub async fn upsert_source(&self, name: &str, url: &str) -> Result<i64> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sources (name, url, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(url) DO UPDATE SET name = excluded.name",
                params![name, url, now.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut rows = self
            .conn
            .query("SELECT id FROM sources WHERE url = ?1", params![url])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map_err(db_err),
            None => Err(FeedwatchError::Storage(format!(
                "source {url} vanished after upsert"
            ))),
        }
    }

    /// When the source was last fetched successfully.
    pub async fn source_last_fetched(&self, source_id: i64) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_fetched FROM sources WHERE id = ?1",
                params![source_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => match row.get::<String>(0).ok() {
                Some(s) => Ok(Some(parse_timestamp(&s)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Stamp a successful fetch.
    pub async fn mark_source_fetched(&self, source_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sources SET last_fetched = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), source_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Article operations
    // -----------------------------------------------------------------------

    /// Insert an article unless one with the same URL exists.
    /// Returns whether a row was inserted.
    pub async fn insert_article_if_new(&self, article: &NewArticle) -> Result<bool> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO articles (id, source_id, title, url, author, published_at, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(url) DO NOTHING",
                params![
                    id.as_str(),
                    article.source_id,
                    article.title.as_str(),
                    article.url.as_str(),
                    article.author.as_deref(),
                    article.published_at.map(|dt| dt.to_rfc3339()),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    /// Whether an article with this URL is already stored.
    pub async fn article_exists(&self, url: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM articles WHERE url = ?1", params![url])
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// Every article as `(id, url)`.
    pub async fn list_article_urls(&self) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query("SELECT id, url FROM articles", params![])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push((
                row.get::<String>(0).map_err(db_err)?,
                row.get::<String>(1).map_err(db_err)?,
            ));
        }
        Ok(results)
    }

    /// Delete articles by id. Returns how many rows went away.
    pub async fn delete_articles(&self, ids: &[String]) -> Result<usize> {
        self.check_writable()?;
        let mut deleted = 0;
        for id in ids {
            deleted += self
                .conn
                .execute("DELETE FROM articles WHERE id = ?1", params![id.as_str()])
                .await
                .map_err(db_err)? as usize;
        }
        Ok(deleted)
    }

    /// Articles whose body has not been scraped, newest first.
    pub async fn unscraped_articles(&self, limit: usize) -> Result<Vec<UnscrapedArticle>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url FROM articles WHERE content IS NULL
                 ORDER BY published_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(UnscrapedArticle {
                id: row.get::<String>(0).map_err(db_err)?,
                url: row.get::<String>(1).map_err(db_err)?,
            });
        }
        Ok(results)
    }

    /// Store a scraped body. An empty string records a failed scrape.
    pub async fn set_article_content(&self, id: &str, content: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE articles SET content = ?1, scraped_at = ?2 WHERE id = ?3",
                params![content, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Scraped articles with no summary attempt yet.
    pub async fn count_unsummarized(&self) -> Result<usize> {
        self.count(
            "SELECT COUNT(*) FROM articles
             WHERE content IS NOT NULL AND content != '' AND summary_model IS NULL",
        )
        .await
    }

    pub async fn unsummarized_articles(&self, limit: usize) -> Result<Vec<PendingSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, url, content FROM articles
                 WHERE content IS NOT NULL AND content != '' AND summary_model IS NULL
                 ORDER BY published_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(PendingSummary {
                id: row.get::<String>(0).map_err(db_err)?,
                title: row.get::<String>(1).map_err(db_err)?,
                url: row.get::<String>(2).map_err(db_err)?,
                content: row.get::<String>(3).map_err(db_err)?,
            });
        }
        Ok(results)
    }

    /// Record a summary. Pass [`SUMMARY_FAILED_MARKER`] as `model` to record
    /// a failure so the article is not picked up again.
    pub async fn save_summary(&self, id: &str, summary: &str, model: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE articles SET summary = ?1, summary_model = ?2, summarized_at = ?3
                 WHERE id = ?4",
                params![summary, model, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Summarized articles without an embedding.
    pub async fn unembedded_articles(&self, limit: usize) -> Result<Vec<PendingEmbedding>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, summary FROM articles
                 WHERE summary_model IS NOT NULL AND summary_model != ?1
                   AND summary IS NOT NULL AND embedding IS NULL
                 ORDER BY published_at DESC LIMIT ?2",
                params![SUMMARY_FAILED_MARKER, limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(PendingEmbedding {
                id: row.get::<String>(0).map_err(db_err)?,
                title: row.get::<String>(1).map_err(db_err)?,
                summary: row.get::<String>(2).map_err(db_err)?,
            });
        }
        Ok(results)
    }

    /// Store an embedding as little-endian `f32`s. An empty vector records a
    /// failed attempt.
    pub async fn save_embedding(&self, id: &str, vector: &[f32]) -> Result<()> {
        self.check_writable()?;
        let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE articles SET embedding = ?1, embedded_at = ?2 WHERE id = ?3",
                params![bytes, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Stored embedding for an article, if any.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let mut rows = self
            .conn
            .query("SELECT embedding FROM articles WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<Vec<u8>>(0).ok().map(|bytes| {
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            })),
            None => Ok(None),
        }
    }

    /// Aggregate counters for reporting.
    pub async fn stats(&self) -> Result<ArticleStats> {
        Ok(ArticleStats {
            sources: self.count("SELECT COUNT(*) FROM sources").await?,
            articles: self.count("SELECT COUNT(*) FROM articles").await?,
            scraped: self
                .count("SELECT COUNT(*) FROM articles WHERE content IS NOT NULL AND content != ''")
                .await?,
            scrape_failed: self
                .count("SELECT COUNT(*) FROM articles WHERE content = ''")
                .await?,
            summarized: self
                .count(
                    "SELECT COUNT(*) FROM articles
                     WHERE summary_model IS NOT NULL AND summary_model != 'failed'",
                )
                .await?,
            embedded: self
                .count("SELECT COUNT(*) FROM articles WHERE length(embedding) > 0")
                .await?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FeedwatchError::Storage(format!("invalid date: {e}")))
}
