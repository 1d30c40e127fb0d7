//! SQL migration definitions for the feedwatch database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sources, articles",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Configured feeds
CREATE TABLE IF NOT EXISTS sources (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL,
    url          TEXT NOT NULL UNIQUE,
    last_fetched TEXT,
    created_at   TEXT NOT NULL
);

-- Feed entries and everything the pipeline derives from them.
-- content: NULL = not scraped yet, '' = scrape failed
-- summary_model: NULL = not summarized yet, 'failed' = summarization failed
-- embedding: NULL = not embedded yet, zero-length = embedding failed
CREATE TABLE IF NOT EXISTS articles (
    id            TEXT PRIMARY KEY,
    source_id     INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    title         TEXT NOT NULL,
    url           TEXT NOT NULL UNIQUE,
    author        TEXT,
    published_at  TEXT,
    fetched_at    TEXT NOT NULL,
    content       TEXT,
    scraped_at    TEXT,
    summary       TEXT,
    summary_model TEXT,
    summarized_at TEXT,
    embedding     BLOB,
    embedded_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_articles_source ON articles(source_id);
CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Partial indexes for pipeline work queues",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_articles_unscraped
    ON articles(published_at) WHERE content IS NULL;
CREATE INDEX IF NOT EXISTS idx_articles_unsummarized
    ON articles(published_at) WHERE summary_model IS NULL;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
