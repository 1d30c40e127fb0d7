//! Article body scraping and pre-fetch cleanup.
//!
//! This crate provides:
//! - [`ArticleScraper`] — the pipeline's content extractor
//! - [`FileUrlCleanup`] — removes articles that point at downloads
//! - [`text`] — readable-text extraction from article HTML

pub mod article;
pub mod cleanup;
pub mod text;

pub use article::{ArticleScraper, ScrapeOptions};
pub use cleanup::FileUrlCleanup;
pub use text::{MIN_CONTENT_CHARS, extract_article_text};
