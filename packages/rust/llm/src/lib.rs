//! LLM-backed pipeline stages for feedwatch.
//!
//! - [`LlmClient`] — OpenAI/Anthropic chat and OpenAI embeddings with retries
//! - [`TitleRelevance`] — screens feed titles before they are stored
//! - [`Summarizer`] — the cost-gated enrichment stage
//! - [`SummaryEmbedder`] — embeds summaries for later search

pub mod client;
pub mod embed;
pub mod relevance;
pub mod summarize;

pub use client::{ChatRequest, Completion, LlmClient};
pub use embed::SummaryEmbedder;
pub use relevance::{RELEVANCE_BATCH, TitleRelevance};
pub use summarize::{MAX_INPUT_CHARS, Summarizer};
