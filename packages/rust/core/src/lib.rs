//! Pipeline orchestration for feedwatch.
//!
//! This crate owns the run controller and its building blocks: the
//! single-flight gate, the approval checkpoint, session token accounting,
//! and model pricing. Stage work is supplied through the traits in
//! [`stages`].

pub mod approval;
pub mod controller;
pub mod cost;
pub mod gate;
pub mod pricing;
pub mod scheduler;
pub mod stages;

pub use approval::{ApprovalOutcome, ApprovalRendezvous, DEFAULT_APPROVAL_TIMEOUT};
pub use controller::{PipelineController, RunSnapshot};
pub use cost::{SessionCostAccountant, TokenUsage, estimate_summarization_cost};
pub use gate::{ConcurrencyGate, GateGuard};
pub use pricing::{
    FALLBACK_PRICING, ModelPricing, PRICING_TABLE, PricingEntry, lookup_pricing, matching_entry,
};
pub use scheduler::{SchedulerHandle, spawn_scheduler};
pub use stages::{
    AcceptAll, Cleanup, ContentExtractor, Embedder, Enricher, FeedSource, PipelineStages,
    ProviderInfo, RelevanceFilter,
};
