//! Core incremental pipeline for DocDrift.
//!
//! This crate ties together watermarks, conversation grouping, the
//! language-model stages and the batch coordinator that drives them.

pub mod classify;
pub mod coordinator;
pub mod enrich;
pub mod generate;
pub mod grouping;
pub mod llm;
pub mod orchestrator;
pub mod search;
pub mod watermark;

pub use coordinator::{
    BatchCoordinator, BatchProgress, RunReport, RunScope, SilentProgress, StreamReport,
};
pub use grouping::{Conversation, MessageTag, group_conversations};
pub use llm::{LanguageModel, OpenRouterClient};
pub use orchestrator::{DomainProfile, Pipeline, PipelineContext, PipelineMetrics, PipelineStep};
pub use search::{DocumentSearch, StorageSearch};
pub use watermark::WatermarkManager;
