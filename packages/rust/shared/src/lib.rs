//! Shared types, error model, and configuration for DocDrift.
//!
//! This crate is the foundation depended on by all other DocDrift crates.
//! It provides:
//! - [`DocDriftError`] — the unified error type
//! - Domain types ([`Message`], [`Watermark`], [`Proposal`], [`ConversationContext`], ...)
//! - Configuration ([`AppConfig`], [`GroupingConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, DatabaseConfig, DomainConfig, GroupingConfig, KNOWN_STEPS, LlmConfig,
    PipelineConfig, RagConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_api_key,
};
pub use error::{DocDriftError, Result};
pub use types::{
    BatchId, ClassificationRecord, ConversationContext, ConversationId, Message, MessageStatus,
    Proposal, ReferenceDoc, RetrievalCriteria, RetrievedPassage, ReviewState, StreamDescriptor,
    UpdateKind, Watermark, sortable_timestamp,
};
