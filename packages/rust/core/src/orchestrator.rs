//! Pipeline orchestrator.
//!
//! A batch flows through an ordered list of [`PipelineStep`]s sharing one
//! [`PipelineContext`]. The list comes from `[pipeline] steps`; the step
//! behavior (keyword filter, taxonomy, prompt preamble) comes from the
//! active [`DomainProfile`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, info, instrument};

use docdrift_shared::{
    AppConfig, BatchId, ClassificationRecord, ConversationContext, DocDriftError, DomainConfig,
    GroupingConfig, KNOWN_STEPS, Message, Proposal, RagConfig, Result,
};
use docdrift_storage::BatchCommit;

use crate::classify::{self, ClassificationRequest, ClassifiedThread};
use crate::enrich;
use crate::generate::{self, GenerationRequest};
use crate::grouping::{Conversation, MessageTag, group_conversations};
use crate::llm::{LanguageModel, ModelMetadata};
use crate::search::DocumentSearch;

// ---------------------------------------------------------------------------
// Domain profile
// ---------------------------------------------------------------------------

/// Compiled per-deployment behavior.
#[derive(Debug, Clone)]
pub struct DomainProfile {
    pub name: String,
    keywords: Vec<Regex>,
    pub categories: Vec<String>,
    pub preamble: String,
}

impl DomainProfile {
    pub fn from_config(domain: &DomainConfig) -> Result<Self> {
        let keywords = domain
            .keywords
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        DocDriftError::config(format!(
                            "domain '{}': invalid keyword pattern '{pattern}': {e}",
                            domain.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: domain.name.clone(),
            keywords,
            categories: domain.categories.clone(),
            preamble: domain.preamble.clone(),
        })
    }

    /// True when the profile has no keyword filter or `text` matches one.
    pub fn matches(&self, text: &str) -> bool {
        self.keywords.is_empty() || self.keywords.iter().any(|re| re.is_match(text))
    }
}

// ---------------------------------------------------------------------------
// Context and metrics
// ---------------------------------------------------------------------------

/// Per-step measurements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepMetrics {
    pub step: String,
    pub runs: u64,
    pub duration_ms: u64,
    pub model_calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub items_in: u64,
    pub items_out: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineMetrics {
    pub steps: Vec<StepMetrics>,
}

impl PipelineMetrics {
    pub fn model_calls(&self) -> u64 {
        self.steps.iter().map(|s| s.model_calls).sum()
    }

    pub fn tokens_in(&self) -> u64 {
        self.steps.iter().map(|s| s.tokens_in).sum()
    }

    pub fn tokens_out(&self) -> u64 {
        self.steps.iter().map(|s| s.tokens_out).sum()
    }

    /// Fold another batch's metrics in, summing per step name.
    pub fn absorb(&mut self, other: &PipelineMetrics) {
        for incoming in &other.steps {
            match self.steps.iter_mut().find(|s| s.step == incoming.step) {
                Some(existing) => {
                    existing.runs += incoming.runs;
                    existing.duration_ms += incoming.duration_ms;
                    existing.model_calls += incoming.model_calls;
                    existing.tokens_in += incoming.tokens_in;
                    existing.tokens_out += incoming.tokens_out;
                    existing.items_in += incoming.items_in;
                    existing.items_out += incoming.items_out;
                }
                None => self.steps.push(incoming.clone()),
            }
        }
    }
}

/// What one step reports back to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub items_in: usize,
    pub items_out: usize,
    pub model_calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl StepReport {
    fn items(items_in: usize, items_out: usize) -> Self {
        Self {
            items_in,
            items_out,
            ..Self::default()
        }
    }

    fn record_call(&mut self, metadata: &ModelMetadata) {
        self.model_calls += 1;
        self.tokens_in += metadata.tokens_in;
        self.tokens_out += metadata.tokens_out;
    }
}

/// Mutable state shared by the steps of one batch.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub stream_id: String,
    pub batch_id: BatchId,
    /// Every PENDING message in the batch window.
    pub messages: Vec<Message>,
    /// Recently completed messages, shown to the model for context.
    pub context_messages: Vec<Message>,
    /// Messages that survived filtering; starts as `messages`.
    pub filtered: Vec<Message>,
    pub tags: Vec<MessageTag>,
    pub threads: Vec<ClassifiedThread>,
    pub conversations: Vec<Conversation>,
    pub contexts: Vec<ConversationContext>,
    pub proposals: Vec<Proposal>,
    pub discarded_proposals: usize,
    pub metrics: PipelineMetrics,
}

impl PipelineContext {
    pub fn new(
        stream_id: impl Into<String>,
        batch_id: BatchId,
        messages: Vec<Message>,
        context_messages: Vec<Message>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            batch_id,
            filtered: messages.clone(),
            messages,
            context_messages,
            tags: Vec::new(),
            threads: Vec::new(),
            conversations: Vec::new(),
            contexts: Vec::new(),
            proposals: Vec::new(),
            discarded_proposals: 0,
            metrics: PipelineMetrics::default(),
        }
    }

    /// One classification row per grouped member.
    pub fn classification_records(&self, now: DateTime<Utc>) -> Vec<ClassificationRecord> {
        self.conversations
            .iter()
            .flat_map(|conv| {
                conv.members.iter().map(move |member| ClassificationRecord {
                    message_id: member.message.id.clone(),
                    batch_id: self.batch_id.to_string(),
                    conversation_id: conv.id.to_string(),
                    category: member.category.clone(),
                    reasoning: member.reason.clone(),
                    created_at: now,
                })
            })
            .collect()
    }

    /// Everything the batch produced, ready for a single transactional write.
    ///
    /// Every batch message is completed, including those the filter dropped.
    pub fn into_commit(self, advance_to: DateTime<Utc>, now: DateTime<Utc>) -> BatchCommit {
        BatchCommit {
            classifications: self.classification_records(now),
            batch_id: self.batch_id.to_string(),
            completed_message_ids: self.messages.iter().map(|m| m.id.clone()).collect(),
            stream_id: self.stream_id,
            contexts: self.contexts,
            proposals: self.proposals,
            advance_to,
            committed_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One stage of the batch pipeline.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Stable name, one of `filter`, `classify`, `group`, `enrich`, `generate`.
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepReport>;
}

/// Drops messages that match none of the domain's keyword patterns.
pub struct FilterStep {
    profile: Arc<DomainProfile>,
}

impl FilterStep {
    pub fn new(profile: Arc<DomainProfile>) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl PipelineStep for FilterStep {
    fn name(&self) -> &'static str {
        "filter"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepReport> {
        let before = ctx.filtered.len();
        ctx.filtered.retain(|m| self.profile.matches(&m.content));
        Ok(StepReport::items(before, ctx.filtered.len()))
    }
}

pub struct ClassifyStep {
    llm: Arc<dyn LanguageModel>,
    profile: Arc<DomainProfile>,
    timeout: Duration,
}

impl ClassifyStep {
    pub fn new(llm: Arc<dyn LanguageModel>, profile: Arc<DomainProfile>, timeout: Duration) -> Self {
        Self {
            llm,
            profile,
            timeout,
        }
    }
}

#[async_trait]
impl PipelineStep for ClassifyStep {
    fn name(&self) -> &'static str {
        "classify"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepReport> {
        let request = ClassificationRequest {
            messages: &ctx.filtered,
            context: &ctx.context_messages,
            categories: &self.profile.categories,
            preamble: &self.profile.preamble,
        };
        let outcome = classify::classify_messages(self.llm.as_ref(), self.timeout, &request).await?;

        let mut report = StepReport::items(ctx.filtered.len(), outcome.tags.len());
        if let Some(metadata) = &outcome.metadata {
            report.record_call(metadata);
        }
        ctx.tags = outcome.tags;
        ctx.threads = outcome.threads;
        Ok(report)
    }
}

pub struct GroupStep {
    config: GroupingConfig,
}

impl GroupStep {
    pub fn new(config: GroupingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineStep for GroupStep {
    fn name(&self) -> &'static str {
        "group"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepReport> {
        ctx.conversations = group_conversations(&ctx.tags, &ctx.filtered, &self.config);
        Ok(StepReport::items(ctx.tags.len(), ctx.conversations.len()))
    }
}

pub struct EnrichStep {
    search: Arc<dyn DocumentSearch>,
    rag: RagConfig,
}

impl EnrichStep {
    pub fn new(search: Arc<dyn DocumentSearch>, rag: RagConfig) -> Self {
        Self { search, rag }
    }
}

#[async_trait]
impl PipelineStep for EnrichStep {
    fn name(&self) -> &'static str {
        "enrich"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepReport> {
        let batch_id = ctx.batch_id.to_string();
        let mut contexts = Vec::with_capacity(ctx.conversations.len());
        for conversation in &ctx.conversations {
            contexts
                .push(enrich::enrich_conversation(self.search.as_ref(), conversation, &batch_id, &self.rag).await?);
        }
        let passages = contexts.iter().map(|c| c.passages.len()).sum();
        let report = StepReport::items(ctx.conversations.len(), passages);
        ctx.contexts = contexts;
        Ok(report)
    }
}

pub struct GenerateStep {
    llm: Arc<dyn LanguageModel>,
    profile: Arc<DomainProfile>,
    timeout: Duration,
}

impl GenerateStep {
    pub fn new(llm: Arc<dyn LanguageModel>, profile: Arc<DomainProfile>, timeout: Duration) -> Self {
        Self {
            llm,
            profile,
            timeout,
        }
    }
}

#[async_trait]
impl PipelineStep for GenerateStep {
    fn name(&self) -> &'static str {
        "generate"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StepReport> {
        let batch_id = ctx.batch_id.to_string();
        let mut report = StepReport::items(ctx.conversations.len(), 0);
        let mut proposals = Vec::new();
        let mut discarded = 0;

        for conversation in &ctx.conversations {
            let context = ctx
                .contexts
                .iter()
                .find(|c| c.conversation_id == conversation.id.as_str());
            let request = GenerationRequest {
                conversation,
                context,
                batch_id: &batch_id,
                preamble: &self.profile.preamble,
            };
            let outcome = generate::generate_proposals(self.llm.as_ref(), self.timeout, &request).await?;
            report.record_call(&outcome.metadata);
            discarded += outcome.discarded;
            proposals.extend(outcome.proposals);
        }

        report.items_out = proposals.len();
        ctx.proposals = proposals;
        ctx.discarded_proposals = discarded;
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A validated, ordered list of steps.
pub struct Pipeline {
    steps: Vec<Box<dyn PipelineStep>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("steps", &self.step_names()).finish()
    }
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn PipelineStep>>) -> Result<Self> {
        let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
        validate_order(&names)?;
        Ok(Self { steps })
    }

    /// Build the configured step list for the active domain.
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn DocumentSearch>,
    ) -> Result<Self> {
        let profile = Arc::new(DomainProfile::from_config(&config.active_domain()?)?);
        let timeout = Duration::from_secs(config.llm.timeout_secs);

        let mut steps: Vec<Box<dyn PipelineStep>> = Vec::with_capacity(config.pipeline.steps.len());
        for name in &config.pipeline.steps {
            let step: Box<dyn PipelineStep> = match name.as_str() {
                "filter" => Box::new(FilterStep::new(profile.clone())),
                "classify" => Box::new(ClassifyStep::new(llm.clone(), profile.clone(), timeout)),
                "group" => Box::new(GroupStep::new(config.grouping)),
                "enrich" => Box::new(EnrichStep::new(search.clone(), config.rag.clone())),
                "generate" => Box::new(GenerateStep::new(llm.clone(), profile.clone(), timeout)),
                other => {
                    return Err(DocDriftError::config(format!("unknown pipeline step '{other}'")));
                }
            };
            steps.push(step);
        }

        info!(domain = %profile.name, steps = ?config.pipeline.steps, "pipeline built");
        Self::new(steps)
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order. The first failing step aborts the batch.
    #[instrument(skip_all, fields(stream = %ctx.stream_id, batch_id = %ctx.batch_id))]
    pub async fn execute(&self, ctx: &mut PipelineContext) -> Result<()> {
        for step in &self.steps {
            let start = Instant::now();
            let report = step.run(ctx).await?;
            let metrics = StepMetrics {
                step: step.name().to_string(),
                runs: 1,
                duration_ms: start.elapsed().as_millis() as u64,
                model_calls: report.model_calls,
                tokens_in: report.tokens_in,
                tokens_out: report.tokens_out,
                items_in: report.items_in as u64,
                items_out: report.items_out as u64,
            };
            debug!(
                step = step.name(),
                items_in = metrics.items_in,
                items_out = metrics.items_out,
                duration_ms = metrics.duration_ms,
                "step complete"
            );
            ctx.metrics.steps.push(metrics);
        }
        Ok(())
    }
}

fn validate_order(names: &[&str]) -> Result<()> {
    let position = |step: &str| names.iter().position(|n| *n == step);

    for (i, name) in names.iter().enumerate() {
        if !KNOWN_STEPS.contains(name) {
            return Err(DocDriftError::config(format!("unknown pipeline step '{name}'")));
        }
        if names[..i].contains(name) {
            return Err(DocDriftError::config(format!("pipeline step '{name}' listed twice")));
        }
    }

    let require_before = |first: &str, then: &str| -> Result<()> {
        match (position(first), position(then)) {
            (Some(a), Some(b)) if a > b => Err(DocDriftError::config(format!(
                "pipeline step '{first}' must run before '{then}'"
            ))),
            (None, Some(_)) => Err(DocDriftError::config(format!(
                "pipeline step '{then}' requires '{first}'"
            ))),
            _ => Ok(()),
        }
    };

    require_before("classify", "group")?;
    require_before("group", "enrich")?;
    require_before("group", "generate")?;
    if let (Some(enrich), Some(generate)) = (position("enrich"), position("generate")) {
        if enrich > generate {
            return Err(DocDriftError::config(
                "pipeline step 'enrich' must run before 'generate'",
            ));
        }
    }
    if let (Some(filter), Some(classify)) = (position("filter"), position("classify")) {
        if filter > classify {
            return Err(DocDriftError::config(
                "pipeline step 'filter' must run before 'classify'",
            ));
        }
    }
    // Tags without a conversation have nowhere to be persisted.
    if position("classify").is_some() && position("group").is_none() {
        return Err(DocDriftError::config("pipeline step 'classify' requires 'group'"));
    }
    Ok(())
}
