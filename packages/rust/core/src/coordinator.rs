//! Batch coordinator: the top-level incremental driver.
//!
//! For every stream with pending work, walk batch windows forward from the
//! stream's watermark, run the pipeline over each window and commit the
//! results in one transaction. A failed window leaves its messages PENDING
//! and its watermark untouched; the next run sees exactly the same window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use docdrift_shared::{AppConfig, BatchConfig, BatchId, DocDriftError, Message, Result};
use docdrift_storage::Storage;

use crate::llm::LanguageModel;
use crate::orchestrator::{Pipeline, PipelineContext, PipelineMetrics};
use crate::search::DocumentSearch;
use crate::watermark::WatermarkManager;

/// Which streams a run may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    AllStreams,
    /// Process only this stream (isolated mode).
    Stream(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamReport {
    pub stream_id: String,
    pub messages_completed: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub empty_windows_skipped: u64,
    /// PENDING messages found behind the watermark; never processed.
    pub late_messages: u64,
    pub proposals_created: u64,
    pub proposals_discarded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamReport {
    fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            ..Self::default()
        }
    }
}

/// Outcome of one coordinator invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Another run held the single-flight guard; nothing was done. This is
    /// the concurrency outcome: it is reported here, never as an error.
    pub busy: bool,
    pub messages_completed: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub empty_windows_skipped: u64,
    pub proposals_created: u64,
    pub proposals_discarded: u64,
    pub streams: Vec<StreamReport>,
    pub metrics: PipelineMetrics,
}

impl RunReport {
    fn busy() -> Self {
        Self {
            busy: true,
            ..Self::default()
        }
    }

    fn add_stream(&mut self, stream: StreamReport) {
        self.messages_completed += stream.messages_completed;
        self.batches_committed += stream.batches_committed;
        self.batches_failed += stream.batches_failed;
        self.empty_windows_skipped += stream.empty_windows_skipped;
        self.proposals_created += stream.proposals_created;
        self.proposals_discarded += stream.proposals_discarded;
        self.streams.push(stream);
    }
}

/// Progress callbacks for interactive frontends.
pub trait BatchProgress: Send + Sync {
    fn stream_started(&self, stream_id: &str);
    fn batch_committed(&self, stream_id: &str, messages: usize, proposals: usize);
    fn batch_failed(&self, stream_id: &str, error: &DocDriftError);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn stream_started(&self, _stream_id: &str) {}
    fn batch_committed(&self, _stream_id: &str, _messages: usize, _proposals: usize) {}
    fn batch_failed(&self, _stream_id: &str, _error: &DocDriftError) {}
}

/// Holds the single-flight flag for the lifetime of a run.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct BatchOutcome {
    messages: usize,
    proposals: usize,
    discarded: usize,
    metrics: PipelineMetrics,
}

pub struct BatchCoordinator {
    storage: Arc<Storage>,
    pipeline: Pipeline,
    watermarks: WatermarkManager,
    batch: BatchConfig,
    running: AtomicBool,
}

impl BatchCoordinator {
    pub fn new(storage: Arc<Storage>, pipeline: Pipeline, batch: BatchConfig) -> Self {
        let watermarks = WatermarkManager::new(storage.clone(), batch.lookback());
        Self {
            storage,
            pipeline,
            watermarks,
            batch,
            running: AtomicBool::new(false),
        }
    }

    /// Build the configured pipeline and a coordinator around it.
    pub fn from_config(
        config: &AppConfig,
        storage: Arc<Storage>,
        llm: Arc<dyn LanguageModel>,
        search: Arc<dyn DocumentSearch>,
    ) -> Result<Self> {
        let pipeline = Pipeline::from_config(config, llm, search)?;
        Ok(Self::new(storage, pipeline, config.batch.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run(&self, scope: RunScope) -> Result<RunReport> {
        self.run_with_progress(scope, &SilentProgress).await
    }

    /// Process pending work for every stream in `scope`.
    ///
    /// Returns immediately with `busy = true` if another run is in flight.
    /// Batch failures are recorded in the report, not returned as errors.
    #[instrument(skip_all, fields(scope = ?scope))]
    pub async fn run_with_progress(
        &self,
        scope: RunScope,
        progress: &dyn BatchProgress,
    ) -> Result<RunReport> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            info!("batch run already in progress; skipping");
            return Ok(RunReport::busy());
        };

        let mut streams = self.storage.list_pending_streams().await?;
        if let RunScope::Stream(only) = &scope {
            streams.retain(|s| s == only);
        }
        info!(streams = streams.len(), "starting batch run");

        let mut report = RunReport::default();
        for stream_id in streams {
            progress.stream_started(&stream_id);
            let mut stream = StreamReport::new(&stream_id);
            if let Err(e) = self
                .drain_stream(&stream_id, &mut stream, &mut report.metrics, progress)
                .await
            {
                error!(stream = %stream_id, error = %e, "stream aborted");
                stream.error = Some(e.to_string());
            }
            report.add_stream(stream);
        }

        info!(
            messages = report.messages_completed,
            batches = report.batches_committed,
            failed = report.batches_failed,
            proposals = report.proposals_created,
            "batch run complete"
        );
        Ok(report)
    }

    /// Walk one stream's windows until it has no pending work at or after
    /// its watermark, or a batch fails.
    #[instrument(skip_all, fields(stream = stream_id))]
    async fn drain_stream(
        &self,
        stream_id: &str,
        report: &mut StreamReport,
        metrics: &mut PipelineMetrics,
        progress: &dyn BatchProgress,
    ) -> Result<()> {
        let mut watermark = self.watermarks.initialize(stream_id).await?.watermark_time;
        report.watermark = Some(watermark);

        let late = self.storage.count_pending_before(stream_id, watermark).await?;
        if late > 0 {
            warn!(late, watermark = %watermark, "pending messages behind watermark are not reprocessed");
            report.late_messages = late;
        }

        let window = self.batch.window();
        let lag = self.batch.ingest_lag();
        loop {
            if !self.storage.has_pending_since(stream_id, watermark).await? {
                break;
            }

            let horizon = Utc::now() - lag;
            let start = watermark;
            let end = (start + window).min(horizon);
            if end <= start {
                break;
            }

            let messages = self
                .storage
                .fetch_pending_window(stream_id, start, end, self.batch.max_batch_size)
                .await?;

            if messages.is_empty() {
                watermark = self.watermarks.advance(stream_id, end).await?.watermark_time;
                report.watermark = Some(watermark);
                report.empty_windows_skipped += 1;
                debug!(%start, %end, "empty window skipped");
                // Remaining pending work is still inside the ingest lag.
                if end >= horizon {
                    break;
                }
                continue;
            }

            let capped = messages.len() >= self.batch.max_batch_size as usize;
            let advance_to = match messages.last() {
                Some(last) if capped => last.timestamp,
                _ => end,
            };

            match self
                .process_batch(stream_id, start, messages, advance_to)
                .await
            {
                Ok(outcome) => {
                    report.batches_committed += 1;
                    report.messages_completed += outcome.messages as u64;
                    report.proposals_created += outcome.proposals as u64;
                    report.proposals_discarded += outcome.discarded as u64;
                    metrics.absorb(&outcome.metrics);
                    progress.batch_committed(stream_id, outcome.messages, outcome.proposals);

                    watermark = watermark.max(advance_to);
                    report.watermark = Some(watermark);
                }
                Err(e) => {
                    report.batches_failed += 1;
                    report.error = Some(e.to_string());
                    progress.batch_failed(stream_id, &e);
                    warn!(
                        %start,
                        %end,
                        transient = e.is_transient(),
                        error = %e,
                        "batch failed; window will be retried next run"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run the pipeline over one window and commit everything it produced.
    #[instrument(skip_all, fields(batch_id = tracing::field::Empty, messages = messages.len()))]
    async fn process_batch(
        &self,
        stream_id: &str,
        window_start: DateTime<Utc>,
        messages: Vec<Message>,
        advance_to: DateTime<Utc>,
    ) -> Result<BatchOutcome> {
        let batch_id = BatchId::new();
        tracing::Span::current().record("batch_id", tracing::field::display(&batch_id));

        let context = self
            .storage
            .fetch_context_window(
                stream_id,
                window_start - self.batch.context_window(),
                window_start,
                self.batch.max_context_messages,
            )
            .await?;

        let mut ctx = PipelineContext::new(stream_id, batch_id.clone(), messages, context);
        self.pipeline.execute(&mut ctx).await?;

        let outcome = BatchOutcome {
            messages: ctx.messages.len(),
            proposals: ctx.proposals.len(),
            discarded: ctx.discarded_proposals,
            metrics: ctx.metrics.clone(),
        };

        let commit = ctx.into_commit(advance_to, Utc::now());
        if let Err(e) = self.storage.commit_batch(&commit).await {
            match self.storage.purge_batch(&commit.batch_id).await {
                Ok(0) => {}
                Ok(removed) => warn!(removed, "purged partial batch output"),
                Err(purge_err) => error!(error = %purge_err, "failed to purge partial batch output"),
            }
            return Err(e);
        }

        info!(
            messages = outcome.messages,
            proposals = outcome.proposals,
            advance_to = %advance_to,
            "batch committed"
        );
        Ok(outcome)
    }
}
