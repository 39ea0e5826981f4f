//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docdrift_core::{
    BatchCoordinator, BatchProgress, OpenRouterClient, RunReport, RunScope, StorageSearch,
};
use docdrift_shared::{
    AppConfig, DocDriftError, Message, MessageStatus, ReferenceDoc, ReviewState, init_config,
    load_config, load_config_from, validate_api_key,
};
use docdrift_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DocDrift — turn community conversations into documentation proposals.
#[derive(Parser)]
#[command(
    name = "docdrift",
    version,
    about = "Incrementally turn chat streams into reviewable documentation proposals.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.docdrift/docdrift.toml).
    #[arg(long, global = true, env = "DOCDRIFT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process all pending work once.
    Run {
        /// Only process this stream.
        #[arg(long)]
        stream: Option<String>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Process pending work every `batch.poll_interval_secs` until interrupted.
    Watch {
        /// Only process this stream.
        #[arg(long)]
        stream: Option<String>,
    },

    /// Show per-stream message counts and watermarks.
    Status,

    /// List documentation proposals.
    Proposals {
        /// Review state filter: pending, approved, or rejected.
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of proposals to show.
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Print proposals as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Import messages from a JSON Lines file as PENDING.
    Import {
        /// Path to the .jsonl file (one message object per line).
        file: PathBuf,

        /// Override the stream id of every imported message.
        #[arg(long)]
        stream: Option<String>,
    },

    /// Index a directory of markdown files as reference documentation.
    IndexDocs {
        /// Root directory of the documentation tree.
        dir: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docdrift=info",
        1 => "docdrift=debug",
        _ => "docdrift=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { stream, json } => cmd_run(config_path, stream, json).await,
        Command::Watch { stream } => cmd_watch(config_path, stream).await,
        Command::Status => cmd_status(config_path).await,
        Command::Proposals { state, limit, json } => {
            cmd_proposals(config_path, state.as_deref(), limit, json).await
        }
        Command::Import { file, stream } => cmd_import(config_path, &file, stream.as_deref()).await,
        Command::IndexDocs { dir } => cmd_index_docs(config_path, &dir).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = config.database_path()?;
    Ok(Arc::new(Storage::open(&path).await?))
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Storage> {
    let path = config.database_path()?;
    if !path.exists() {
        return Err(eyre!(
            "no database at '{}'; import messages or run first",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

fn build_coordinator(config: &AppConfig, storage: Arc<Storage>) -> Result<BatchCoordinator> {
    let api_key = validate_api_key(config)?;
    let llm = Arc::new(OpenRouterClient::new(&config.llm, api_key)?);
    let search = Arc::new(StorageSearch::new(storage.clone()));
    Ok(BatchCoordinator::from_config(config, storage, llm, search)?)
}

fn scope(stream: Option<String>) -> RunScope {
    match stream {
        Some(id) => RunScope::Stream(id),
        None => RunScope::AllStreams,
    }
}

// ---------------------------------------------------------------------------
// run / watch
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, stream: Option<String>, json: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_storage(&config).await?;
    let coordinator = build_coordinator(&config, storage)?;

    let reporter = CliProgress::new()?;
    let report = coordinator.run_with_progress(scope(stream), &reporter).await?;
    reporter.finish();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn cmd_watch(config_path: Option<&Path>, stream: Option<String>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_storage(&config).await?;
    let coordinator = build_coordinator(&config, storage)?;
    let interval = std::time::Duration::from_secs(config.batch.poll_interval_secs);

    info!(interval_secs = interval.as_secs(), "watching for pending messages");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.run(scope(stream.clone())).await {
                    Ok(report) if report.messages_completed > 0 || report.batches_failed > 0 => {
                        info!(
                            messages = report.messages_completed,
                            batches = report.batches_committed,
                            failed = report.batches_failed,
                            proposals = report.proposals_created,
                            "tick complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    if report.busy {
        println!("  Another run is in progress; nothing done.");
        println!();
        return;
    }
    println!("  Batch run complete");
    println!("  Messages:   {}", report.messages_completed);
    println!("  Batches:    {} committed, {} failed", report.batches_committed, report.batches_failed);
    println!("  Skipped:    {} empty windows", report.empty_windows_skipped);
    println!(
        "  Proposals:  {} created, {} discarded",
        report.proposals_created, report.proposals_discarded
    );
    println!(
        "  Model:      {} calls, {} tokens in, {} tokens out",
        report.metrics.model_calls(),
        report.metrics.tokens_in(),
        report.metrics.tokens_out()
    );
    for stream in &report.streams {
        let status = stream.error.as_deref().unwrap_or("ok");
        println!(
            "    {:<24} {:>5} msgs  {:>3} batches  {}",
            stream.stream_id, stream.messages_completed, stream.batches_committed, status
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Result<Self> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        spinner.set_message("Looking for pending streams");
        Ok(Self { spinner })
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl BatchProgress for CliProgress {
    fn stream_started(&self, stream_id: &str) {
        self.spinner.set_message(format!("Processing {stream_id}"));
    }

    fn batch_committed(&self, stream_id: &str, messages: usize, proposals: usize) {
        self.spinner.set_message(format!(
            "{stream_id}: committed {messages} messages, {proposals} proposals"
        ));
    }

    fn batch_failed(&self, stream_id: &str, error: &DocDriftError) {
        self.spinner.println(format!("  {stream_id}: batch failed: {error}"));
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_storage_readonly(&config).await?;

    let counts = storage.stream_counts().await?;
    let watermarks = storage.list_watermarks().await?;
    let docs = storage.count_reference_docs().await?;

    println!();
    println!(
        "  {:<24} {:>8} {:>10} {:>7}  {:<24} {}",
        "STREAM", "PENDING", "COMPLETED", "FAILED", "WATERMARK", "LAST BATCH"
    );
    for c in &counts {
        let wm = watermarks.iter().find(|w| w.stream_id == c.stream_id);
        let watermark = wm
            .map(|w| w.watermark_time.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        let last = wm
            .and_then(|w| w.last_batch_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:<24} {:>8} {:>10} {:>7}  {:<24} {}",
            c.stream_id, c.pending, c.completed, c.failed, watermark, last
        );
    }
    if counts.is_empty() {
        println!("  (no messages)");
    }
    println!();
    println!("  Reference docs indexed: {docs}");
    println!();
    Ok(())
}

async fn cmd_proposals(
    config_path: Option<&Path>,
    state: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let state = match state {
        Some(s) => Some(ReviewState::parse(s).ok_or_else(|| {
            eyre!("invalid state '{s}': expected 'pending', 'approved', or 'rejected'")
        })?),
        None => None,
    };

    let config = resolve_config(config_path)?;
    let storage = open_storage_readonly(&config).await?;
    let proposals = storage.list_proposals(state, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&proposals)?);
        return Ok(());
    }

    if proposals.is_empty() {
        println!("No proposals.");
        return Ok(());
    }
    for p in &proposals {
        let target = match &p.section {
            Some(section) => format!("{} § {section}", p.page),
            None => p.page.clone(),
        };
        println!();
        println!("  [{}] {} {}", p.review_state.as_str(), p.kind.as_str(), target);
        println!("  id: {}  conversation: {}", p.id, p.conversation_id);
        println!("  sources: {}", p.source_message_ids.join(", "));
        println!("  why: {}", p.reasoning);
        for line in p.suggested_text.lines() {
            println!("    | {line}");
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingestion helpers
// ---------------------------------------------------------------------------

async fn cmd_import(config_path: Option<&Path>, file: &Path, stream: Option<&str>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_storage(&config).await?;

    let content = std::fs::read_to_string(file).map_err(|e| DocDriftError::io(file, e))?;
    let mut inserted = 0usize;
    let mut duplicates = 0usize;

    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut message: Message = serde_json::from_str(line)
            .map_err(|e| eyre!("{}:{}: invalid message: {e}", file.display(), n + 1))?;
        if let Some(stream) = stream {
            message.stream_id = stream.to_string();
        }
        message.status = MessageStatus::Pending;

        if storage.insert_message(&message).await? {
            inserted += 1;
        } else {
            duplicates += 1;
        }
    }

    info!(inserted, duplicates, file = %file.display(), "import complete");
    println!("Imported {inserted} messages ({duplicates} already present).");
    Ok(())
}

async fn cmd_index_docs(config_path: Option<&Path>, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(eyre!("'{}' is not a directory", dir.display()));
    }
    let config = resolve_config(config_path)?;
    let storage = open_storage(&config).await?;

    let mut files = Vec::new();
    collect_markdown(dir, &mut files)?;
    files.sort();

    for path in &files {
        let content = std::fs::read_to_string(path).map_err(|e| DocDriftError::io(path, e))?;
        let relative = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        storage
            .upsert_reference_doc(&ReferenceDoc {
                title: markdown_title(&content),
                path: relative,
                content,
            })
            .await?;
    }

    let total = storage.count_reference_docs().await?;
    info!(indexed = files.len(), total, "reference docs indexed");
    println!("Indexed {} files ({total} documents total).", files.len());
    Ok(())
}

fn collect_markdown(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| DocDriftError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| DocDriftError::io(dir, e))?.path();
        if path.is_dir() {
            collect_markdown(&path, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("md" | "markdown" | "mdx")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

/// First level-one heading, if any.
fn markdown_title(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
