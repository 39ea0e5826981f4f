//! Application configuration for DocDrift.
//!
//! User config lives at `~/.docdrift/docdrift.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DocDriftError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docdrift.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docdrift";

/// Step names accepted in `[pipeline] steps`.
pub const KNOWN_STEPS: &[&str] = &["filter", "classify", "group", "enrich", "generate"];

// ---------------------------------------------------------------------------
// Config structs (matching docdrift.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Batch window and watermark settings.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Conversation grouping thresholds.
    #[serde(default)]
    pub grouping: GroupingConfig,

    /// Language-model provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Retrieval settings for the enrichment stage.
    #[serde(default)]
    pub rag: RagConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Deployment domains (keyword filters, category taxonomies).
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file. A leading `~/` expands to home.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.docdrift/docdrift.db".into()
}

/// `[batch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Width of one batch window.
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// Maximum PENDING messages processed per window.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// How far before the window to look for already-processed context.
    #[serde(default = "default_context_window_hours")]
    pub context_window_hours: u32,

    /// Maximum context messages included in the classification prompt.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: u32,

    /// Watermark seed for streams with no pending messages.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Seconds between runs in `docdrift watch`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Windows end this many seconds before the run starts, so messages
    /// written shortly after their own timestamp land ahead of the watermark.
    #[serde(default = "default_ingest_lag")]
    pub ingest_lag_secs: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            max_batch_size: default_max_batch_size(),
            context_window_hours: default_context_window_hours(),
            max_context_messages: default_max_context_messages(),
            lookback_days: default_lookback_days(),
            poll_interval_secs: default_poll_interval(),
            ingest_lag_secs: default_ingest_lag(),
        }
    }
}

fn default_window_hours() -> u32 {
    24
}
fn default_max_batch_size() -> u32 {
    200
}
fn default_context_window_hours() -> u32 {
    24
}
fn default_max_context_messages() -> u32 {
    50
}
fn default_lookback_days() -> u32 {
    7
}
fn default_poll_interval() -> u64 {
    300
}
fn default_ingest_lag() -> u32 {
    60
}

impl BatchConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }

    pub fn context_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.context_window_hours))
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }

    pub fn ingest_lag(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.ingest_lag_secs))
    }
}

/// `[grouping]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Nominal conversation window. Read by existing config files but not a
    /// split rule: only channel, `min_gap_minutes` and `max_conversation_size`
    /// end a conversation.
    #[serde(default = "default_time_window_minutes")]
    pub time_window_minutes: u32,

    /// Maximum members per conversation.
    #[serde(default = "default_max_conversation_size")]
    pub max_conversation_size: usize,

    /// A gap strictly larger than this starts a new conversation.
    #[serde(default = "default_min_gap_minutes")]
    pub min_gap_minutes: u32,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            time_window_minutes: default_time_window_minutes(),
            max_conversation_size: default_max_conversation_size(),
            min_gap_minutes: default_min_gap_minutes(),
        }
    }
}

fn default_time_window_minutes() -> u32 {
    60
}
fn default_max_conversation_size() -> usize {
    20
}
fn default_min_gap_minutes() -> u32 {
    15
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Deadline for a single model call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1/".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.2
}

/// `[rag]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Passages retrieved per conversation.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Token budget for retrieved passages in the generation prompt.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_context_tokens() -> u64 {
    6_000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered step names.
    #[serde(default = "default_steps")]
    pub steps: Vec<String>,

    /// Name of the `[[domains]]` entry to use.
    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            domain: default_domain(),
        }
    }
}

fn default_steps() -> Vec<String> {
    KNOWN_STEPS.iter().map(|s| (*s).to_string()).collect()
}
fn default_domain() -> String {
    "default".into()
}

/// `[[domains]]` entry: keyword filter, taxonomy and prompt preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,

    /// Keep only messages mentioning one of these (case-insensitive regexes).
    /// Empty keeps everything.
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Allowed classification categories. Empty accepts any category.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// Extra instructions prepended to every prompt.
    #[serde(default)]
    pub preamble: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: default_domain(),
            keywords: Vec::new(),
            categories: default_categories(),
            preamble: String::new(),
        }
    }
}

fn default_categories() -> Vec<String> {
    ["troubleshooting", "how-to", "configuration", "bug-report", "feature-gap"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl AppConfig {
    /// The domain selected by `[pipeline] domain`, or the built-in default.
    pub fn active_domain(&self) -> Result<DomainConfig> {
        match self.domains.iter().find(|d| d.name == self.pipeline.domain) {
            Some(domain) => Ok(domain.clone()),
            None if self.pipeline.domain == default_domain() => Ok(DomainConfig::default()),
            None => Err(DocDriftError::config(format!(
                "pipeline domain '{}' is not defined in [[domains]]",
                self.pipeline.domain
            ))),
        }
    }

    /// Resolve the database path, expanding a leading `~/`.
    pub fn database_path(&self) -> Result<PathBuf> {
        match self.database.path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    DocDriftError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.database.path)),
        }
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.batch.window_hours == 0 {
            return Err(DocDriftError::config("batch.window_hours must be > 0"));
        }
        if self.batch.max_batch_size == 0 {
            return Err(DocDriftError::config("batch.max_batch_size must be > 0"));
        }
        if self.grouping.max_conversation_size == 0 {
            return Err(DocDriftError::config(
                "grouping.max_conversation_size must be > 0",
            ));
        }
        if self.llm.timeout_secs == 0 {
            return Err(DocDriftError::config("llm.timeout_secs must be > 0"));
        }
        url::Url::parse(&self.llm.base_url)
            .map_err(|e| DocDriftError::config(format!("llm.base_url is not a URL: {e}")))?;
        for step in &self.pipeline.steps {
            if !KNOWN_STEPS.contains(&step.as_str()) {
                return Err(DocDriftError::config(format!(
                    "unknown pipeline step '{step}' (expected one of {KNOWN_STEPS:?})"
                )));
            }
        }
        self.active_domain()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docdrift/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DocDriftError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docdrift/docdrift.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocDriftError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DocDriftError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocDriftError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocDriftError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocDriftError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the language-model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DocDriftError::config(format!(
            "language model API key not found. Set the {var_name} environment variable."
        ))),
    }
}
