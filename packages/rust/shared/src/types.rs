//! Core domain types for DocDrift.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Render a timestamp in the fixed-width form stored in the database.
///
/// Millisecond precision with a `Z` suffix keeps lexical order equal to
/// chronological order, which the window queries rely on.
pub fn sortable_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// BatchId
// ---------------------------------------------------------------------------

/// A UUID v7 identifier for one batch window pass (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Generate a new time-sortable batch identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// ConversationId
// ---------------------------------------------------------------------------

/// Deterministic conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Derive the id from the channel key and the conversation's first member.
    ///
    /// A missing channel hashes differently from every named channel,
    /// including the empty string.
    pub fn derive(channel: Option<&str>, first_at: &DateTime<Utc>, first_id: &str) -> Self {
        let mut hasher = Sha256::new();
        match channel {
            Some(name) => {
                hasher.update(b"c:");
                hasher.update(name.as_bytes());
            }
            None => hasher.update(b"n:"),
        }
        hasher.update(b"\0");
        hasher.update(first_at.timestamp_millis().to_be_bytes());
        hasher.update(b"\0");
        hasher.update(first_id.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("conv-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Processing status of an ingested message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Completed,
    Failed,
}

impl MessageStatus {
    /// Column value used by the storage layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A normalized message written by an upstream connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Owning stream.
    pub stream_id: String,
    /// Identifier in the source system (e.g. a chat message id).
    pub source_id: String,
    /// When the message was posted upstream.
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub content: String,
    /// Channel or topic; `None` when the source has no such notion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Free-form source metadata (e.g. `{"reply_to": "..."}`).
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
}

fn default_status() -> MessageStatus {
    MessageStatus::Pending
}

impl Message {
    /// Source-native id of the message this one replies to, if recorded.
    pub fn reply_to(&self) -> Option<&str> {
        self.metadata.get("reply_to").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

/// Per-stream processing checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub stream_id: String,
    /// Lower bound of the next batch window.
    pub watermark_time: DateTime<Utc>,
    /// When the last batch for this stream committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_batch_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Structured search hints produced by classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalCriteria {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub semantic_query: String,
}

impl RetrievalCriteria {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.semantic_query.trim().is_empty()
    }
}

/// A persisted classification row for one valuable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub message_id: String,
    pub batch_id: String,
    pub conversation_id: String,
    pub category: String,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Retrieval context
// ---------------------------------------------------------------------------

/// A scored documentation passage returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    /// Path of the source document within the docs corpus.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    /// Higher is more relevant.
    pub score: f64,
}

/// Retrieved grounding for one conversation within one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub batch_id: String,
    /// Query text sent to the similarity search.
    pub query: String,
    pub passages: Vec<RetrievedPassage>,
    /// Estimated prompt tokens consumed by `passages`.
    pub token_count: u64,
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// Kind of documentation edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Insert,
    Update,
    Delete,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Human review state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Pending,
    Approved,
    Rejected,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A candidate documentation edit awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub batch_id: String,
    pub conversation_id: String,
    pub kind: UpdateKind,
    /// Target documentation page.
    pub page: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub suggested_text: String,
    pub reasoning: String,
    /// Messages this edit is derived from. Never empty once persisted.
    pub source_message_ids: Vec<String>,
    pub review_state: ReviewState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Streams and reference docs
// ---------------------------------------------------------------------------

/// Connector registration for a stream. Owned by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_id: String,
    pub connector_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub enabled: bool,
}

/// A documentation page indexed for similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDoc {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn batch_id_is_unique() {
        assert_ne!(BatchId::new(), BatchId::new());
    }

    #[test]
    fn batch_id_display_and_parse() {
        let id = BatchId::new();
        let parsed: BatchId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn sortable_timestamp_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(sortable_timestamp(&a), "2026-01-02T03:04:05.000Z");
        let b = a + chrono::Duration::milliseconds(7);
        assert!(sortable_timestamp(&a) < sortable_timestamp(&b));
    }

    #[test]
    fn conversation_id_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = ConversationId::derive(Some("help"), &t, "m1");
        let b = ConversationId::derive(Some("help"), &t, "m1");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("conv-"));
    }

    #[test]
    fn conversation_id_separates_missing_and_empty_channel() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let none = ConversationId::derive(None, &t, "m1");
        let empty = ConversationId::derive(Some(""), &t, "m1");
        assert_ne!(none, empty);
    }

    #[test]
    fn message_reply_to_reads_metadata() {
        let msg = Message {
            id: "m2".into(),
            stream_id: "s".into(),
            source_id: "src-2".into(),
            timestamp: Utc::now(),
            author: "ana".into(),
            content: "same here".into(),
            channel: Some("help".into()),
            metadata: serde_json::json!({ "reply_to": "src-1" }),
            status: MessageStatus::Pending,
        };
        assert_eq!(msg.reply_to(), Some("src-1"));
    }

    #[test]
    fn message_deserializes_with_defaults() {
        let json = r#"{"id":"m1","stream_id":"s","source_id":"x","timestamp":"2026-01-01T00:00:00Z","author":"a","content":"hi"}"#;
        let msg: Message = serde_json::from_str(json).expect("parse");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.channel.is_none());
        assert!(msg.reply_to().is_none());
    }

    #[test]
    fn enum_string_forms() {
        assert_eq!(MessageStatus::parse("COMPLETED"), Some(MessageStatus::Completed));
        assert_eq!(UpdateKind::parse("UPDATE"), Some(UpdateKind::Update));
        assert_eq!(UpdateKind::parse("rewrite"), None);
        assert_eq!(ReviewState::Pending.as_str(), "pending");
    }
}
