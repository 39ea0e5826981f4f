//! Classification stage.
//!
//! Asks the model which batch messages carry documentation value, grouped
//! into threads with a category and retrieval hints. The response is
//! validated in full before anything downstream sees it.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, instrument};

use docdrift_shared::{DocDriftError, Message, Result, RetrievalCriteria, sortable_timestamp};

use crate::grouping::MessageTag;
use crate::llm::{LanguageModel, ModelMetadata, request_with_timeout};

pub const PURPOSE: &str = "classification";

/// Inputs for one classification call.
pub struct ClassificationRequest<'a> {
    /// Messages being classified; referenced as `[0]..[n)`.
    pub messages: &'a [Message],
    /// Recently completed messages shown for context only.
    pub context: &'a [Message],
    /// Allowed categories. Empty accepts any.
    pub categories: &'a [String],
    pub preamble: &'a str,
}

/// A validated thread from the model, with refs resolved to message ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedThread {
    pub category: String,
    pub message_ids: Vec<String>,
    pub summary: String,
    pub value_justification: String,
    pub criteria: RetrievalCriteria,
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationOutcome {
    /// One tag per valuable message.
    pub tags: Vec<MessageTag>,
    pub threads: Vec<ClassifiedThread>,
    /// `None` when no model call was needed.
    pub metadata: Option<ModelMetadata>,
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassificationPayload {
    threads: Vec<ThreadPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThreadPayload {
    category: String,
    message_refs: Vec<usize>,
    summary: String,
    value_justification: String,
    retrieval: RetrievalPayload,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrievalPayload {
    keywords: Vec<String>,
    semantic_query: String,
}

/// JSON schema sent with the request.
pub fn classification_schema(categories: &[String]) -> serde_json::Value {
    let category = if categories.is_empty() {
        serde_json::json!({ "type": "string" })
    } else {
        serde_json::json!({ "type": "string", "enum": categories })
    };

    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["threads"],
        "properties": {
            "threads": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["category", "message_refs", "summary", "value_justification", "retrieval"],
                    "properties": {
                        "category": category,
                        "message_refs": { "type": "array", "items": { "type": "integer", "minimum": 0 } },
                        "summary": { "type": "string" },
                        "value_justification": { "type": "string" },
                        "retrieval": {
                            "type": "object",
                            "additionalProperties": false,
                            "required": ["keywords", "semantic_query"],
                            "properties": {
                                "keywords": { "type": "array", "items": { "type": "string" } },
                                "semantic_query": { "type": "string" },
                            },
                        },
                    },
                },
            },
        },
    })
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// One line per message; newlines in content are flattened.
fn render_line(message: &Message) -> String {
    let channel = message.channel.as_deref().unwrap_or("-");
    let content = message.content.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "{} #{} {}: {}",
        sortable_timestamp(&message.timestamp),
        channel,
        message.author,
        content
    )
}

pub fn render_prompt(request: &ClassificationRequest<'_>) -> String {
    let mut prompt = String::new();
    if !request.preamble.trim().is_empty() {
        prompt.push_str(request.preamble.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str(
        "You review community chat for knowledge that belongs in product documentation.\n\
         Group the numbered messages into threads that carry documentation value and skip the rest.\n\
         For each thread give a category, the message numbers, a one-sentence summary, why it matters \
         for the docs, and search keywords plus a semantic query for finding the relevant doc pages.\n",
    );
    if !request.categories.is_empty() {
        let _ = writeln!(prompt, "Allowed categories: {}.", request.categories.join(", "));
    }

    if !request.context.is_empty() {
        prompt.push_str("\n## Earlier messages (context only, do not reference)\n");
        for message in request.context {
            let _ = writeln!(prompt, "- {}", render_line(message));
        }
    }

    prompt.push_str("\n## Messages\n");
    for (i, message) in request.messages.iter().enumerate() {
        let _ = writeln!(prompt, "[{i}] {}", render_line(message));
    }
    prompt
}

// ---------------------------------------------------------------------------
// Stage entry point
// ---------------------------------------------------------------------------

/// Classify a batch. An empty batch returns an empty outcome without a model call.
#[instrument(skip_all, fields(messages = request.messages.len(), context = request.context.len()))]
pub async fn classify_messages(
    llm: &dyn LanguageModel,
    timeout: Duration,
    request: &ClassificationRequest<'_>,
) -> Result<ClassificationOutcome> {
    if request.messages.is_empty() {
        debug!("nothing to classify");
        return Ok(ClassificationOutcome::default());
    }

    let prompt = render_prompt(request);
    let schema = classification_schema(request.categories);
    let response = request_with_timeout(llm, timeout, &prompt, &schema, PURPOSE).await?;

    let threads = validate_response(response.data, request.messages, request.categories)?;
    let tags = threads
        .iter()
        .flat_map(|thread| {
            thread.message_ids.iter().map(|id| MessageTag {
                message_id: id.clone(),
                category: thread.category.clone(),
                reason: thread.value_justification.clone(),
                criteria: Some(thread.criteria.clone()),
            })
        })
        .collect::<Vec<_>>();

    info!(threads = threads.len(), valuable = tags.len(), "classification complete");
    Ok(ClassificationOutcome {
        tags,
        threads,
        metadata: Some(response.metadata),
    })
}

/// Check a raw model response against the batch it describes.
pub fn validate_response(
    data: serde_json::Value,
    messages: &[Message],
    categories: &[String],
) -> Result<Vec<ClassifiedThread>> {
    let payload: ClassificationPayload = serde_json::from_value(data)
        .map_err(|e| DocDriftError::validation(format!("{PURPOSE}: {e}")))?;

    let mut claimed = HashSet::new();
    let mut threads = Vec::with_capacity(payload.threads.len());

    for (t, thread) in payload.threads.into_iter().enumerate() {
        if thread.message_refs.is_empty() {
            return Err(DocDriftError::validation(format!(
                "{PURPOSE}: thread {t} references no messages"
            )));
        }
        if !categories.is_empty() && !categories.iter().any(|c| c == &thread.category) {
            return Err(DocDriftError::validation(format!(
                "{PURPOSE}: thread {t} has unknown category '{}'",
                thread.category
            )));
        }

        let mut message_ids = Vec::with_capacity(thread.message_refs.len());
        for r in thread.message_refs {
            let message = messages.get(r).ok_or_else(|| {
                DocDriftError::validation(format!(
                    "{PURPOSE}: thread {t} references [{r}] but the batch has {} messages",
                    messages.len()
                ))
            })?;
            if !claimed.insert(r) {
                return Err(DocDriftError::validation(format!(
                    "{PURPOSE}: message [{r}] appears in more than one thread"
                )));
            }
            message_ids.push(message.id.clone());
        }

        threads.push(ClassifiedThread {
            category: thread.category,
            message_ids,
            summary: thread.summary,
            value_justification: thread.value_justification,
            criteria: RetrievalCriteria {
                keywords: thread.retrieval.keywords,
                semantic_query: thread.retrieval.semantic_query,
            },
        });
    }

    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StructuredResponse;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use docdrift_shared::MessageStatus;
    use std::sync::Mutex;

    fn msg(id: &str, content: &str) -> Message {
        Message {
            id: id.into(),
            stream_id: "s".into(),
            source_id: id.into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
            author: "ana".into(),
            content: content.into(),
            channel: Some("help".into()),
            metadata: serde_json::json!({}),
            status: MessageStatus::Pending,
        }
    }

    fn categories() -> Vec<String> {
        vec!["troubleshooting".into(), "how-to".into()]
    }

    fn thread(category: &str, refs: &[usize]) -> serde_json::Value {
        serde_json::json!({
            "category": category,
            "message_refs": refs,
            "summary": "webhook retries",
            "value_justification": "undocumented retry policy",
            "retrieval": { "keywords": ["webhook"], "semantic_query": "webhook retry policy" },
        })
    }

    struct Canned {
        data: serde_json::Value,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for Canned {
        async fn request_structured_json(
            &self,
            prompt: &str,
            _schema: &serde_json::Value,
            _purpose: &str,
        ) -> Result<StructuredResponse> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(StructuredResponse {
                data: self.data.clone(),
                metadata: ModelMetadata {
                    model: "canned".into(),
                    tokens_in: 10,
                    tokens_out: 5,
                    latency_ms: 1,
                },
            })
        }
    }

    #[test]
    fn prompt_numbers_batch_and_marks_context() {
        let batch = vec![msg("m1", "how do\nretries work?"), msg("m2", "every 5 minutes")];
        let context = vec![msg("old", "earlier chatter")];
        let cats = categories();
        let prompt = render_prompt(&ClassificationRequest {
            messages: &batch,
            context: &context,
            categories: &cats,
            preamble: "Product: Acme Payments",
        });

        assert!(prompt.starts_with("Product: Acme Payments"));
        assert!(prompt.contains("[0] 2026-03-02T09:00:00.000Z #help ana: how do retries work?"));
        assert!(prompt.contains("[1] "));
        assert!(prompt.contains("- 2026-03-02T09:00:00.000Z #help ana: earlier chatter"));
        assert!(!prompt.contains("[2]"));
        assert!(prompt.contains("Allowed categories: troubleshooting, how-to."));
    }

    #[test]
    fn valid_response_resolves_refs() {
        let batch = vec![msg("m1", "a"), msg("m2", "b"), msg("m3", "c")];
        let data = serde_json::json!({ "threads": [thread("troubleshooting", &[0, 2])] });
        let threads = validate_response(data, &batch, &categories()).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].message_ids, vec!["m1", "m3"]);
        assert_eq!(threads[0].criteria.keywords, vec!["webhook"]);
    }

    #[test]
    fn out_of_range_ref_is_rejected() {
        let batch = vec![msg("m1", "a")];
        let data = serde_json::json!({ "threads": [thread("how-to", &[1])] });
        let err = validate_response(data, &batch, &categories()).unwrap_err();
        assert!(matches!(err, DocDriftError::Validation { .. }));
    }

    #[test]
    fn message_in_two_threads_is_rejected() {
        let batch = vec![msg("m1", "a"), msg("m2", "b")];
        let data = serde_json::json!({
            "threads": [thread("how-to", &[0, 1]), thread("troubleshooting", &[1])]
        });
        let err = validate_response(data, &batch, &categories()).unwrap_err();
        assert!(err.to_string().contains("more than one thread"));
    }

    #[test]
    fn unknown_category_and_empty_thread_are_rejected() {
        let batch = vec![msg("m1", "a")];
        let bad_category = serde_json::json!({ "threads": [thread("gossip", &[0])] });
        assert!(validate_response(bad_category.clone(), &batch, &categories()).is_err());
        // Without a taxonomy any category is accepted.
        assert!(validate_response(bad_category, &batch, &[]).is_ok());

        let empty = serde_json::json!({ "threads": [thread("how-to", &[])] });
        assert!(validate_response(empty, &batch, &categories()).is_err());
    }

    #[test]
    fn unknown_fields_and_wrong_types_are_rejected() {
        let batch = vec![msg("m1", "a")];
        let mut extra = thread("how-to", &[0]);
        extra["confidence"] = serde_json::json!(0.9);
        let data = serde_json::json!({ "threads": [extra] });
        assert!(validate_response(data, &batch, &categories()).is_err());

        let negative = serde_json::json!({ "threads": [{
            "category": "how-to", "message_refs": [-1], "summary": "", "value_justification": "",
            "retrieval": { "keywords": [], "semantic_query": "" }
        }]});
        assert!(validate_response(negative, &batch, &categories()).is_err());
        assert!(validate_response(serde_json::json!({}), &batch, &categories()).is_err());
    }

    #[tokio::test]
    async fn empty_batch_skips_the_model() {
        let llm = Canned {
            data: serde_json::json!({ "threads": [] }),
            prompts: Mutex::new(Vec::new()),
        };
        let outcome = classify_messages(
            &llm,
            Duration::from_secs(1),
            &ClassificationRequest {
                messages: &[],
                context: &[],
                categories: &[],
                preamble: "",
            },
        )
        .await
        .unwrap();
        assert!(outcome.tags.is_empty());
        assert!(outcome.metadata.is_none());
        assert!(llm.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tags_carry_thread_category_and_criteria() {
        let batch = vec![msg("m1", "a"), msg("m2", "b"), msg("m3", "c")];
        let llm = Canned {
            data: serde_json::json!({ "threads": [thread("troubleshooting", &[2, 0])] }),
            prompts: Mutex::new(Vec::new()),
        };
        let cats = categories();
        let outcome = classify_messages(
            &llm,
            Duration::from_secs(1),
            &ClassificationRequest {
                messages: &batch,
                context: &[],
                categories: &cats,
                preamble: "",
            },
        )
        .await
        .unwrap();

        let ids: Vec<_> = outcome.tags.iter().map(|t| t.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m1"]);
        assert!(outcome.tags.iter().all(|t| t.category == "troubleshooting"));
        assert_eq!(outcome.metadata.unwrap().tokens_in, 10);
    }
}
