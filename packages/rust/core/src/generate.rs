//! Proposal generation stage.
//!
//! Drafts documentation edits for one conversation, grounded in its
//! retrieved context. Every proposal must cite the conversation's own
//! messages; anything else is discarded before it can reach a reviewer.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use docdrift_shared::{
    ConversationContext, DocDriftError, Proposal, Result, ReviewState, UpdateKind,
    sortable_timestamp,
};

use crate::grouping::Conversation;
use crate::llm::{LanguageModel, ModelMetadata, request_with_timeout};

pub const PURPOSE: &str = "proposal_generation";

pub struct GenerationRequest<'a> {
    pub conversation: &'a Conversation,
    /// Retrieved documentation; `None` when enrichment is not configured.
    pub context: Option<&'a ConversationContext>,
    pub batch_id: &'a str,
    pub preamble: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOutcome {
    pub proposals: Vec<Proposal>,
    /// Proposals dropped for citing no messages or foreign messages.
    pub discarded: usize,
    pub metadata: ModelMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerationPayload {
    proposals: Vec<ProposalPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProposalPayload {
    update_type: String,
    page: String,
    #[serde(default)]
    section: Option<String>,
    suggested_text: String,
    reasoning: String,
    source_message_ids: Vec<String>,
}

pub fn generation_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["proposals"],
        "properties": {
            "proposals": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["update_type", "page", "section", "suggested_text", "reasoning", "source_message_ids"],
                    "properties": {
                        "update_type": { "type": "string", "enum": ["insert", "update", "delete"] },
                        "page": { "type": "string" },
                        "section": { "type": ["string", "null"] },
                        "suggested_text": { "type": "string" },
                        "reasoning": { "type": "string" },
                        "source_message_ids": { "type": "array", "items": { "type": "string" } },
                    },
                },
            },
        },
    })
}

pub fn render_prompt(request: &GenerationRequest<'_>) -> String {
    let conversation = request.conversation;
    let mut prompt = String::new();
    if !request.preamble.trim().is_empty() {
        prompt.push_str(request.preamble.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str(
        "You maintain product documentation. Propose edits (insert, update or delete) that capture \
         what this conversation teaches and the existing docs miss or get wrong. Cite the ids of the \
         messages each proposal is based on in source_message_ids. Return an empty list when the \
         docs already cover it.\n",
    );

    let _ = writeln!(
        prompt,
        "\n## Conversation {} (#{})",
        conversation.id,
        conversation.channel.as_deref().unwrap_or("-")
    );
    for member in &conversation.members {
        let m = &member.message;
        let content = m.content.split_whitespace().collect::<Vec<_>>().join(" ");
        let _ = writeln!(
            prompt,
            "[msg:{}] {} {} ({}): {}",
            m.id,
            sortable_timestamp(&m.timestamp),
            m.author,
            member.category,
            content
        );
    }
    for link in &conversation.reply_links {
        let _ = writeln!(prompt, "(msg:{} replies to msg:{})", link.message_id, link.reply_to);
    }

    prompt.push_str("\n## Existing documentation\n");
    match request.context {
        Some(ctx) if !ctx.passages.is_empty() => {
            for passage in &ctx.passages {
                let title = passage.title.as_deref().unwrap_or(&passage.path);
                let _ = writeln!(prompt, "### {} ({})\n{}\n", title, passage.path, passage.content.trim());
            }
        }
        _ => prompt.push_str("(no related pages found)\n"),
    }
    prompt
}

/// Generate proposals for one conversation.
#[instrument(skip_all, fields(conversation = %request.conversation.id, batch_id = request.batch_id))]
pub async fn generate_proposals(
    llm: &dyn LanguageModel,
    timeout: Duration,
    request: &GenerationRequest<'_>,
) -> Result<GenerationOutcome> {
    let prompt = render_prompt(request);
    let response = request_with_timeout(llm, timeout, &prompt, &generation_schema(), PURPOSE).await?;

    let (proposals, discarded) =
        validate_response(response.data, request.conversation, request.batch_id)?;
    info!(proposals = proposals.len(), discarded, "generation complete");

    Ok(GenerationOutcome {
        proposals,
        discarded,
        metadata: response.metadata,
    })
}

/// Turn a raw model response into proposals, dropping any without valid provenance.
///
/// Returns the kept proposals and how many were discarded.
pub fn validate_response(
    data: serde_json::Value,
    conversation: &Conversation,
    batch_id: &str,
) -> Result<(Vec<Proposal>, usize)> {
    let payload: GenerationPayload = serde_json::from_value(data)
        .map_err(|e| DocDriftError::validation(format!("{PURPOSE}: {e}")))?;

    let now = Utc::now();
    let mut proposals = Vec::new();
    let mut discarded = 0;

    for (i, raw) in payload.proposals.into_iter().enumerate() {
        let kind = UpdateKind::parse(&raw.update_type).ok_or_else(|| {
            DocDriftError::validation(format!(
                "{PURPOSE}: proposal {i} has unknown update_type '{}'",
                raw.update_type
            ))
        })?;
        if raw.page.trim().is_empty() {
            return Err(DocDriftError::validation(format!("{PURPOSE}: proposal {i} has no page")));
        }
        if kind != UpdateKind::Delete && raw.suggested_text.trim().is_empty() {
            return Err(DocDriftError::validation(format!(
                "{PURPOSE}: {} proposal {i} has no suggested text",
                kind.as_str()
            )));
        }

        let foreign: Vec<String> = raw
            .source_message_ids
            .iter()
            .filter(|id| !conversation.contains(id))
            .cloned()
            .collect();
        if raw.source_message_ids.is_empty() || !foreign.is_empty() {
            let err = DocDriftError::Provenance {
                target: raw.page.clone(),
                foreign,
            };
            warn!(conversation = %conversation.id, error = %err, "proposal discarded");
            discarded += 1;
            continue;
        }

        let mut sources: Vec<String> = Vec::with_capacity(raw.source_message_ids.len());
        for id in raw.source_message_ids {
            if !sources.contains(&id) {
                sources.push(id);
            }
        }

        proposals.push(Proposal {
            id: Uuid::now_v7().to_string(),
            batch_id: batch_id.to_string(),
            conversation_id: conversation.id.to_string(),
            kind,
            page: raw.page.trim().to_string(),
            section: raw.section.filter(|s| !s.trim().is_empty()),
            suggested_text: raw.suggested_text,
            reasoning: raw.reasoning,
            source_message_ids: sources,
            review_state: ReviewState::Pending,
            reviewer: None,
            reviewed_at: None,
            created_at: now,
        });
    }

    Ok((proposals, discarded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{MessageTag, group_conversations};
    use chrono::TimeZone;
    use docdrift_shared::{GroupingConfig, Message, MessageStatus, RetrievedPassage};

    fn conversation() -> Conversation {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let messages: Vec<Message> = ["m1", "m2"]
            .iter()
            .enumerate()
            .map(|(i, id)| Message {
                id: (*id).into(),
                stream_id: "s".into(),
                source_id: (*id).into(),
                timestamp: at + chrono::Duration::minutes(i as i64),
                author: "ana".into(),
                content: format!("message {id}"),
                channel: Some("help".into()),
                metadata: serde_json::json!({}),
                status: MessageStatus::Pending,
            })
            .collect();
        let tags: Vec<MessageTag> = messages
            .iter()
            .map(|m| MessageTag {
                message_id: m.id.clone(),
                category: "how-to".into(),
                reason: "r".into(),
                criteria: None,
            })
            .collect();
        group_conversations(&tags, &messages, &GroupingConfig::default()).remove(0)
    }

    fn proposal(kind: &str, text: &str, sources: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "update_type": kind,
            "page": "guides/webhooks.md",
            "section": "Retries",
            "suggested_text": text,
            "reasoning": "users keep asking",
            "source_message_ids": sources,
        })
    }

    #[test]
    fn prompt_lists_members_and_context() {
        let conv = conversation();
        let ctx = ConversationContext {
            conversation_id: conv.id.to_string(),
            batch_id: "b".into(),
            query: "q".into(),
            passages: vec![RetrievedPassage {
                path: "guides/webhooks.md".into(),
                title: Some("Webhooks".into()),
                content: "Webhooks are retried.".into(),
                score: 1.0,
            }],
            token_count: 6,
        };
        let prompt = render_prompt(&GenerationRequest {
            conversation: &conv,
            context: Some(&ctx),
            batch_id: "b",
            preamble: "",
        });
        assert!(prompt.contains("[msg:m1] 2026-03-02T09:00:00.000Z ana (how-to): message m1"));
        assert!(prompt.contains("### Webhooks (guides/webhooks.md)"));

        let bare = render_prompt(&GenerationRequest {
            conversation: &conv,
            context: None,
            batch_id: "b",
            preamble: "",
        });
        assert!(bare.contains("(no related pages found)"));
    }

    #[test]
    fn empty_list_is_success() {
        let (kept, discarded) =
            validate_response(serde_json::json!({ "proposals": [] }), &conversation(), "b").unwrap();
        assert!(kept.is_empty());
        assert_eq!(discarded, 0);
    }

    #[test]
    fn foreign_and_missing_sources_are_discarded() {
        let data = serde_json::json!({ "proposals": [
            proposal("update", "Retries happen every 5 minutes.", &["m1", "m2", "m1"]),
            proposal("insert", "Signatures use HMAC.", &["m1", "other"]),
            proposal("insert", "Unsourced.", &[]),
        ]});
        let (kept, discarded) = validate_response(data, &conversation(), "batch-7").unwrap();
        assert_eq!(discarded, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].kind, UpdateKind::Update);
        assert_eq!(kept[0].source_message_ids, vec!["m1", "m2"]);
        assert_eq!(kept[0].batch_id, "batch-7");
        assert_eq!(kept[0].review_state, ReviewState::Pending);
    }

    #[test]
    fn empty_text_is_invalid_except_for_delete() {
        let insert = serde_json::json!({ "proposals": [proposal("insert", "  ", &["m1"])] });
        let err = validate_response(insert, &conversation(), "b").unwrap_err();
        assert!(matches!(err, DocDriftError::Validation { .. }));

        let delete = serde_json::json!({ "proposals": [proposal("delete", "", &["m1"])] });
        let (kept, _) = validate_response(delete, &conversation(), "b").unwrap();
        assert_eq!(kept[0].kind, UpdateKind::Delete);
    }

    #[test]
    fn malformed_payload_is_invalid() {
        let unknown_kind = serde_json::json!({ "proposals": [proposal("rewrite", "x", &["m1"])] });
        assert!(validate_response(unknown_kind, &conversation(), "b").is_err());

        let mut extra = proposal("insert", "x", &["m1"]);
        extra["priority"] = serde_json::json!("high");
        let data = serde_json::json!({ "proposals": [extra] });
        assert!(validate_response(data, &conversation(), "b").is_err());
    }
}
