//! RAG enrichment: attach related documentation to each conversation.

use tracing::{debug, instrument};

use docdrift_shared::{ConversationContext, RagConfig, Result, RetrievedPassage};

use crate::grouping::Conversation;
use crate::search::DocumentSearch;

/// Longest query sent to the search backend, in characters.
const MAX_QUERY_CHARS: usize = 1000;

/// Rough prompt-token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Search text for a conversation.
///
/// Semantic queries first, then keywords not already present; falls back to
/// the members' message text when classification gave no criteria.
pub fn build_query(conversation: &Conversation) -> String {
    let criteria = conversation.retrieval_criteria();
    let mut query = criteria.semantic_query.trim().to_string();
    let lowered = query.to_lowercase();
    for kw in &criteria.keywords {
        if !lowered.contains(&kw.to_lowercase()) {
            if !query.is_empty() {
                query.push(' ');
            }
            query.push_str(kw);
        }
    }

    if query.trim().is_empty() {
        query = conversation
            .members
            .iter()
            .map(|m| m.message.content.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join(" ");
    }

    query.chars().take(MAX_QUERY_CHARS).collect()
}

/// Keep passages in rank order while they fit the token budget.
fn trim_to_budget(passages: Vec<RetrievedPassage>, budget: u64) -> (Vec<RetrievedPassage>, u64) {
    let mut kept = Vec::new();
    let mut used = 0u64;
    for passage in passages {
        let cost = estimate_tokens(&passage.content);
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(passage);
    }
    (kept, used)
}

/// Retrieve grounding passages for one conversation.
#[instrument(skip_all, fields(conversation = %conversation.id))]
pub async fn enrich_conversation(
    search: &dyn DocumentSearch,
    conversation: &Conversation,
    batch_id: &str,
    rag: &RagConfig,
) -> Result<ConversationContext> {
    let query = build_query(conversation);
    let found = if query.trim().is_empty() {
        Vec::new()
    } else {
        search.search_similar_documents(&query, rag.top_k).await?
    };

    let retrieved = found.len();
    let (passages, token_count) = trim_to_budget(found, rag.max_context_tokens);
    debug!(retrieved, kept = passages.len(), token_count, "context retrieved");

    Ok(ConversationContext {
        conversation_id: conversation.id.to_string(),
        batch_id: batch_id.to_string(),
        query,
        passages,
        token_count,
    })
}
