//! Conversation grouping.
//!
//! Valuable messages are clustered per channel by time proximity. The
//! output is a pure function of `(tags, messages, config)`: the same input
//! always yields the same conversations with the same ids.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use docdrift_shared::{ConversationId, GroupingConfig, Message, RetrievalCriteria};

/// Classification verdict for one valuable message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTag {
    pub message_id: String,
    pub category: String,
    /// Why the message is valuable (the thread's value justification).
    pub reason: String,
    pub criteria: Option<RetrievalCriteria>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMember {
    pub message: Message,
    pub category: String,
    pub reason: String,
    pub criteria: Option<RetrievalCriteria>,
}

/// A `reply_to` edge between two members, kept for prompt context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyLink {
    pub message_id: String,
    pub reply_to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub channel: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Ordered by (timestamp, id).
    pub members: Vec<ConversationMember>,
    pub reply_links: Vec<ReplyLink>,
}

impl Conversation {
    pub fn message_count(&self) -> usize {
        self.members.len()
    }

    pub fn member_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.message.id.as_str()).collect()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.members.iter().any(|m| m.message.id == message_id)
    }

    /// Union of the members' retrieval criteria.
    ///
    /// Keywords are deduplicated case-insensitively in first-seen order;
    /// distinct semantic queries are joined with a space.
    pub fn retrieval_criteria(&self) -> RetrievalCriteria {
        let mut seen = BTreeSet::new();
        let mut keywords = Vec::new();
        let mut queries: Vec<&str> = Vec::new();

        for criteria in self.members.iter().filter_map(|m| m.criteria.as_ref()) {
            for kw in &criteria.keywords {
                let kw = kw.trim();
                if !kw.is_empty() && seen.insert(kw.to_lowercase()) {
                    keywords.push(kw.to_string());
                }
            }
            let q = criteria.semantic_query.trim();
            if !q.is_empty() && !queries.contains(&q) {
                queries.push(q);
            }
        }

        RetrievalCriteria {
            keywords,
            semantic_query: queries.join(" "),
        }
    }
}

/// Cluster tagged messages into conversations.
///
/// Members are sorted by (channel, timestamp, id). A new conversation
/// starts when the channel changes, when the gap to the previous member
/// exceeds `min_gap_minutes`, or when the current one already holds
/// `max_conversation_size` members. Gaps at or under the threshold never
/// split, however long the chain runs. A message without a channel is
/// grouped under its own "no channel" key.
///
/// Tags naming a message that is not in `messages` are dropped.
pub fn group_conversations(
    tags: &[MessageTag],
    messages: &[Message],
    config: &GroupingConfig,
) -> Vec<Conversation> {
    let by_id: HashMap<&str, &Message> = messages.iter().map(|m| (m.id.as_str(), m)).collect();

    let mut members: Vec<ConversationMember> = Vec::with_capacity(tags.len());
    let mut taken = BTreeSet::new();
    for tag in tags {
        let Some(message) = by_id.get(tag.message_id.as_str()) else {
            warn!(message_id = %tag.message_id, "tag references unknown message; dropped");
            continue;
        };
        if !taken.insert(tag.message_id.as_str()) {
            continue;
        }
        members.push(ConversationMember {
            message: (*message).clone(),
            category: tag.category.clone(),
            reason: tag.reason.clone(),
            criteria: tag.criteria.clone(),
        });
    }

    members.sort_by(|a, b| {
        a.message
            .channel
            .cmp(&b.message.channel)
            .then(a.message.timestamp.cmp(&b.message.timestamp))
            .then(a.message.id.cmp(&b.message.id))
    });

    let gap = Duration::minutes(i64::from(config.min_gap_minutes));
    let cap = config.max_conversation_size.max(1);

    let mut groups: Vec<Vec<ConversationMember>> = Vec::new();
    for member in members {
        let split = match groups.last() {
            None => true,
            Some(current) => {
                let prev = &current[current.len() - 1].message;
                let at = member.message.timestamp;
                prev.channel != member.message.channel
                    || at - prev.timestamp > gap
                    || current.len() >= cap
            }
        };
        if split {
            groups.push(vec![member]);
        } else if let Some(current) = groups.last_mut() {
            current.push(member);
        }
    }

    let mut conversations: Vec<Conversation> = groups.into_iter().map(build_conversation).collect();
    conversations.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then(a.channel.cmp(&b.channel))
            .then(a.id.cmp(&b.id))
    });
    conversations
}

fn build_conversation(members: Vec<ConversationMember>) -> Conversation {
    let first = &members[0].message;
    let last = &members[members.len() - 1].message;
    let id = ConversationId::derive(first.channel.as_deref(), &first.timestamp, &first.id);

    // Only edges whose target is in the same conversation; match on either
    // the internal id or the source-native id.
    let reply_links = members
        .iter()
        .filter_map(|m| {
            let target = m.message.reply_to()?;
            members
                .iter()
                .find(|other| other.message.id == target || other.message.source_id == target)
                .map(|other| ReplyLink {
                    message_id: m.message.id.clone(),
                    reply_to: other.message.id.clone(),
                })
        })
        .collect();

    Conversation {
        id,
        channel: first.channel.clone(),
        started_at: first.timestamp,
        ended_at: last.timestamp,
        reply_links,
        members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use docdrift_shared::MessageStatus;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn msg(id: &str, minutes: i64, channel: Option<&str>) -> Message {
        Message {
            id: id.into(),
            stream_id: "s".into(),
            source_id: format!("src-{id}"),
            timestamp: t0() + Duration::minutes(minutes),
            author: "user".into(),
            content: format!("content {id}"),
            channel: channel.map(String::from),
            metadata: serde_json::json!({}),
            status: MessageStatus::Pending,
        }
    }

    fn tag(id: &str) -> MessageTag {
        MessageTag {
            message_id: id.into(),
            category: "troubleshooting".into(),
            reason: "explains a fix".into(),
            criteria: None,
        }
    }

    fn tags_for(messages: &[Message]) -> Vec<MessageTag> {
        messages.iter().map(|m| tag(&m.id)).collect()
    }

    fn config(window: u32, size: usize, gap: u32) -> GroupingConfig {
        GroupingConfig {
            time_window_minutes: window,
            max_conversation_size: size,
            min_gap_minutes: gap,
        }
    }

    #[test]
    fn help_channel_scenario() {
        let messages = vec![
            msg("a", 0, Some("help")),
            msg("b", 5, Some("help")),
            msg("c", 10, Some("help")),
        ];
        let cfg = config(15, 20, 5);

        let convs = group_conversations(&tags_for(&messages), &messages, &cfg);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].member_ids(), vec!["a", "b", "c"]);

        let mut more = messages.clone();
        more.push(msg("d", 30, Some("help")));
        let convs = group_conversations(&tags_for(&more), &more, &cfg);
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0].message_count(), 3);
        assert_eq!(convs[1].member_ids(), vec!["d"]);
    }

    #[test]
    fn output_is_deterministic_regardless_of_input_order() {
        let messages = vec![
            msg("a", 0, Some("help")),
            msg("b", 3, Some("dev")),
            msg("c", 4, Some("help")),
            msg("d", 40, None),
        ];
        let cfg = config(60, 20, 15);
        let first = group_conversations(&tags_for(&messages), &messages, &cfg);

        let mut reversed = messages.clone();
        reversed.reverse();
        let mut rtags = tags_for(&messages);
        rtags.reverse();
        let second = group_conversations(&rtags, &reversed, &cfg);

        assert_eq!(first, second);
        let ids: Vec<_> = first.iter().map(|c| c.id.clone()).collect();
        let again: Vec<_> = group_conversations(&tags_for(&messages), &messages, &cfg)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, again);
    }

    #[test]
    fn channels_never_mix() {
        let messages = vec![
            msg("a", 0, Some("help")),
            msg("b", 1, Some("dev")),
            msg("c", 2, Some("help")),
            msg("d", 3, Some("dev")),
        ];
        let convs = group_conversations(&tags_for(&messages), &messages, &config(60, 20, 15));
        assert_eq!(convs.len(), 2);
        for conv in &convs {
            assert!(conv.members.iter().all(|m| m.message.channel == conv.channel));
        }
    }

    #[test]
    fn gap_at_threshold_stays_and_over_threshold_splits() {
        let cfg = config(120, 20, 10);

        let at = vec![msg("a", 0, Some("help")), msg("b", 10, Some("help"))];
        assert_eq!(group_conversations(&tags_for(&at), &at, &cfg).len(), 1);

        let mut over = vec![msg("a", 0, Some("help"))];
        let mut late = msg("b", 10, Some("help"));
        late.timestamp += Duration::seconds(1);
        over.push(late);
        assert_eq!(group_conversations(&tags_for(&over), &over, &cfg).len(), 2);
    }

    #[test]
    fn size_cap_yields_ceil_groups() {
        let messages: Vec<_> = (0..7).map(|i| msg(&format!("m{i}"), i, Some("help"))).collect();
        let convs = group_conversations(&tags_for(&messages), &messages, &config(15, 3, 15));
        assert_eq!(convs.len(), 3);
        assert_eq!(
            convs.iter().map(Conversation::message_count).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        // Split groups still get distinct ids.
        assert_ne!(convs[0].id, convs[1].id);
    }

    #[test]
    fn sub_threshold_chain_stays_one_conversation() {
        // Each gap is 4 minutes, under the 5 minute threshold, and the chain
        // runs past the 15 minute window.
        let messages: Vec<_> = (0..5).map(|i| msg(&format!("m{i}"), i * 4, Some("help"))).collect();
        let convs = group_conversations(&tags_for(&messages), &messages, &config(15, 20, 5));
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].member_ids(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn missing_channel_is_its_own_key() {
        let messages = vec![msg("a", 0, None), msg("b", 1, Some("")), msg("c", 2, None)];
        let convs = group_conversations(&tags_for(&messages), &messages, &config(60, 20, 15));
        assert_eq!(convs.len(), 2);
        let none = convs.iter().find(|c| c.channel.is_none()).unwrap();
        assert_eq!(none.member_ids(), vec!["a", "c"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(group_conversations(&[], &[], &GroupingConfig::default()).is_empty());
    }

    #[test]
    fn unknown_tags_are_dropped() {
        let messages = vec![msg("a", 0, Some("help"))];
        let tags = vec![tag("a"), tag("ghost")];
        let convs = group_conversations(&tags, &messages, &config(60, 20, 15));
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].member_ids(), vec!["a"]);
    }

    #[test]
    fn reply_links_do_not_override_gap_split() {
        let question = msg("q", 0, Some("help"));
        let mut answer = msg("r", 90, Some("help"));
        answer.metadata = serde_json::json!({ "reply_to": "src-q" });
        let mut follow_up = msg("f", 92, Some("help"));
        follow_up.metadata = serde_json::json!({ "reply_to": "r" });

        let messages = vec![question, answer, follow_up];
        let convs = group_conversations(&tags_for(&messages), &messages, &config(120, 20, 15));
        assert_eq!(convs.len(), 2);
        assert!(convs[0].reply_links.is_empty());
        assert_eq!(
            convs[1].reply_links,
            vec![ReplyLink {
                message_id: "f".into(),
                reply_to: "r".into()
            }]
        );
    }

    #[test]
    fn criteria_are_merged_without_duplicates() {
        let messages = vec![msg("a", 0, Some("help")), msg("b", 1, Some("help"))];
        let mut tags = tags_for(&messages);
        tags[0].criteria = Some(RetrievalCriteria {
            keywords: vec!["Webhook".into(), "retry".into()],
            semantic_query: "webhook retries".into(),
        });
        tags[1].criteria = Some(RetrievalCriteria {
            keywords: vec!["webhook".into(), "signature".into()],
            semantic_query: "webhook retries".into(),
        });

        let convs = group_conversations(&tags, &messages, &config(60, 20, 15));
        let merged = convs[0].retrieval_criteria();
        assert_eq!(merged.keywords, vec!["Webhook", "retry", "signature"]);
        assert_eq!(merged.semantic_query, "webhook retries");
    }
}
