//! Transactional persistence of one batch window's results.

use chrono::{DateTime, Utc};
use docdrift_shared::{
    ClassificationRecord, ConversationContext, DocDriftError, Proposal, Result, ReviewState,
    UpdateKind, sortable_timestamp,
};
use libsql::{Connection, params};

use crate::{Storage, parse_ts, storage_err, upsert_watermark};

/// Everything one batch window writes, committed atomically.
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub stream_id: String,
    pub batch_id: String,
    pub classifications: Vec<ClassificationRecord>,
    pub contexts: Vec<ConversationContext>,
    pub proposals: Vec<Proposal>,
    /// Every message the window consumed, valuable or not.
    pub completed_message_ids: Vec<String>,
    /// New watermark position.
    pub advance_to: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
}

impl Storage {
    /// Persist a batch in a single transaction.
    ///
    /// Either every row lands (classifications, contexts, proposals, message
    /// status, watermark) or none does and the messages stay PENDING.
    pub async fn commit_batch(&self, commit: &BatchCommit) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        match write_batch(&tx, commit).await {
            Ok(()) => {
                tx.commit().await.map_err(storage_err)?;
                tracing::debug!(
                    batch_id = %commit.batch_id,
                    classifications = commit.classifications.len(),
                    proposals = commit.proposals.len(),
                    completed = commit.completed_message_ids.len(),
                    "batch committed"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(batch_id = %commit.batch_id, error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Delete every artifact row tagged with `batch_id`.
    ///
    /// Used after a failed commit so no partial batch output survives even if
    /// rows were written outside the transaction by an earlier attempt.
    pub async fn purge_batch(&self, batch_id: &str) -> Result<u64> {
        self.check_writable()?;
        let mut removed = 0;
        for table in ["classifications", "conversation_contexts", "proposals"] {
            removed += self
                .conn
                .execute(
                    &format!("DELETE FROM {table} WHERE batch_id = ?1"),
                    params![batch_id],
                )
                .await
                .map_err(storage_err)?;
        }
        Ok(removed)
    }

    /// Classification rows written by one batch, ordered by message id.
    pub async fn list_classifications_by_batch(
        &self,
        batch_id: &str,
    ) -> Result<Vec<ClassificationRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT message_id, batch_id, conversation_id, category, reasoning, created_at
                 FROM classifications WHERE batch_id = ?1 ORDER BY message_id",
                params![batch_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let created_at: String = row.get(5).map_err(storage_err)?;
            results.push(ClassificationRecord {
                message_id: row.get(0).map_err(storage_err)?,
                batch_id: row.get(1).map_err(storage_err)?,
                conversation_id: row.get(2).map_err(storage_err)?,
                category: row.get(3).map_err(storage_err)?,
                reasoning: row.get(4).map_err(storage_err)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(results)
    }

    /// Get the stored retrieval context of a conversation within a batch.
    pub async fn get_conversation_context(
        &self,
        conversation_id: &str,
        batch_id: &str,
    ) -> Result<Option<ConversationContext>> {
        let mut rows = self
            .conn
            .query(
                "SELECT conversation_id, batch_id, query, passages_json, token_count
                 FROM conversation_contexts WHERE conversation_id = ?1 AND batch_id = ?2",
                params![conversation_id, batch_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let passages_json: String = row.get(3).map_err(storage_err)?;
                Ok(Some(ConversationContext {
                    conversation_id: row.get(0).map_err(storage_err)?,
                    batch_id: row.get(1).map_err(storage_err)?,
                    query: row.get(2).map_err(storage_err)?,
                    passages: serde_json::from_str(&passages_json)
                        .map_err(|e| DocDriftError::Storage(format!("passages_json: {e}")))?,
                    token_count: row.get::<i64>(4).map_err(storage_err)? as u64,
                }))
            }
            None => Ok(None),
        }
    }

    /// List proposals, newest first, optionally filtered by review state.
    pub async fn list_proposals(
        &self,
        state: Option<ReviewState>,
        limit: u32,
    ) -> Result<Vec<Proposal>> {
        let state = state.map(|s| s.as_str());
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PROPOSAL_COLUMNS} FROM proposals
                     WHERE (?1 IS NULL OR review_state = ?1)
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2"
                ),
                params![state, limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_proposal(&row)?);
        }
        Ok(results)
    }

    /// Proposals created by one batch, in creation order.
    pub async fn list_proposals_by_batch(&self, batch_id: &str) -> Result<Vec<Proposal>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PROPOSAL_COLUMNS} FROM proposals
                     WHERE batch_id = ?1 ORDER BY created_at, id"
                ),
                params![batch_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_proposal(&row)?);
        }
        Ok(results)
    }
}

const PROPOSAL_COLUMNS: &str = "id, batch_id, conversation_id, kind, page, section, suggested_text, \
     reasoning, source_ids_json, review_state, reviewer, reviewed_at, created_at";

async fn write_batch(conn: &Connection, commit: &BatchCommit) -> Result<()> {
    for record in &commit.classifications {
        conn.execute(
            "INSERT INTO classifications (message_id, batch_id, conversation_id, category, reasoning, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(message_id) DO UPDATE SET
               batch_id = excluded.batch_id,
               conversation_id = excluded.conversation_id,
               category = excluded.category,
               reasoning = excluded.reasoning,
               created_at = excluded.created_at",
            params![
                record.message_id.as_str(),
                record.batch_id.as_str(),
                record.conversation_id.as_str(),
                record.category.as_str(),
                record.reasoning.as_str(),
                sortable_timestamp(&record.created_at),
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    for context in &commit.contexts {
        let passages_json = serde_json::to_string(&context.passages)
            .map_err(|e| DocDriftError::Storage(format!("passages_json: {e}")))?;
        conn.execute(
            "INSERT INTO conversation_contexts (conversation_id, batch_id, query, passages_json, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(conversation_id, batch_id) DO UPDATE SET
               query = excluded.query,
               passages_json = excluded.passages_json,
               token_count = excluded.token_count",
            params![
                context.conversation_id.as_str(),
                context.batch_id.as_str(),
                context.query.as_str(),
                passages_json,
                context.token_count as i64,
                sortable_timestamp(&commit.committed_at),
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    for proposal in &commit.proposals {
        let source_ids_json = serde_json::to_string(&proposal.source_message_ids)
            .map_err(|e| DocDriftError::Storage(format!("source_ids_json: {e}")))?;
        conn.execute(
            &format!(
                "INSERT INTO proposals ({PROPOSAL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                proposal.id.as_str(),
                proposal.batch_id.as_str(),
                proposal.conversation_id.as_str(),
                proposal.kind.as_str(),
                proposal.page.as_str(),
                proposal.section.as_deref(),
                proposal.suggested_text.as_str(),
                proposal.reasoning.as_str(),
                source_ids_json,
                proposal.review_state.as_str(),
                proposal.reviewer.as_deref(),
                proposal.reviewed_at.as_ref().map(sortable_timestamp),
                sortable_timestamp(&proposal.created_at),
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    for id in &commit.completed_message_ids {
        conn.execute(
            "UPDATE messages SET status = 'COMPLETED' WHERE id = ?1 AND status = 'PENDING'",
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;
    }

    upsert_watermark(
        conn,
        &commit.stream_id,
        commit.advance_to,
        Some(commit.committed_at),
    )
    .await
}

fn row_to_proposal(row: &libsql::Row) -> Result<Proposal> {
    let kind: String = row.get(3).map_err(storage_err)?;
    let source_ids_json: String = row.get(8).map_err(storage_err)?;
    let review_state: String = row.get(9).map_err(storage_err)?;
    let reviewed_at: Option<String> = row.get::<String>(11).ok();
    let created_at: String = row.get(12).map_err(storage_err)?;
    Ok(Proposal {
        id: row.get(0).map_err(storage_err)?,
        batch_id: row.get(1).map_err(storage_err)?,
        conversation_id: row.get(2).map_err(storage_err)?,
        kind: UpdateKind::parse(&kind)
            .ok_or_else(|| DocDriftError::Storage(format!("unknown proposal kind '{kind}'")))?,
        page: row.get(4).map_err(storage_err)?,
        section: row.get::<String>(5).ok(),
        suggested_text: row.get(6).map_err(storage_err)?,
        reasoning: row.get(7).map_err(storage_err)?,
        source_message_ids: serde_json::from_str(&source_ids_json)
            .map_err(|e| DocDriftError::Storage(format!("source_ids_json: {e}")))?,
        review_state: ReviewState::parse(&review_state).ok_or_else(|| {
            DocDriftError::Storage(format!("unknown review state '{review_state}'"))
        })?,
        reviewer: row.get::<String>(10).ok(),
        reviewed_at: reviewed_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}
