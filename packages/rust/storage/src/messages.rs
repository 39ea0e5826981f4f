//! Message queries used by ingestion and the batch window loop.

use chrono::{DateTime, Utc};
use docdrift_shared::{DocDriftError, Message, MessageStatus, Result, sortable_timestamp};
use libsql::params;

use crate::{Storage, parse_ts, storage_err};

const MESSAGE_COLUMNS: &str =
    "id, stream_id, source_id, ts, author, content, channel, metadata_json, status";

/// Per-stream message totals by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCounts {
    pub stream_id: String,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
}

impl Storage {
    /// Insert a message written by a connector.
    ///
    /// Re-delivery of the same `(stream_id, source_id)` is ignored. Returns
    /// whether a new row was written.
    pub async fn insert_message(&self, message: &Message) -> Result<bool> {
        self.check_writable()?;
        let metadata_json = serde_json::to_string(&message.metadata)
            .map_err(|e| DocDriftError::Storage(format!("message metadata: {e}")))?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO messages (id, stream_id, source_id, ts, author, content, channel, metadata_json, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT DO NOTHING",
                params![
                    message.id.as_str(),
                    message.stream_id.as_str(),
                    message.source_id.as_str(),
                    sortable_timestamp(&message.timestamp),
                    message.author.as_str(),
                    message.content.as_str(),
                    message.channel.as_deref(),
                    metadata_json,
                    message.status.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(inserted > 0)
    }

    /// Get a message by ID.
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    /// Distinct streams holding at least one PENDING message, skipping
    /// streams whose descriptor is disabled.
    pub async fn list_pending_streams(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT m.stream_id
                 FROM messages m
                 LEFT JOIN streams s ON s.stream_id = m.stream_id
                 WHERE m.status = 'PENDING' AND COALESCE(s.enabled, 1) = 1
                 ORDER BY m.stream_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row.get::<String>(0).map_err(storage_err)?);
        }
        Ok(results)
    }

    /// Timestamp of the oldest PENDING message in a stream.
    pub async fn earliest_pending_timestamp(
        &self,
        stream_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MIN(ts) FROM messages WHERE stream_id = ?1 AND status = 'PENDING'",
                params![stream_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => match row.get::<String>(0) {
                Ok(ts) => Ok(Some(parse_ts(&ts)?)),
                Err(_) => Ok(None), // MIN over no rows is NULL
            },
            None => Ok(None),
        }
    }

    /// Whether any PENDING message sits at or after `since`.
    pub async fn has_pending_since(&self, stream_id: &str, since: DateTime<Utc>) -> Result<bool> {
        let count = self
            .count_where(
                "SELECT COUNT(*) FROM messages
                 WHERE stream_id = ?1 AND status = 'PENDING' AND ts >= ?2",
                stream_id,
                since,
            )
            .await?;
        Ok(count > 0)
    }

    /// PENDING messages that arrived behind the watermark and will not be
    /// picked up by the window loop.
    pub async fn count_pending_before(&self, stream_id: &str, before: DateTime<Utc>) -> Result<u64> {
        self.count_where(
            "SELECT COUNT(*) FROM messages
             WHERE stream_id = ?1 AND status = 'PENDING' AND ts < ?2",
            stream_id,
            before,
        )
        .await
    }

    async fn count_where(&self, sql: &str, stream_id: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![stream_id, sortable_timestamp(&at)])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            None => Ok(0),
        }
    }

    /// PENDING messages in `[start, end)`, oldest first, at most `limit`.
    pub async fn fetch_pending_window(
        &self,
        stream_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE stream_id = ?1 AND status = 'PENDING' AND ts >= ?2 AND ts < ?3
                 ORDER BY ts, id
                 LIMIT ?4"
            ),
            params![
                stream_id,
                sortable_timestamp(&start),
                sortable_timestamp(&end),
                limit
            ],
        )
        .await
    }

    /// The most recent COMPLETED messages in `[start, end)`, returned oldest
    /// first, at most `limit`.
    pub async fn fetch_context_window(
        &self,
        stream_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut messages = self
            .query_messages(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE stream_id = ?1 AND status = 'COMPLETED' AND ts >= ?2 AND ts < ?3
                     ORDER BY ts DESC, id DESC
                     LIMIT ?4"
                ),
                params![
                    stream_id,
                    sortable_timestamp(&start),
                    sortable_timestamp(&end),
                    limit
                ],
            )
            .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn query_messages(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Message>> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_message(&row)?);
        }
        Ok(results)
    }

    /// Message totals per stream, for status reporting.
    pub async fn stream_counts(&self) -> Result<Vec<StreamCounts>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stream_id,
                        SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END)
                 FROM messages GROUP BY stream_id ORDER BY stream_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(StreamCounts {
                stream_id: row.get(0).map_err(storage_err)?,
                pending: row.get::<i64>(1).unwrap_or(0) as u64,
                completed: row.get::<i64>(2).unwrap_or(0) as u64,
                failed: row.get::<i64>(3).unwrap_or(0) as u64,
            });
        }
        Ok(results)
    }
}

pub(crate) fn row_to_message(row: &libsql::Row) -> Result<Message> {
    let ts: String = row.get(3).map_err(storage_err)?;
    let metadata_json: String = row.get(7).map_err(storage_err)?;
    let status: String = row.get(8).map_err(storage_err)?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| DocDriftError::Storage(format!("corrupt metadata on message: {e}")))?;
    Ok(Message {
        id: row.get(0).map_err(storage_err)?,
        stream_id: row.get(1).map_err(storage_err)?,
        source_id: row.get(2).map_err(storage_err)?,
        timestamp: parse_ts(&ts)?,
        author: row.get(4).map_err(storage_err)?,
        content: row.get(5).map_err(storage_err)?,
        channel: row.get::<String>(6).ok(),
        metadata,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| DocDriftError::Storage(format!("unknown message status '{status}'")))?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support::{message, test_storage};
    use chrono::{Duration, TimeZone, Utc};
    use docdrift_shared::{DocDriftError, MessageStatus, StreamDescriptor};

    #[tokio::test]
    async fn insert_is_idempotent_per_source_id() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        let mut msg = message("s1", "m1", t0, Some("help"));
        msg.metadata = serde_json::json!({ "reply_to": "src-m0" });
        assert!(storage.insert_message(&msg).await.unwrap());

        let dup = docdrift_shared::Message {
            id: "m1-redelivered".into(),
            ..msg.clone()
        };
        assert!(!storage.insert_message(&dup).await.unwrap());

        let loaded = storage.get_message("m1").await.unwrap().expect("stored");
        assert_eq!(loaded, msg);
        assert_eq!(loaded.reply_to(), Some("src-m0"));
        assert!(storage.get_message("m1-redelivered").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_streams_skip_disabled() {
        let storage = test_storage().await;
        let t0 = Utc::now() - Duration::hours(1);
        storage.insert_message(&message("a", "a1", t0, None)).await.unwrap();
        storage.insert_message(&message("b", "b1", t0, None)).await.unwrap();
        storage
            .upsert_stream(&StreamDescriptor {
                stream_id: "b".into(),
                connector_type: "slack".into(),
                config: serde_json::json!({}),
                enabled: false,
            })
            .await
            .unwrap();

        assert_eq!(storage.list_pending_streams().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn window_queries_respect_bounds_and_limit() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            let msg = message("s", &format!("m{i}"), t0 + Duration::minutes(i * 10), None);
            storage.insert_message(&msg).await.unwrap();
        }

        assert_eq!(storage.earliest_pending_timestamp("s").await.unwrap(), Some(t0));
        assert_eq!(storage.earliest_pending_timestamp("empty").await.unwrap(), None);

        // [t0+10m, t0+40m) holds m1, m2, m3; the end bound is exclusive.
        let window = storage
            .fetch_pending_window("s", t0 + Duration::minutes(10), t0 + Duration::minutes(40), 10)
            .await
            .unwrap();
        let ids: Vec<_> = window.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let capped = storage
            .fetch_pending_window("s", t0, t0 + Duration::hours(1), 2)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].id, "m1");

        assert!(storage.has_pending_since("s", t0 + Duration::minutes(40)).await.unwrap());
        assert!(!storage.has_pending_since("s", t0 + Duration::minutes(41)).await.unwrap());
        assert_eq!(
            storage.count_pending_before("s", t0 + Duration::minutes(15)).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn context_window_returns_latest_completed_oldest_first() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        for i in 0..4 {
            let mut msg = message("s", &format!("c{i}"), t0 + Duration::minutes(i), None);
            msg.status = MessageStatus::Completed;
            storage.insert_message(&msg).await.unwrap();
        }
        storage
            .insert_message(&message("s", "p0", t0 + Duration::minutes(2), None))
            .await
            .unwrap();

        let context = storage
            .fetch_context_window("s", t0, t0 + Duration::hours(1), 2)
            .await
            .unwrap();
        let ids: Vec<_> = context.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3"]);
    }

    #[tokio::test]
    async fn stream_counts_by_status() {
        let storage = test_storage().await;
        let t0 = Utc::now();
        storage.insert_message(&message("s", "m1", t0, None)).await.unwrap();
        let mut done = message("s", "m2", t0, None);
        done.status = MessageStatus::Completed;
        storage.insert_message(&done).await.unwrap();

        let counts = storage.stream_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].pending, 1);
        assert_eq!(counts[0].completed, 1);
        assert_eq!(counts[0].failed, 0);
    }

    #[tokio::test]
    async fn corrupt_metadata_is_a_storage_error() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        storage.insert_message(&message("s1", "m1", t0, Some("help"))).await.unwrap();
        storage
            .conn
            .execute(
                "UPDATE messages SET metadata_json = ?1 WHERE id = ?2",
                libsql::params!["{\"reply_to\": ", "m1"],
            )
            .await
            .unwrap();

        let err = storage.get_message("m1").await.unwrap_err();
        assert!(matches!(err, DocDriftError::Storage(ref m) if m.contains("metadata")));
    }
}
