//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding stream
//! registrations, normalized messages, per-stream watermarks, and the
//! artifacts of each batch (classifications, conversation contexts,
//! proposals), plus the FTS-indexed reference documentation corpus.
//!
//! **Access rules:**
//! - Batch coordinator: read-write (sole writer of batch artifacts) via [`Storage::open`]
//! - Reporting commands: read-only via [`Storage::open_readonly`]

mod batch;
mod messages;
mod migrations;
mod reference;

use std::path::Path;

use chrono::{DateTime, Utc};
use docdrift_shared::{DocDriftError, Result, StreamDescriptor, Watermark, sortable_timestamp};
use libsql::{Connection, Database, params};

pub use batch::BatchCommit;
pub use messages::StreamCounts;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocDriftError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DocDriftError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DocDriftError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream descriptors
    // -----------------------------------------------------------------------

    /// Register or replace a stream descriptor.
    pub async fn upsert_stream(&self, stream: &StreamDescriptor) -> Result<()> {
        self.check_writable()?;
        let config_json = serde_json::to_string(&stream.config)
            .map_err(|e| DocDriftError::Storage(format!("stream config: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO streams (stream_id, connector_type, config_json, enabled)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(stream_id) DO UPDATE SET
                   connector_type = excluded.connector_type,
                   config_json = excluded.config_json,
                   enabled = excluded.enabled",
                params![
                    stream.stream_id.as_str(),
                    stream.connector_type.as_str(),
                    config_json,
                    i64::from(stream.enabled),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// List all registered streams, ordered by id.
    pub async fn list_streams(&self) -> Result<Vec<StreamDescriptor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stream_id, connector_type, config_json, enabled
                 FROM streams ORDER BY stream_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let config_json: String = row.get(2).map_err(storage_err)?;
            results.push(StreamDescriptor {
                stream_id: row.get(0).map_err(storage_err)?,
                connector_type: row.get(1).map_err(storage_err)?,
                config: serde_json::from_str(&config_json)
                    .map_err(|e| DocDriftError::Storage(format!("corrupt stream config: {e}")))?,
                enabled: row.get::<i64>(3).map_err(storage_err)? != 0,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Watermarks
    // -----------------------------------------------------------------------

    /// Get the watermark for a stream, if one has been created.
    pub async fn get_watermark(&self, stream_id: &str) -> Result<Option<Watermark>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stream_id, watermark_time, last_batch_at, updated_at
                 FROM watermarks WHERE stream_id = ?1",
                params![stream_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_watermark(&row)?)),
            None => Ok(None),
        }
    }

    /// Insert a watermark unless one already exists, returning the stored row.
    ///
    /// Two racing initializers both observe the first writer's value.
    pub async fn create_watermark(
        &self,
        stream_id: &str,
        watermark_time: DateTime<Utc>,
    ) -> Result<Watermark> {
        self.check_writable()?;
        let now = sortable_timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO watermarks (stream_id, watermark_time, last_batch_at, updated_at)
                 VALUES (?1, ?2, NULL, ?3)
                 ON CONFLICT(stream_id) DO NOTHING",
                params![stream_id, sortable_timestamp(&watermark_time), now],
            )
            .await
            .map_err(storage_err)?;

        self.get_watermark(stream_id).await?.ok_or_else(|| {
            DocDriftError::Storage(format!("watermark for {stream_id} vanished after insert"))
        })
    }

    /// Move a watermark forward. Never regresses: the stored value becomes
    /// `MAX(stored, watermark_time)`.
    pub async fn advance_watermark(
        &self,
        stream_id: &str,
        watermark_time: DateTime<Utc>,
        last_batch_at: Option<DateTime<Utc>>,
    ) -> Result<Watermark> {
        self.check_writable()?;
        upsert_watermark(&self.conn, stream_id, watermark_time, last_batch_at).await?;
        self.get_watermark(stream_id).await?.ok_or_else(|| {
            DocDriftError::Storage(format!("watermark for {stream_id} vanished after upsert"))
        })
    }

    /// List every stream's watermark, ordered by stream id.
    pub async fn list_watermarks(&self) -> Result<Vec<Watermark>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stream_id, watermark_time, last_batch_at, updated_at
                 FROM watermarks ORDER BY stream_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_watermark(&row)?);
        }
        Ok(results)
    }
}

/// Keyed monotonic upsert shared by [`Storage::advance_watermark`] and the
/// batch commit transaction.
async fn upsert_watermark(
    conn: &Connection,
    stream_id: &str,
    watermark_time: DateTime<Utc>,
    last_batch_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let now = sortable_timestamp(&Utc::now());
    conn.execute(
        "INSERT INTO watermarks (stream_id, watermark_time, last_batch_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(stream_id) DO UPDATE SET
           watermark_time = MAX(watermarks.watermark_time, excluded.watermark_time),
           last_batch_at = COALESCE(excluded.last_batch_at, watermarks.last_batch_at),
           updated_at = excluded.updated_at",
        params![
            stream_id,
            sortable_timestamp(&watermark_time),
            last_batch_at.as_ref().map(sortable_timestamp),
            now,
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

/// Map any libSQL error into the storage variant.
pub(crate) fn storage_err(e: impl std::fmt::Display) -> DocDriftError {
    DocDriftError::Storage(e.to_string())
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocDriftError::Storage(format!("invalid date '{s}': {e}")))
}

fn row_to_watermark(row: &libsql::Row) -> Result<Watermark> {
    let watermark_time: String = row.get(1).map_err(storage_err)?;
    let last_batch_at: Option<String> = row.get::<String>(2).ok();
    let updated_at: String = row.get(3).map_err(storage_err)?;
    Ok(Watermark {
        stream_id: row.get(0).map_err(storage_err)?,
        watermark_time: parse_ts(&watermark_time)?,
        last_batch_at: last_batch_at.as_deref().map(parse_ts).transpose()?,
        updated_at: parse_ts(&updated_at)?,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::test_storage;
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("dd_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn stream_upsert_and_list() {
        let storage = test_storage().await;
        let mut stream = StreamDescriptor {
            stream_id: "discord-help".into(),
            connector_type: "discord".into(),
            config: serde_json::json!({ "guild": "42" }),
            enabled: true,
        };
        storage.upsert_stream(&stream).await.expect("insert");
        stream.enabled = false;
        storage.upsert_stream(&stream).await.expect("update");

        let streams = storage.list_streams().await.expect("list");
        assert_eq!(streams.len(), 1);
        assert!(!streams[0].enabled);
        assert_eq!(streams[0].config["guild"], "42");
    }

    #[tokio::test]
    async fn create_watermark_keeps_first_value() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let first = storage.create_watermark("s1", t0).await.expect("create");
        assert_eq!(first.watermark_time, t0);
        assert!(first.last_batch_at.is_none());

        let second = storage
            .create_watermark("s1", t0 + Duration::days(3))
            .await
            .expect("create again");
        assert_eq!(second.watermark_time, t0);
    }

    #[tokio::test]
    async fn advance_watermark_never_regresses() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        storage.create_watermark("s1", t0).await.unwrap();

        let later = t0 + Duration::hours(6);
        let wm = storage
            .advance_watermark("s1", later, Some(later))
            .await
            .expect("advance");
        assert_eq!(wm.watermark_time, later);
        assert_eq!(wm.last_batch_at, Some(later));

        let wm = storage
            .advance_watermark("s1", t0, None)
            .await
            .expect("stale advance");
        assert_eq!(wm.watermark_time, later);
        assert_eq!(wm.last_batch_at, Some(later));

        assert_eq!(storage.list_watermarks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("dd_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.create_watermark("s1", Utc::now()).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get_watermark("s1").await.unwrap().is_some());
        let result = ro.create_watermark("s2", Utc::now()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
