//! Durable per-stream watermarks.
//!
//! A watermark is the lower bound of a stream's next batch window. It is
//! seeded lazily and only ever moves forward; a failed batch simply never
//! advances it, so the next run recomputes the same window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use docdrift_shared::{Result, Watermark};
use docdrift_storage::Storage;

pub struct WatermarkManager {
    storage: Arc<Storage>,
    lookback: chrono::Duration,
}

impl WatermarkManager {
    /// `lookback` seeds streams that have no pending messages yet.
    pub fn new(storage: Arc<Storage>, lookback: chrono::Duration) -> Self {
        Self { storage, lookback }
    }

    /// Return the stream's watermark, creating it on first use.
    ///
    /// The seed is the earliest PENDING message timestamp, or
    /// `now - lookback` when the stream has none. Seeds never lie in the future.
    pub async fn initialize(&self, stream_id: &str) -> Result<Watermark> {
        if let Some(existing) = self.storage.get_watermark(stream_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let seed = match self.storage.earliest_pending_timestamp(stream_id).await? {
            Some(earliest) => earliest.min(now),
            None => now - self.lookback,
        };

        let created = self.storage.create_watermark(stream_id, seed).await?;
        info!(stream = stream_id, watermark = %created.watermark_time, "watermark initialized");
        Ok(created)
    }

    /// Move the watermark forward to `to`, clamped to the current time.
    ///
    /// Idempotent; an older `to` leaves the stored value untouched.
    pub async fn advance(&self, stream_id: &str, to: DateTime<Utc>) -> Result<Watermark> {
        let target = to.min(Utc::now());
        let updated = self.storage.advance_watermark(stream_id, target, None).await?;
        debug!(stream = stream_id, watermark = %updated.watermark_time, "watermark advanced");
        Ok(updated)
    }
}
