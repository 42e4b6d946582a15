//! Durable offline buffer with retry scheduling and TTL expiry.
//!
//! One row per `(signal, target)` pair.  Rows start `pending` and end in
//! exactly one terminal state: `delivered` when the delivery callback
//! succeeds, `failed` when the retry budget is exhausted or a flush pass
//! gives up, `expired` when the TTL deadline passes.  Terminal rows are
//! never re-scheduled.
//!
//! The delivery callback is installed once at startup by the host and is
//! invoked only from this manager.  Retries for a given row are serialized:
//! the periodic pass works the selection sequentially and the node runs at
//! most one pass at a time.

use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::events::{topic, EventBus};
use crate::rlog;
use crate::storage::{
    now_ms, BufferFilter, BufferStateCounts, BufferStatus, BufferedSignalRow, Priority, Store,
    StoreError,
};

/// Async delivery hook: given a buffered row, attempt one delivery and
/// report success.  Owned by the buffer manager; write-once.
pub type DeliveryCallback =
    Arc<dyn Fn(BufferedSignalRow) -> BoxFuture<'static, bool> + Send + Sync>;

/// Counts from one `process_buffer` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub expired: usize,
    pub attempted: usize,
    pub delivered: usize,
    /// Rows whose retry budget ran out on this pass.
    pub exhausted: usize,
}

/// Counts from a `retry_buffered` or `flush_buffer` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Whether a pending row's backoff interval has elapsed.
///
/// The interval is indexed by the retry count with the last entry clamped,
/// giving exponential-ish backoff measured from the more recent of
/// `last_retry_at` and `buffered_at`.
fn due_for_retry(row: &BufferedSignalRow, now: u64, intervals: &[u64]) -> bool {
    if intervals.is_empty() {
        return true;
    }
    let index = (row.retry_count as usize).min(intervals.len() - 1);
    let reference = row.last_retry_at.unwrap_or(row.buffered_at);
    now.saturating_sub(reference) >= intervals[index]
}

pub struct BufferManager {
    store: Arc<Mutex<Store>>,
    events: EventBus,
    config: BufferConfig,
    callback: OnceLock<DeliveryCallback>,
}

impl BufferManager {
    pub fn new(store: Arc<Mutex<Store>>, events: EventBus, config: BufferConfig) -> Self {
        Self {
            store,
            events,
            config,
            callback: OnceLock::new(),
        }
    }

    /// Install the delivery callback.  Write-once; a second install is
    /// ignored and logged.
    pub fn install_delivery_callback(&self, callback: DeliveryCallback) {
        if self.callback.set(callback).is_err() {
            rlog!("buffer: delivery callback already installed, ignoring reinstall");
        }
    }

    /// Enqueue a signal for an offline target.  Returns the buffer id.
    pub async fn buffer_signal(
        &self,
        signal_type: u16,
        source_server: &str,
        target_server: &str,
        payload: Map<String, Value>,
        priority: Priority,
    ) -> Result<String, StoreError> {
        let buffered_at = now_ms();
        let row = BufferedSignalRow {
            id: Uuid::new_v4().to_string(),
            signal_type,
            source_server: source_server.to_string(),
            target_server: target_server.to_string(),
            payload,
            priority,
            buffered_at,
            retry_count: 0,
            last_retry_at: None,
            max_retries: self.config.max_retries,
            expires_at: Some(buffered_at + self.config.ttl_hours * 3_600_000),
            status: BufferStatus::Pending,
        };

        {
            let store = self.store.lock().await;
            if store.pending_count()? >= self.config.max_size as i64 {
                if let Some(evicted) = store.evict_oldest_pending()? {
                    rlog!("buffer: at capacity, evicted oldest pending {evicted}");
                }
            }
            store.insert_buffered(&row)?;
        }

        self.events.emit(
            topic::RELAY_BUFFERED,
            json!({
                "buffer_id": row.id,
                "signal_type": signal_type,
                "target_server": target_server,
            }),
        );
        Ok(row.id)
    }

    /// One periodic pass: expire overdue rows, then retry every pending row
    /// whose backoff interval has elapsed.
    pub async fn process_buffer(&self) -> Result<ProcessOutcome, StoreError> {
        let now = now_ms();
        let mut outcome = ProcessOutcome::default();

        let (expired_ids, candidates) = {
            let store = self.store.lock().await;
            let ids = store.list_expirable_ids(now)?;
            let swept = store.expire_pending(now)?;
            debug_assert_eq!(ids.len(), swept);
            (ids, store.select_retryable(now)?)
        };

        outcome.expired = expired_ids.len();
        for id in &expired_ids {
            self.events
                .emit(topic::BUFFER_EXPIRED, json!({ "buffer_id": id }));
        }

        let due: Vec<BufferedSignalRow> = candidates
            .into_iter()
            .filter(|row| due_for_retry(row, now, &self.config.retry_intervals_ms))
            .collect();

        for row in due {
            outcome.attempted += 1;
            match self.attempt_delivery(row).await? {
                AttemptResult::Delivered => outcome.delivered += 1,
                AttemptResult::Exhausted => outcome.exhausted += 1,
                AttemptResult::Rescheduled | AttemptResult::Skipped => {}
            }
        }
        Ok(outcome)
    }

    /// Attempt delivery of the listed pending rows exactly once each,
    /// bypassing the backoff check.
    pub async fn retry_buffered(&self, ids: &[String]) -> Result<RetryOutcome, StoreError> {
        let rows = self.store.lock().await.select_pending_by_ids(ids)?;
        let mut outcome = RetryOutcome::default();
        for row in rows {
            outcome.attempted += 1;
            match self.attempt_delivery(row).await? {
                AttemptResult::Delivered => outcome.delivered += 1,
                AttemptResult::Exhausted => outcome.failed += 1,
                AttemptResult::Rescheduled | AttemptResult::Skipped => {}
            }
        }
        Ok(outcome)
    }

    /// Drain every pending row (optionally for one target): each row is
    /// delivered or marked failed on this pass, never retried again.
    pub async fn flush_buffer(&self, target: Option<&str>) -> Result<RetryOutcome, StoreError> {
        let rows = self.store.lock().await.list_pending(target)?;
        let mut outcome = RetryOutcome::default();
        for row in rows {
            let id = row.id.clone();
            let target_server = row.target_server.clone();
            let signal_type = row.signal_type;
            outcome.attempted += 1;

            if self.invoke_callback(row).await {
                if self.store.lock().await.mark_buffer_delivered(&id)? {
                    outcome.delivered += 1;
                    self.emit_delivered(&id, &target_server, signal_type);
                }
            } else if self.store.lock().await.mark_buffer_failed(&id)? {
                outcome.failed += 1;
            }
        }
        Ok(outcome)
    }

    /// Delete matching rows.  The store rejects an empty filter.
    pub async fn clear_buffered(&self, filter: &BufferFilter) -> Result<usize, StoreError> {
        self.store.lock().await.clear_buffered(filter)
    }

    pub async fn list_buffered(
        &self,
        filter: &BufferFilter,
    ) -> Result<Vec<BufferedSignalRow>, StoreError> {
        self.store.lock().await.list_buffered(filter)
    }

    pub async fn state_counts(&self) -> Result<BufferStateCounts, StoreError> {
        self.store.lock().await.buffer_state_counts()
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    async fn invoke_callback(&self, row: BufferedSignalRow) -> bool {
        match self.callback.get() {
            Some(callback) => callback(row).await,
            None => {
                rlog!("buffer: no delivery callback installed, treating attempt as failed");
                false
            }
        }
    }

    async fn attempt_delivery(&self, row: BufferedSignalRow) -> Result<AttemptResult, StoreError> {
        let id = row.id.clone();
        let target_server = row.target_server.clone();
        let signal_type = row.signal_type;
        let attempt = row.retry_count + 1;

        self.events.emit(
            topic::BUFFER_RETRY,
            json!({
                "buffer_id": id,
                "target_server": target_server,
                "attempt": attempt,
            }),
        );

        if self.invoke_callback(row).await {
            // The row may have gone terminal since selection; the guarded
            // update keeps this idempotent.
            if self.store.lock().await.mark_buffer_delivered(&id)? {
                self.emit_delivered(&id, &target_server, signal_type);
                return Ok(AttemptResult::Delivered);
            }
            return Ok(AttemptResult::Skipped);
        }

        match self.store.lock().await.record_retry_failure(&id, now_ms())? {
            Some(BufferStatus::Failed) => Ok(AttemptResult::Exhausted),
            Some(_) => Ok(AttemptResult::Rescheduled),
            None => Ok(AttemptResult::Skipped),
        }
    }

    fn emit_delivered(&self, buffer_id: &str, target_server: &str, signal_type: u16) {
        self.events.emit(
            topic::RELAY_SENT,
            json!({
                "buffer_id": buffer_id,
                "target_server": target_server,
                "signal_type": signal_type,
            }),
        );
    }
}

enum AttemptResult {
    Delivered,
    Rescheduled,
    Exhausted,
    /// Row went terminal between selection and update.
    Skipped,
}
