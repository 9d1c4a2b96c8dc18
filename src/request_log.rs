//! The request-log write queue (§4.1, §5 "DB write queue"): a bounded,
//! in-memory buffer of completed-request events drained by a single
//! background writer in batches, so no request-handling thread ever
//! opens its own SQLite write transaction.
//!
//! Grounded on the teacher's `observability/request_logger.rs`-style
//! batching and the `AssertUnwindSafe(...).catch_unwind()` idiom
//! `availability.rs` already uses for its own background loop;
//! generalized from "one timer tick" to "woken on enqueue or timer,
//! whichever comes first, batched, bounded with drop-oldest overflow".

use crate::sse::UsageTotals;
use chrono::Utc;
use futures::FutureExt;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{error, warn};

/// One completed request, ready to become a `request_log` row.
#[derive(Debug, Clone)]
pub struct RequestLogEvent {
    pub platform: String,
    pub provider: String,
    pub model: String,
    pub http_status: u16,
    pub is_stream: bool,
    pub duration: Duration,
    pub totals: UsageTotals,
}

const DEFAULT_BATCH_SIZE: usize = 200;

/// The bounded FIFO buffer plus overflow bookkeeping. `enqueue` is
/// synchronous and non-blocking, callable from inside the dispatcher's
/// async handlers without an `.await`.
pub struct RequestLogQueue {
    buffer: Mutex<VecDeque<RequestLogEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl RequestLogQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push `event` onto the queue. If the buffer is at capacity, the
    /// oldest entry is dropped to make room (§5 backpressure: "overflow
    /// drops the oldest entries with a warning rather than blocking
    /// requests").
    pub fn enqueue(&self, event: RequestLogEvent) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            let total_dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total_dropped, "request log queue full, dropped oldest entry");
        }
        buffer.push_back(event);
        drop(buffer);
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn drain(&self, max: usize) -> Vec<RequestLogEvent> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let n = buffer.len().min(max);
        buffer.drain(..n).collect()
    }
}

/// Spawn the single background writer. Wakes on enqueue or on
/// `flush_interval`, whichever is sooner, drains up to
/// `DEFAULT_BATCH_SIZE` events, and inserts them in one transaction.
/// `stop` lets the caller flush and exit during graceful shutdown.
pub fn spawn_writer(
    queue: std::sync::Arc<RequestLogQueue>,
    pool: SqlitePool,
    flush_interval: Duration,
    stop: std::sync::Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(flush_interval) => {}
                _ = stop.notified() => {
                    flush_all(&queue, &pool).await;
                    return;
                }
            }

            let result = AssertUnwindSafe(flush_once(&queue, &pool)).catch_unwind().await;
            if let Err(panic) = result {
                error!(?panic, "request log writer tick panicked");
            }
        }
    })
}

async fn flush_once(queue: &RequestLogQueue, pool: &SqlitePool) {
    let batch = queue.drain(DEFAULT_BATCH_SIZE);
    if batch.is_empty() {
        return;
    }
    if let Err(err) = insert_batch(pool, &batch).await {
        error!(%err, rows = batch.len(), "failed to write request_log batch");
    }
}

/// Drain and insert everything remaining, looping until the buffer is
/// empty, for a clean shutdown.
async fn flush_all(queue: &RequestLogQueue, pool: &SqlitePool) {
    loop {
        let batch = queue.drain(DEFAULT_BATCH_SIZE);
        if batch.is_empty() {
            return;
        }
        if let Err(err) = insert_batch(pool, &batch).await {
            error!(%err, rows = batch.len(), "failed to write final request_log batch");
            return;
        }
    }
}

async fn insert_batch(pool: &SqlitePool, batch: &[RequestLogEvent]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = Utc::now().to_rfc3339();

    for event in batch {
        sqlx::query(
            "INSERT INTO request_log
                (platform, provider, model, http_status,
                 input_tokens, output_tokens, cache_creation_input_tokens,
                 cache_read_input_tokens, reasoning_tokens,
                 is_stream, duration_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.platform)
        .bind(&event.provider)
        .bind(&event.model)
        .bind(event.http_status as i64)
        .bind(event.totals.input_tokens as i64)
        .bind(event.totals.output_tokens as i64)
        .bind(event.totals.cache_creation_input_tokens as i64)
        .bind(event.totals.cache_read_input_tokens as i64)
        .bind(event.totals.reasoning_tokens as i64)
        .bind(event.is_stream)
        .bind(event.duration.as_millis() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Retention sweep: delete `request_log` rows older than `days_to_keep`
/// (§4 "Request log row", "a retention sweep may delete by age").
pub async fn cleanup_old_records(pool: &SqlitePool, days_to_keep: u32) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - chrono::Duration::days(days_to_keep as i64);
    let result = sqlx::query("DELETE FROM request_log WHERE created_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
