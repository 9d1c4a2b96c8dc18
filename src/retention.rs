//! The retention sweep (§4, "a retention sweep may delete by age"): a
//! daily background tick that prunes `request_log` and
//! `health_check_history` rows older than the configured window.
//!
//! Grounded on `availability.rs`'s own background-loop shape
//! (`start_background_polling`'s jitter + interval + stop-notify
//! pattern, reused verbatim here rather than re-invented) paired with
//! its `cleanup_old_records` and `request_log::cleanup_old_records`.

use futures::FutureExt;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Spawn the daily sweep. Runs once shortly after startup, then every
/// `SWEEP_INTERVAL`; `stop` lets the in-flight sweep finish before the
/// task exits, matching the availability monitor's shutdown contract.
pub fn spawn(pool: SqlitePool, days_to_keep: u32, stop: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = AssertUnwindSafe(sweep_once(&pool, days_to_keep)).catch_unwind().await;
            if let Err(panic) = result {
                error!(?panic, "retention sweep panicked");
            }

            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = stop.notified() => return,
            }
        }
    })
}

async fn sweep_once(pool: &SqlitePool, days_to_keep: u32) {
    match crate::request_log::cleanup_old_records(pool, days_to_keep).await {
        Ok(deleted) => info!(deleted, table = "request_log", "retention sweep complete"),
        Err(err) => error!(%err, table = "request_log", "retention sweep failed"),
    }

    match cleanup_old_health_records(pool, days_to_keep).await {
        Ok(deleted) => info!(deleted, table = "health_check_history", "retention sweep complete"),
        Err(err) => error!(%err, table = "health_check_history", "retention sweep failed"),
    }
}

/// Mirrors `AvailabilityMonitor::cleanup_old_records` but runs off a
/// bare pool, since the sweep task does not otherwise need a monitor
/// instance.
async fn cleanup_old_health_records(pool: &SqlitePool, days_to_keep: u32) -> Result<u64, sqlx::Error> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(days_to_keep as i64);
    let result = sqlx::query("DELETE FROM health_check_history WHERE checked_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(include_str!("../migrations/20260101000001_request_log.sql"))
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(include_str!("../migrations/20260101000002_health_check_history.sql"))
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn sweep_once_prunes_both_tables() {
        let pool = test_pool().await;
        let old = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();

        sqlx::query(
            "INSERT INTO request_log (platform, provider, model, http_status, is_stream, duration_ms, created_at)
             VALUES ('claude', 'p1', 'm', 200, 0, 10, ?)",
        )
        .bind(&old)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO health_check_history
                (provider_id, provider_name, platform, model, endpoint, status, latency_ms, error_message, checked_at)
             VALUES (1, 'p1', 'claude', 'm', '/v1/messages', 'operational', 5, NULL, ?)",
        )
        .bind(&old)
        .execute(&pool)
        .await
        .unwrap();

        sweep_once(&pool, 7).await;

        let request_log_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM request_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        let health_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM health_check_history")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(request_log_count.0, 0);
        assert_eq!(health_count.0, 0);
    }
}
