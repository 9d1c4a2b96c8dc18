//! The failure counter + persistent ban state machine (§4.2).
//!
//! Grounded on the teacher's `load_balancer.rs` (`HealthState`/
//! `InstanceHealth`, `mark_instance_failure`, DashMap-backed per-key
//! state) and `retry.rs` (`is_instance_failure`, now superseded by
//! `RelayError::is_counted_failure`/`is_failover_eligible`).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// In-memory consecutive-failure counter for one `(platform, provider)`.
#[derive(Debug, Clone, Default)]
struct FailureCounter {
    consecutive_fails: u32,
    last_failed_at: Option<DateTime<Utc>>,
}

/// An active (or expired-but-not-yet-swept) ban row.
#[derive(Debug, Clone)]
pub struct Ban {
    pub until: DateTime<Utc>,
    pub reason: String,
}

pub struct Blacklist {
    counters: DashMap<(String, String), FailureCounter>,
    pool: SqlitePool,
}

impl Blacklist {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            counters: DashMap::new(),
            pool,
        }
    }

    /// Record a failed attempt. If the counter reaches `threshold` and
    /// `auto_blacklist` is set, upsert a ban and reset the counter to
    /// zero (§4.2 `recordFailure`).
    pub async fn record_failure(
        &self,
        platform: &str,
        provider: &str,
        threshold: u32,
        duration_minutes: u32,
        auto_blacklist: bool,
    ) {
        let count = {
            let mut entry = self
                .counters
                .entry((platform.to_string(), provider.to_string()))
                .or_default();
            entry.consecutive_fails += 1;
            entry.last_failed_at = Some(Utc::now());
            entry.consecutive_fails
        };

        if count >= threshold && auto_blacklist {
            let until = Utc::now() + Duration::minutes(duration_minutes as i64);
            let reason = format!("{count} consecutive failures");

            if let Err(err) = self.upsert_ban(platform, provider, until, &reason).await {
                warn!(platform, provider, %err, "failed to persist blacklist ban");
            } else {
                info!(platform, provider, %until, "provider blacklisted");
            }

            self.counters
                .insert((platform.to_string(), provider.to_string()), FailureCounter::default());
        }
    }

    /// Reset the counter on success. A successful probe does NOT
    /// un-ban an already-banned provider (§4.2 `recordSuccess`).
    pub fn record_success(&self, platform: &str, provider: &str) {
        self.counters
            .remove(&(platform.to_string(), provider.to_string()));
    }

    /// Explicit unban, clearing both the counter and any active ban.
    pub async fn unban(&self, platform: &str, provider: &str) -> Result<(), sqlx::Error> {
        self.counters
            .remove(&(platform.to_string(), provider.to_string()));
        sqlx::query("DELETE FROM blacklist WHERE platform = ? AND provider_name = ?")
            .bind(platform)
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Is `(platform, provider)` currently banned? Expiry is lazy: a
    /// lookup past `until` treats the row as absent, with no explicit
    /// cleanup required for correctness (a retention sweep may still
    /// delete stale rows later).
    pub async fn is_blacklisted(&self, platform: &str, provider: &str) -> Option<Ban> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT until, reason FROM blacklist WHERE platform = ? AND provider_name = ?",
        )
        .bind(platform)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        let (until_str, reason) = row?;
        let until: DateTime<Utc> = until_str.parse().ok()?;

        if until > Utc::now() {
            Some(Ban { until, reason })
        } else {
            None
        }
    }

    async fn upsert_ban(
        &self,
        platform: &str,
        provider: &str,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO blacklist (platform, provider_name, until, reason)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(platform, provider_name)
             DO UPDATE SET until = excluded.until, reason = excluded.reason",
        )
        .bind(platform)
        .bind(provider)
        .bind(until.to_rfc3339())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
