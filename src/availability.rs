//! The background availability monitor (§4.3): periodic fan-out probes
//! over opted-in providers, rolling history in SQLite, and feeding the
//! same blacklist state machine live traffic drives.
//!
//! Grounded on the teacher's `load_balancer.rs` `health_recovery_loop()`
//! / `perform_active_health_check()` — the background-task-with-
//! panic-catch idiom and the "GET a cheap endpoint, time it, classify"
//! shape are kept; generalized from "recheck one unhealthy instance"
//! to "sweep every opted-in provider every tick with bounded
//! concurrency".

use crate::auth_forward::{apply_gemini_auth, apply_provider_auth};
use crate::blacklist::Blacklist;
use crate::http_client::HttpClientCell;
use crate::provider::{Platform, Provider};
use crate::provider_store::ProviderStore;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Operational,
    Degraded,
    Failed,
    ValidationFailed,
}

impl HealthStatus {
    fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Operational => "operational",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
            HealthStatus::ValidationFailed => "validation_failed",
        }
    }
}

/// The blacklist knobs the monitor needs to feed a probe outcome
/// into §4.2 the same way live dispatch traffic does. Mirrors
/// `config::BlacklistConfig`'s `failure_threshold`/`duration_minutes`
/// without creating a dependency from this module onto `Config` itself.
#[derive(Debug, Clone, Copy)]
pub struct BlacklistFeedConfig {
    pub failure_threshold: u32,
    pub duration_minutes: u32,
}

pub struct AvailabilityMonitor {
    pool: SqlitePool,
    provider_store: Arc<ProviderStore>,
    blacklist: Arc<Blacklist>,
    http_client: Arc<HttpClientCell>,
    stop: Arc<Notify>,
}

impl AvailabilityMonitor {
    pub fn new(
        pool: SqlitePool,
        provider_store: Arc<ProviderStore>,
        blacklist: Arc<Blacklist>,
        http_client: Arc<HttpClientCell>,
    ) -> Self {
        Self {
            pool,
            provider_store,
            blacklist,
            http_client,
            stop: Arc::new(Notify::new()),
        }
    }

    /// Spawn the background polling loop: initial jitter in [0, 10s],
    /// then a fixed interval. `stopBackgroundPolling` lets the
    /// in-flight tick finish its probes before the task exits.
    pub fn start_background_polling(
        self: Arc<Self>,
        poll_interval: Duration,
        operational_threshold: Duration,
        probe_timeout: Duration,
        max_concurrent: usize,
        blacklist_config: BlacklistFeedConfig,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let jitter = Duration::from_millis(rand::random::<u64>() % 10_000);
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = self.stop.notified() => return,
            }

            loop {
                let result = AssertUnwindSafe(self.run_all_checks(
                    operational_threshold,
                    probe_timeout,
                    max_concurrent,
                    blacklist_config,
                ))
                .catch_unwind()
                .await;

                if let Err(panic) = result {
                    error!(?panic, "availability monitor tick panicked");
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = self.stop.notified() => return,
                }
            }
        })
    }

    pub fn stop_background_polling(&self) {
        self.stop.notify_waiters();
    }

    /// Probe every opted-in provider across every known platform, with
    /// concurrency capped at `max_concurrent`.
    pub async fn run_all_checks(
        &self,
        operational_threshold: Duration,
        probe_timeout: Duration,
        max_concurrent: usize,
        blacklist_config: BlacklistFeedConfig,
    ) {
        let mut targets = Vec::new();
        for platform in self.provider_store.known_platforms() {
            for provider in self.provider_store.load(&platform).iter() {
                if provider.availability_monitor_enabled {
                    targets.push((platform.clone(), provider.clone()));
                }
            }
        }

        stream::iter(targets)
            .for_each_concurrent(max_concurrent, |(platform, provider)| {
                let timeout = provider
                    .availability
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(probe_timeout);
                async move {
                    self.run_single_check(&platform, &provider, operational_threshold, timeout, blacklist_config)
                        .await;
                }
            })
            .await;
    }

    /// Probe a single provider and feed the result into the blacklist
    /// (§4.3's last bullet).
    pub async fn run_single_check(
        &self,
        platform: &Platform,
        provider: &Provider,
        operational_threshold: Duration,
        timeout: Duration,
        blacklist_config: BlacklistFeedConfig,
    ) {
        let model = provider
            .availability
            .test_model
            .clone()
            .unwrap_or_else(|| "probe-model".to_string());
        let effective_model = provider.effective_model(&model).to_string();
        let endpoint = provider
            .availability
            .test_endpoint
            .clone()
            .unwrap_or_else(|| provider.effective_endpoint(platform).to_string());

        let body = build_probe_body(platform, &effective_model);
        let url = format!("{}{}", provider.base_url, endpoint);

        let client = self.http_client.current();
        let started = Instant::now();

        let mut request = client.post(&url).json(&body).timeout(timeout);
        request = request.header("Accept", "application/json");
        request = if matches!(platform, Platform::Gemini) {
            apply_gemini_auth(request, provider)
        } else {
            apply_provider_auth(request, provider)
        };

        let outcome = request.send().await;
        let latency = started.elapsed();

        let (status, error_message) = match outcome {
            Ok(response) => {
                let code = response.status();
                let _ = response.bytes().await; // read at most a small body; error is non-fatal
                let (status, reason) = classify_http(code, latency, operational_threshold);
                (status, reason.map(|reason| format!("failed ({reason}): HTTP {code}")))
            }
            Err(err) if err.is_timeout() => {
                (HealthStatus::Failed, Some("failed (timeout)".to_string()))
            }
            Err(err) => (HealthStatus::Failed, Some(crate::logging::sanitize_log_value(&err.to_string()))),
        };

        self.record_health(platform, provider, &effective_model, &endpoint, status, latency, error_message)
            .await;

        if provider.connectivity_auto_blacklist {
            match status {
                HealthStatus::Failed | HealthStatus::ValidationFailed => {
                    self.blacklist
                        .record_failure(
                            &platform.key(),
                            &provider.name,
                            blacklist_config.failure_threshold,
                            blacklist_config.duration_minutes,
                            true,
                        )
                        .await;
                }
                HealthStatus::Operational => {
                    self.blacklist.record_success(&platform.key(), &provider.name);
                }
                HealthStatus::Degraded => {}
            }
        }
    }

    async fn record_health(
        &self,
        platform: &Platform,
        provider: &Provider,
        model: &str,
        endpoint: &str,
        status: HealthStatus,
        latency: Duration,
        error_message: Option<String>,
    ) {
        let result = sqlx::query(
            "INSERT INTO health_check_history
                (provider_id, provider_name, platform, model, endpoint, status, latency_ms, error_message, checked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(provider.id as i64)
        .bind(&provider.name)
        .bind(platform.key())
        .bind(model)
        .bind(endpoint)
        .bind(status.as_str())
        .bind(latency.as_millis() as i64)
        .bind(&error_message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(%err, provider = %provider.name, "failed to write health_check_history row");
        } else {
            info!(
                provider = %provider.name,
                status = status.as_str(),
                latency_ms = latency.as_millis() as u64,
                error = error_message.as_deref().unwrap_or(""),
                "health check completed"
            );
        }
    }

    /// Retention sweep: delete `health_check_history` rows older than
    /// `days_to_keep` (§4.3 `cleanupOldRecords`, default 7).
    pub async fn cleanup_old_records(&self, days_to_keep: u32) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep as i64);
        let result = sqlx::query("DELETE FROM health_check_history WHERE checked_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Classify an HTTP outcome per §4.3's threshold table. Returns the
/// failure reason bucket alongside the status so callers can record
/// why a probe failed, not just that it did.
fn classify_http(
    status: reqwest::StatusCode,
    latency: Duration,
    operational_threshold: Duration,
) -> (HealthStatus, Option<&'static str>) {
    if status.is_success() {
        if latency <= operational_threshold {
            (HealthStatus::Operational, None)
        } else {
            (HealthStatus::Degraded, None)
        }
    } else {
        let reason = match status.as_u16() {
            401 | 403 => "auth",
            429 => "rate limit",
            400 => "bad request",
            500..=599 => "server",
            _ => "client",
        };
        (HealthStatus::Failed, Some(reason))
    }
}

/// Build the minimal probe body for `platform` (§4.3, with the Codex
/// body shape resolved per DESIGN.md's Open Question decision: `input`
/// is an array, `max_output_tokens` is sent, `max_tokens` is not).
pub fn build_probe_body(platform: &Platform, model: &str) -> serde_json::Value {
    match platform {
        Platform::Claude | Platform::Custom(_) => json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}],
        }),
        Platform::Codex => json!({
            "model": model,
            "input": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
            "max_output_tokens": 1,
        }),
        Platform::Gemini => json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 1},
        }),
    }
}

use futures::FutureExt;
