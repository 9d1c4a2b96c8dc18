//! `code-switch-relay stats`: summarize `request_log` and
//! `health_check_history` over a trailing window.
//!
//! Grounded on the teacher's `commands/stats.rs` `comfy-table`
//! presentation shape; the query set is rebuilt around the relay's own
//! schema (§3's two append-only tables) instead of the teacher's
//! per-API-key cost/quota rollups (no pricing is in scope).

use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use relay_gateway::config;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use tracing::info;

#[derive(Debug, FromRow)]
struct ProviderUsageRow {
    platform: String,
    provider: String,
    model: String,
    requests: i64,
    successes: i64,
    input_tokens: i64,
    output_tokens: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
}

#[derive(Debug, FromRow)]
struct HealthSummaryRow {
    platform: String,
    provider_name: String,
    status: String,
    checks: i64,
    avg_latency_ms: f64,
}

pub async fn execute(config_path: &str, hours: u32, detailed: bool) -> Result<()> {
    println!("Relay Statistics (last {hours}h)");
    println!("================================\n");

    info!(config_path, "loading configuration");
    let cfg = config::load_config(config_path)?;

    let db_url = format!("sqlite://{}?mode=rwc", cfg.data_dir.database_path().display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .with_context(|| format!("failed to open database at {db_url}"))?;

    let cutoff = (Utc::now() - chrono::Duration::hours(hours as i64)).to_rfc3339();

    display_request_summary(&pool, &cutoff).await?;
    display_health_summary(&pool, &cutoff).await?;
    if detailed {
        display_per_provider_breakdown(&pool, &cutoff).await?;
    }

    Ok(())
}

async fn display_request_summary(pool: &SqlitePool, cutoff: &str) -> Result<()> {
    let (requests, successes, input_tokens, output_tokens): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*),
                SUM(CASE WHEN http_status BETWEEN 200 AND 299 THEN 1 ELSE 0 END),
                COALESCE(SUM(input_tokens), 0),
                COALESCE(SUM(output_tokens), 0)
         FROM request_log WHERE created_at >= ?",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await
    .unwrap_or((0, 0, 0, 0));

    println!("Request summary:");
    println!("  Total requests:   {requests}");
    println!("  Successful:       {successes}");
    println!("  Failed:           {}", requests - successes);
    println!("  Input tokens:     {input_tokens}");
    println!("  Output tokens:    {output_tokens}\n");
    Ok(())
}

async fn display_health_summary(pool: &SqlitePool, cutoff: &str) -> Result<()> {
    let rows: Vec<HealthSummaryRow> = sqlx::query_as(
        "SELECT platform, provider_name, status, COUNT(*) as checks, AVG(latency_ms) as avg_latency_ms
         FROM health_check_history
         WHERE checked_at >= ?
         GROUP BY platform, provider_name, status
         ORDER BY platform, provider_name",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    if rows.is_empty() {
        println!("Availability: no health checks recorded in this window.\n");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Platform", "Provider", "Status", "Checks", "Avg latency (ms)"]);

    for row in &rows {
        let status_cell = match row.status.as_str() {
            "operational" => Cell::new(&row.status).fg(Color::Green),
            "degraded" => Cell::new(&row.status).fg(Color::Yellow),
            _ => Cell::new(&row.status).fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&row.platform),
            Cell::new(&row.provider_name),
            status_cell,
            Cell::new(row.checks),
            Cell::new(format!("{:.0}", row.avg_latency_ms)),
        ]);
    }

    println!("Availability:");
    println!("{table}\n");
    Ok(())
}

async fn display_per_provider_breakdown(pool: &SqlitePool, cutoff: &str) -> Result<()> {
    let rows: Vec<ProviderUsageRow> = sqlx::query_as(
        "SELECT platform, provider, model, COUNT(*) as requests,
                SUM(CASE WHEN http_status BETWEEN 200 AND 299 THEN 1 ELSE 0 END) as successes,
                COALESCE(SUM(input_tokens), 0) as input_tokens,
                COALESCE(SUM(output_tokens), 0) as output_tokens,
                COALESCE(SUM(cache_creation_input_tokens), 0) as cache_creation_tokens,
                COALESCE(SUM(cache_read_input_tokens), 0) as cache_read_tokens
         FROM request_log
         WHERE created_at >= ?
         GROUP BY platform, provider, model
         ORDER BY requests DESC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    if rows.is_empty() {
        println!("Per-provider breakdown: no requests recorded in this window.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Platform", "Provider", "Model", "Requests", "Success", "Input tok", "Output tok", "Cache create", "Cache read",
        ]);

    for row in &rows {
        table.add_row(vec![
            Cell::new(&row.platform),
            Cell::new(&row.provider),
            Cell::new(&row.model),
            Cell::new(row.requests),
            Cell::new(row.successes),
            Cell::new(row.input_tokens),
            Cell::new(row.output_tokens),
            Cell::new(row.cache_creation_tokens),
            Cell::new(row.cache_read_tokens),
        ]);
    }

    println!("Per-provider breakdown:");
    println!("{table}");
    Ok(())
}
