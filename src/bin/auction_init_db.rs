use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::fs;
use std::time::Duration;

// Must match src/events.rs. Startup also upserts these, so a drift here only
// costs an extra no-op insert at boot.
const EVENT_CODES: [&str; 5] = [
    "BID_ACCEPTED",
    "BID_REJECTED",
    "STATUS_CHANGED",
    "DELAYED_BIDS_INJECTED",
    "RELISTED",
];

fn split_sql_statements(input: &str) -> Vec<String> {
    // Simple splitter suitable for our schema.sql (no functions / dollar-quoting).
    // Skips comments/whitespace-only segments.
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if !in_single && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' => {
                    in_single = !in_single;
                    cur.push(ch);
                }
                ';' if !in_single => {
                    let s = cur.trim();
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                    cur.clear();
                }
                _ => cur.push(ch),
            }
        }
        cur.push('\n');
    }
    let s = cur.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let max = env_u32("DB_MAX_POOL_SIZE", 4).max(1);
    let acquire = env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30).max(5);
    let schema_path =
        std::env::var("SCHEMA_PATH").unwrap_or_else(|_| "schema.sql".to_string());

    let db = PgPoolOptions::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(acquire))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    // Hard reset (clean schema). POSTGRES_USER in compose is a superuser in dev.
    sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
        .execute(&db)
        .await
        .context("drop public schema")?;
    sqlx::query("CREATE SCHEMA public")
        .execute(&db)
        .await
        .context("create public schema")?;

    let schema_sql =
        fs::read_to_string(&schema_path).with_context(|| format!("read {schema_path}"))?;
    let statements = split_sql_statements(&schema_sql);
    for stmt in &statements {
        sqlx::query(stmt)
            .execute(&db)
            .await
            .with_context(|| {
                format!("exec schema stmt: {}", stmt.lines().next().unwrap_or("<empty>"))
            })?;
    }

    for code in EVENT_CODES {
        sqlx::query("INSERT INTO event_types (code) VALUES ($1) ON CONFLICT (code) DO NOTHING")
            .bind(code)
            .execute(&db)
            .await
            .with_context(|| format!("seed event type {code}"))?;
    }
    let event_types: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_types")
        .fetch_one(&db)
        .await
        .context("count event types")?;

    println!(
        "initialized: statements={}, event_types={}",
        statements.len(),
        event_types
    );

    Ok(())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
