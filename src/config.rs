use anyhow::{anyhow, Result};
use chrono::Duration;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) api: ApiConfig,
    pub(crate) auction: AuctionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AuctionConfig {
    pub(crate) quiet_period_seconds: u64,
    pub(crate) delayed_cutoff_hours: i64,
    pub(crate) relist_delay_seconds: u64,
    pub(crate) default_relist_duration_seconds: u64,
    pub(crate) sweep_tick_seconds: u64,
    pub(crate) relist_tick_seconds: u64,
    pub(crate) bid_lock_retries: u32,
    pub(crate) bid_lock_timeout_ms: u64,
}

impl AuctionConfig {
    pub(crate) fn quiet_period(&self) -> Duration {
        Duration::seconds(self.quiet_period_seconds as i64)
    }

    pub(crate) fn delayed_cutoff(&self) -> Duration {
        Duration::hours(self.delayed_cutoff_hours)
    }

    pub(crate) fn relist_delay(&self) -> Duration {
        Duration::seconds(self.relist_delay_seconds as i64)
    }

    pub(crate) fn default_relist_duration(&self) -> Duration {
        Duration::seconds(self.default_relist_duration_seconds as i64)
    }
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 10),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 60),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("API_PORT", 8000),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        auction: AuctionConfig {
            quiet_period_seconds: env_u64("AUCTION_QUIET_PERIOD_SECONDS", 300),
            delayed_cutoff_hours: env_i64("AUCTION_DELAYED_CUTOFF_HOURS", 3),
            relist_delay_seconds: env_u64("AUCTION_RELIST_DELAY_SECONDS", 86_400),
            default_relist_duration_seconds: env_u64(
                "AUCTION_DEFAULT_RELIST_DURATION_SECONDS",
                604_800,
            ),
            sweep_tick_seconds: env_u64("AUCTION_SWEEP_TICK_SECONDS", 5),
            relist_tick_seconds: env_u64("AUCTION_RELIST_TICK_SECONDS", 60),
            bid_lock_retries: env_u32("BID_LOCK_RETRIES", 3),
            bid_lock_timeout_ms: env_u64("BID_LOCK_TIMEOUT_MS", 250),
        },
    };
    if cfg.auction.quiet_period_seconds == 0 {
        return Err(anyhow!("AUCTION_QUIET_PERIOD_SECONDS must be positive"));
    }
    if cfg.auction.delayed_cutoff_hours < 0 {
        return Err(anyhow!("AUCTION_DELAYED_CUTOFF_HOURS must not be negative"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
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

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}
