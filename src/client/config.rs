use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::common::models::MAX_START_OFFSET_SECS;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long an orchestrated operation may run before its loading step is
    /// forced to error.
    pub tx_timeout: Duration,
    pub auto_close_delay: Duration,
    /// Added to every group's activation time when deriving its start date.
    pub start_grace_secs: i64,
    pub history_chunk_size: u64,
    pub history_max_blocks: u64,
    pub history_ttl_secs: u64,
    pub redis_url: Option<String>,
    /// CSV that partial-success payments are appended to.
    pub reconciliation_log: Option<PathBuf>,
    pub log_level: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tx_timeout: Duration::from_millis(120_000),
            auto_close_delay: Duration::from_millis(1_000),
            start_grace_secs: 0,
            history_chunk_size: 5_000,
            history_max_blocks: 500_000,
            history_ttl_secs: 7 * 24 * 3600,
            redis_url: None,
            reconciliation_log: None,
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("[CONFIG] Ignoring unparseable {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn bounded_grace(secs: i64, default: i64) -> i64 {
    if (0..=MAX_START_OFFSET_SECS).contains(&secs) {
        secs
    } else {
        warn!("[CONFIG] START_GRACE_SECS={} is outside 0..={}, using default", secs, MAX_START_OFFSET_SECS);
        default
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            tx_timeout: Duration::from_millis(env_or("TX_TIMEOUT_MS", 120_000u64)),
            auto_close_delay: Duration::from_millis(env_or("AUTO_CLOSE_DELAY_MS", 1_000u64)),
            start_grace_secs: bounded_grace(
                env_or("START_GRACE_SECS", defaults.start_grace_secs),
                defaults.start_grace_secs,
            ),
            history_chunk_size: env_or("HISTORY_CHUNK_SIZE", defaults.history_chunk_size).max(1),
            history_max_blocks: env_or("HISTORY_MAX_BLOCKS", defaults.history_max_blocks),
            history_ttl_secs: env_or("HISTORY_TTL_SECS", defaults.history_ttl_secs),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            reconciliation_log: env::var("RECONCILIATION_LOG")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        info!("[CONFIG] Reconciler configuration loaded:");
        info!("  Transaction timeout: {:?}", config.tx_timeout);
        info!("  Auto-close delay: {:?}", config.auto_close_delay);
        info!("  History chunk/max blocks: {}/{}", config.history_chunk_size, config.history_max_blocks);
        info!("  Redis history store: {}", if config.redis_url.is_some() { "enabled" } else { "disabled" });
        config
    }
}
