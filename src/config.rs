//! Engine tunables, read from the environment with defaults.

use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::util::env::{db_url, env_opt, env_parse};

pub const DEFAULT_MAX_AGE_HOURS: i64 = 1;
pub const DEFAULT_BACKFILL_PAGE_SIZE: i64 = 10;
pub const DEFAULT_STALE_SWEEP_LIMIT: i64 = 50;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Freshness window applied when a caller passes no explicit `max_age`.
    pub max_age: Duration,
    /// Games without any price record picked up per backfill cycle.
    pub backfill_page_size: i64,
    /// Stale price records refreshed per stale sweep.
    pub stale_sweep_limit: i64,
    /// Pause between consecutive external fetches inside a sweep.
    pub request_delay: StdDuration,
    pub database_url: String,
    pub db_max_connections: u32,
    pub stores: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub steam_country: String,
    pub steam_language: String,
    pub epic_country: String,
    pub epic_locale: String,
    pub http_timeout: StdDuration,
    /// Lifetime of a storefront's cached catalog listing.
    pub catalog_ttl: StdDuration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            steam_country: "jp".into(),
            steam_language: "japanese".into(),
            epic_country: "JP".into(),
            epic_locale: "ja".into(),
            http_timeout: StdDuration::from_secs(10),
            catalog_ttl: StdDuration::from_secs(6 * 3600),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(DEFAULT_MAX_AGE_HOURS),
            backfill_page_size: DEFAULT_BACKFILL_PAGE_SIZE,
            stale_sweep_limit: DEFAULT_STALE_SWEEP_LIMIT,
            request_delay: StdDuration::from_millis(200),
            database_url: crate::util::env::DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 5,
            stores: StoreSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let store_defaults = defaults.stores.clone();

        let max_age = max_age_from_hours(env_parse(
            "PRICE_CACHE_MAX_AGE_HOURS",
            DEFAULT_MAX_AGE_HOURS,
        ))
        .unwrap_or(defaults.max_age);

        Self {
            max_age,
            backfill_page_size: env_parse("BACKFILL_PAGE_SIZE", DEFAULT_BACKFILL_PAGE_SIZE).max(1),
            stale_sweep_limit: env_parse("STALE_SWEEP_LIMIT", DEFAULT_STALE_SWEEP_LIMIT).max(1),
            request_delay: StdDuration::from_millis(env_parse("SWEEP_REQUEST_DELAY_MS", 200u64)),
            database_url: db_url(),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            stores: StoreSettings {
                steam_country: env_opt("STEAM_COUNTRY").unwrap_or(store_defaults.steam_country),
                steam_language: env_opt("STEAM_LANGUAGE").unwrap_or(store_defaults.steam_language),
                epic_country: env_opt("EPIC_COUNTRY").unwrap_or(store_defaults.epic_country),
                epic_locale: env_opt("EPIC_LOCALE").unwrap_or(store_defaults.epic_locale),
                http_timeout: StdDuration::from_secs(env_parse("STORE_HTTP_TIMEOUT_SECS", 10u64)),
                catalog_ttl: StdDuration::from_secs(
                    env_parse("EPIC_CATALOG_TTL_HOURS", 6u64).saturating_mul(3600),
                ),
            },
        }
    }

    /// Config suited to tests: no inter-request delay.
    pub fn without_delay(mut self) -> Self {
        self.request_delay = StdDuration::ZERO;
        self
    }
}

/// Freshness window for an hour count, or `None` when it is non-positive
/// (everything would read as stale) or too large to represent.
pub fn max_age_from_hours(hours: i64) -> Option<Duration> {
    if hours > 0 {
        Duration::try_hours(hours)
    } else {
        None
    }
}
