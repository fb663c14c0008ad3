use std::env;

use chrono_tz::Tz;
use tracing::warn;

const DEFAULT_MAX_CONCURRENT_UPSTREAM_REQUESTS: usize = 3;
const DEFAULT_DIRECTORY_CACHE_TTL_SECONDS: u64 = 3600;
const DEFAULT_SCHEDULE_CACHE_WINDOW_WEEKS: u32 = 4;
const DEFAULT_SCHEDULE_CACHE_TTL_SECONDS: u64 = 900;
const DEFAULT_DISPLAY_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Size of the process-wide upstream request semaphore. Conservative
    /// default to avoid 429s and timeouts from the EMR API.
    pub max_concurrent_upstream_requests: usize,
    pub directory_cache_ttl_seconds: u64,
    pub schedule_cache_window_weeks: u32,
    pub schedule_cache_ttl_seconds: u64,
    /// Timezone the schedule grid is rendered in; day boundaries and the
    /// AM/PM split follow this zone, not the upstream's storage timezone.
    pub display_timezone: Tz,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent_upstream_requests: env_number(
                "MAX_CONCURRENT_UPSTREAM_REQUESTS",
                DEFAULT_MAX_CONCURRENT_UPSTREAM_REQUESTS,
            ),
            directory_cache_ttl_seconds: env_number(
                "DIRECTORY_CACHE_TTL_SECONDS",
                DEFAULT_DIRECTORY_CACHE_TTL_SECONDS,
            ),
            schedule_cache_window_weeks: env_number(
                "SCHEDULE_CACHE_WINDOW_WEEKS",
                DEFAULT_SCHEDULE_CACHE_WINDOW_WEEKS,
            ),
            schedule_cache_ttl_seconds: env_number(
                "SCHEDULE_CACHE_TTL_SECONDS",
                DEFAULT_SCHEDULE_CACHE_TTL_SECONDS,
            ),
            display_timezone: env_timezone("DISPLAY_TIMEZONE", DEFAULT_DISPLAY_TIMEZONE),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_upstream_requests: DEFAULT_MAX_CONCURRENT_UPSTREAM_REQUESTS,
            directory_cache_ttl_seconds: DEFAULT_DIRECTORY_CACHE_TTL_SECONDS,
            schedule_cache_window_weeks: DEFAULT_SCHEDULE_CACHE_WINDOW_WEEKS,
            schedule_cache_ttl_seconds: DEFAULT_SCHEDULE_CACHE_TTL_SECONDS,
            display_timezone: DEFAULT_DISPLAY_TIMEZONE,
        }
    }
}

fn env_number<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid number ({:?}), using default {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_timezone(name: &str, default: Tz) -> Tz {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid IANA timezone ({:?}), using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
