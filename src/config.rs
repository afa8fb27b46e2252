use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub push_gateway: PushGatewayConfig,
    pub rate_limit: RateLimitConfig,
    pub resolver: ResolverConfig,
    pub retry: RetryConfig,
    pub maintenance: MaintenanceConfig,
    pub activity_log: ActivityLogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushGatewayConfig {
    /// Batch send endpoint of the push provider.
    pub url: String,
    /// Optional bearer token for the provider API.
    pub access_token: Option<String>,
    /// Provider-imposed maximum messages per batch request.
    pub batch_size: usize,
    /// Courtesy delay between consecutive batches (milliseconds).
    pub batch_delay_ms: u64,
    /// Per-request timeout against the provider (seconds).
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for push token registration.
    pub push_token_per_second: u32,
    /// Burst size for push token registration.
    pub push_token_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Deadline for the primary (membership) lookup stage (seconds).
    pub primary_timeout_seconds: u64,
    /// Deadline for the fallback (project assignment) lookup stage (seconds).
    pub fallback_timeout_seconds: u64,
    /// TTL for cached primary resolutions (seconds).
    pub primary_cache_ttl_seconds: u64,
    /// TTL for cached fallback resolutions (seconds). Shorter because the
    /// fallback source is a denormalized approximation.
    pub fallback_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Whether the retry worker is enabled.
    pub enabled: bool,
    /// Maximum delivery attempts per failed notification.
    pub max_attempts: u32,
    /// Base backoff delay (milliseconds) for the first retry.
    pub base_delay_ms: u64,
    /// Cap for exponential backoff (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter strategy: "none", "full", "equal" or "decorrelated".
    pub jitter: String,
    /// How often (seconds) the worker polls for due retries.
    pub poll_interval_seconds: u64,
    /// Consecutive failures before the circuit opens for a destination.
    pub breaker_failure_threshold: u32,
    /// Cool-down (seconds) before an open circuit accepts sends again.
    pub breaker_reset_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Whether the periodic maintenance worker is enabled.
    pub enabled: bool,
    /// Interval between scheduled runs (seconds).
    pub interval_seconds: u64,
    /// Bearer secret required by the cron trigger endpoint.
    pub cron_secret: String,
    /// Tokens unused for longer than this are deactivated (days).
    pub max_token_age_days: i64,
    /// Inactive tokens older than this are hard-deleted (days).
    pub purge_inactive_after_days: i64,
    /// Number of job records kept in the in-memory history.
    pub history_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityLogConfig {
    /// Optional URL of the fire-and-forget activity logging sink.
    pub url: Option<String>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/app.db".to_string()),
                max_connections: env_u32("DATABASE_MAX_CONNECTIONS", 5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
                expiration_hours: env::var("JWT_EXPIRATION_HOURS")
                    .unwrap_or_else(|_| "24".to_string())
                    .parse()
                    .unwrap_or(24),
            },
            push_gateway: PushGatewayConfig {
                url: env::var("PUSH_GATEWAY_URL")
                    .unwrap_or_else(|_| "https://exp.host/--/api/v2/push/send".to_string()),
                access_token: env::var("PUSH_GATEWAY_ACCESS_TOKEN").ok(),
                batch_size: env_u64("PUSH_GATEWAY_BATCH_SIZE", 100) as usize,
                batch_delay_ms: env_u64("PUSH_GATEWAY_BATCH_DELAY_MS", 250),
                request_timeout_seconds: env_u64("PUSH_GATEWAY_REQUEST_TIMEOUT_SECONDS", 10),
            },
            rate_limit: RateLimitConfig {
                push_token_per_second: env_u32("RATE_LIMIT_PUSH_TOKEN_PER_SECOND", 3),
                push_token_burst: env_u32("RATE_LIMIT_PUSH_TOKEN_BURST", 10),
            },
            resolver: ResolverConfig {
                primary_timeout_seconds: env_u64("RESOLVER_PRIMARY_TIMEOUT_SECONDS", 5),
                fallback_timeout_seconds: env_u64("RESOLVER_FALLBACK_TIMEOUT_SECONDS", 3),
                primary_cache_ttl_seconds: env_u64("RESOLVER_PRIMARY_CACHE_TTL_SECONDS", 300),
                fallback_cache_ttl_seconds: env_u64("RESOLVER_FALLBACK_CACHE_TTL_SECONDS", 120),
            },
            retry: RetryConfig {
                enabled: env_bool("RETRY_ENABLED", true),
                max_attempts: env_u32("RETRY_MAX_ATTEMPTS", 3),
                base_delay_ms: env_u64("RETRY_BASE_DELAY_MS", 1000),
                max_delay_ms: env_u64("RETRY_MAX_DELAY_MS", 60_000),
                jitter: env::var("RETRY_JITTER").unwrap_or_else(|_| "full".to_string()),
                poll_interval_seconds: env_u64("RETRY_POLL_INTERVAL_SECONDS", 5),
                breaker_failure_threshold: env_u32("RETRY_BREAKER_FAILURE_THRESHOLD", 5),
                breaker_reset_seconds: env_u64("RETRY_BREAKER_RESET_SECONDS", 60),
            },
            maintenance: MaintenanceConfig {
                enabled: env_bool("MAINTENANCE_ENABLED", true),
                interval_seconds: env_u64("MAINTENANCE_INTERVAL_SECONDS", 6 * 60 * 60),
                cron_secret: env::var("MAINTENANCE_CRON_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("MAINTENANCE_CRON_SECRET".to_string()))?,
                max_token_age_days: env_u64("MAINTENANCE_MAX_TOKEN_AGE_DAYS", 90) as i64,
                purge_inactive_after_days: env_u64("MAINTENANCE_PURGE_INACTIVE_AFTER_DAYS", 180)
                    as i64,
                history_size: env_u64("MAINTENANCE_HISTORY_SIZE", 50) as usize,
            },
            activity_log: ActivityLogConfig {
                url: env::var("ACTIVITY_LOG_URL").ok(),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/app.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
                expiration_hours: 24,
            },
            push_gateway: PushGatewayConfig {
                url: "https://exp.host/--/api/v2/push/send".to_string(),
                access_token: None,
                batch_size: 100,
                batch_delay_ms: 250,
                request_timeout_seconds: 10,
            },
            rate_limit: RateLimitConfig {
                push_token_per_second: 3,
                push_token_burst: 10,
            },
            resolver: ResolverConfig {
                primary_timeout_seconds: 5,
                fallback_timeout_seconds: 3,
                primary_cache_ttl_seconds: 300,
                fallback_cache_ttl_seconds: 120,
            },
            retry: RetryConfig {
                enabled: true,
                max_attempts: 3,
                base_delay_ms: 1000,
                max_delay_ms: 60_000,
                jitter: "full".to_string(),
                poll_interval_seconds: 5,
                breaker_failure_threshold: 5,
                breaker_reset_seconds: 60,
            },
            maintenance: MaintenanceConfig {
                enabled: true,
                interval_seconds: 6 * 60 * 60,
                cron_secret: String::new(),
                max_token_age_days: 90,
                purge_inactive_after_days: 180,
                history_size: 50,
            },
            activity_log: ActivityLogConfig { url: None },
        }
    }
}
