use std::env;
use std::time::Duration;

/// Server configuration loaded from the environment.
///
/// Every field falls back to its documented default rather than failing
/// startup — the only way to misconfigure this service is to supply a value
/// that fails to parse, in which case the default is used and a warning is
/// logged.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub max_ws_per_ip: usize,
    pub max_connections: usize,
    pub rate_limit_per_15min: u32,
    pub cors_origins: Vec<String>,
    pub is_dev: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_tick: Duration,
    pub session_retention: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Config {
            server_host: env_or("SERVER_HOST", "0.0.0.0"),
            server_port: env_parsed("PORT", 8080),
            max_ws_per_ip: env_parsed("MAX_WS_PER_IP", 5),
            max_connections: env_parsed("MAX_CONNECTIONS", 1000),
            rate_limit_per_15min: env_parsed("RATE_LIMIT_MAX", 100),
            cors_origins: env::var("CORS_ORIGIN")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_owned()).collect())
                .unwrap_or_default(),
            is_dev: env::var("APP_ENV").as_deref() != Ok("production"),
            heartbeat_interval: Duration::from_secs(env_parsed("HEARTBEAT_INTERVAL_SECS", 30)),
            heartbeat_timeout: Duration::from_secs(env_parsed("HEARTBEAT_TIMEOUT_SECS", 60)),
            queue_tick: Duration::from_secs(env_parsed("QUEUE_TICK_SECS", 10)),
            session_retention: Duration::from_secs(env_parsed("SESSION_RETENTION_SECS", 60)),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "failed to parse env var, using default");
            default
        }),
        Err(_) => default,
    }
}
