use std::env;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Runtime configuration, collected from the environment once at startup and
/// injected into every component. Every timer is a plain field so tests can
/// shrink the cadences without touching the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub hostname: String,
    pub cors_origin: Option<String>,
    pub use_cluster: bool,
    pub use_redis: bool,
    pub redis: RedisConfig,

    pub max_file_size: u64,
    pub chunk_size: u64,
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub max_concurrent_transfers: usize,
    pub enable_checksums: bool,

    pub ack_timeout: Duration,
    pub ack_scan_interval: Duration,
    pub max_retries: u32,

    pub node_heartbeat_interval: Duration,
    pub node_stale_after: Duration,
    pub election_interval: Duration,
    pub master_lock_ttl: Duration,

    pub ttl_client_session: Duration,
    pub ttl_share_session: Duration,
    pub ttl_upload_state: Duration,
    pub ttl_heartbeat: Duration,
    pub rate_limit_window: Duration,
    pub heartbeat_rate_limit: u32,

    pub sweep_interval: Duration,
    pub completed_reap_after: Duration,
    pub uploading_reap_after: Duration,
    pub shutdown_drain: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            hostname: "localhost".to_string(),
            cors_origin: None,
            use_cluster: false,
            use_redis: false,
            redis: RedisConfig {
                host: "127.0.0.1".to_string(),
                port: 6379,
                password: None,
                db: 0,
            },

            max_file_size: 1024 * 1024 * 1024,
            chunk_size: 256 * 1024,
            max_concurrent_uploads: 10,
            max_concurrent_downloads: 10,
            max_concurrent_transfers: 5,
            enable_checksums: true,

            ack_timeout: Duration::from_secs(10),
            ack_scan_interval: Duration::from_secs(2),
            max_retries: 3,

            node_heartbeat_interval: Duration::from_secs(10),
            node_stale_after: Duration::from_secs(30),
            election_interval: Duration::from_secs(5),
            master_lock_ttl: Duration::from_secs(15),

            ttl_client_session: Duration::from_secs(3600),
            ttl_share_session: Duration::from_secs(2 * 3600),
            ttl_upload_state: Duration::from_secs(24 * 3600),
            ttl_heartbeat: Duration::from_secs(90),
            rate_limit_window: Duration::from_secs(60),
            heartbeat_rate_limit: 1000,

            sweep_interval: Duration::from_secs(60),
            completed_reap_after: Duration::from_secs(5 * 60),
            uploading_reap_after: Duration::from_secs(24 * 3600),
            shutdown_drain: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            port: env_parse("PORT", defaults.port),
            hostname: env_string("NODE_HOSTNAME", &defaults.hostname),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|v| !v.is_empty()),
            use_cluster: env_bool("USE_CLUSTER", defaults.use_cluster),
            use_redis: env_bool("USE_REDIS", defaults.use_redis),
            redis: RedisConfig {
                host: env_string("REDIS_HOST", &defaults.redis.host),
                port: env_parse("REDIS_PORT", defaults.redis.port),
                password: env::var("REDIS_PASSWORD").ok().filter(|v| !v.is_empty()),
                db: env_parse("REDIS_DB", defaults.redis.db),
            },

            max_file_size: env_parse("MAX_FILE_SIZE", defaults.max_file_size),
            chunk_size: env_parse("CHUNK_SIZE", defaults.chunk_size),
            max_concurrent_uploads: env_parse(
                "MAX_CONCURRENT_UPLOADS",
                defaults.max_concurrent_uploads,
            ),
            max_concurrent_downloads: env_parse(
                "MAX_CONCURRENT_DOWNLOADS",
                defaults.max_concurrent_downloads,
            ),
            max_concurrent_transfers: env_parse(
                "MAX_CONCURRENT_TRANSFERS",
                defaults.max_concurrent_transfers,
            ),
            enable_checksums: env_bool("ENABLE_CHECKSUMS", defaults.enable_checksums),

            ack_timeout: Duration::from_millis(env_parse(
                "ACK_TIMEOUT_MS",
                defaults.ack_timeout.as_millis() as u64,
            )),
            ack_scan_interval: Duration::from_millis(env_parse(
                "ACK_SCAN_INTERVAL_MS",
                defaults.ack_scan_interval.as_millis() as u64,
            )),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),

            node_heartbeat_interval: env_secs(
                "NODE_HEARTBEAT_SECS",
                defaults.node_heartbeat_interval.as_secs(),
            ),
            node_stale_after: env_secs("NODE_STALE_SECS", defaults.node_stale_after.as_secs()),
            election_interval: env_secs(
                "ELECTION_INTERVAL_SECS",
                defaults.election_interval.as_secs(),
            ),
            master_lock_ttl: env_secs("MASTER_LOCK_TTL_SECS", defaults.master_lock_ttl.as_secs()),

            ttl_client_session: env_secs(
                "TTL_CLIENT_SESSION",
                defaults.ttl_client_session.as_secs(),
            ),
            ttl_share_session: env_secs("TTL_SHARE_SESSION", defaults.ttl_share_session.as_secs()),
            ttl_upload_state: env_secs("TTL_UPLOAD_STATE", defaults.ttl_upload_state.as_secs()),
            ttl_heartbeat: env_secs("TTL_HEARTBEAT", defaults.ttl_heartbeat.as_secs()),
            rate_limit_window: env_secs(
                "TTL_RATE_LIMIT_WINDOW",
                defaults.rate_limit_window.as_secs(),
            ),
            heartbeat_rate_limit: env_parse("HEARTBEAT_RATE_LIMIT", defaults.heartbeat_rate_limit),

            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs()),
            completed_reap_after: env_secs(
                "COMPLETED_REAP_SECS",
                defaults.completed_reap_after.as_secs(),
            ),
            uploading_reap_after: env_secs(
                "UPLOADING_REAP_SECS",
                defaults.uploading_reap_after.as_secs(),
            ),
            shutdown_drain: env_secs("SHUTDOWN_DRAIN_SECS", defaults.shutdown_drain.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.ack_timeout, Duration::from_secs(10));
        assert_eq!(cfg.master_lock_ttl, Duration::from_secs(15));
        assert_eq!(cfg.election_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_rate_limit, 1000);
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut redis = RedisConfig {
            host: "redis.internal".into(),
            port: 6380,
            password: None,
            db: 2,
        };
        assert_eq!(redis.url(), "redis://redis.internal:6380/2");
        redis.password = Some("hunter2".into());
        assert_eq!(redis.url(), "redis://:hunter2@redis.internal:6380/2");
    }
}
