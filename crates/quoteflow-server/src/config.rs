use quoteflow_core::{BroadcasterConfig, CacheConfig, JobDefinition, Priority, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Redis configuration (shared cache tier)
    #[serde(default)]
    pub redis: RedisConfig,
    /// Local cache tier limits
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub broadcaster: BroadcasterSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Upstream refresh jobs
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Redis validation
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 || self.redis.timeout_ms == 0 {
            return Err("redis.pool_size and redis.timeout_ms must be > 0".into());
        }
        // Cache validation
        if self.cache.max_entries == 0 || self.cache.max_bytes == 0 {
            return Err("cache.max_entries and cache.max_bytes must be > 0".into());
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err("cache.sweep_interval_secs must be > 0".into());
        }
        // Scheduler validation
        if self.scheduler.tick_interval_secs == 0 {
            return Err("scheduler.tick_interval_secs must be > 0".into());
        }
        // Broadcaster validation
        let b = &self.broadcaster;
        if b.max_connections == 0 {
            return Err("broadcaster.max_connections must be > 0".into());
        }
        if b.rate_limit_messages == 0 || b.rate_limit_window_secs == 0 {
            return Err("broadcaster rate limit must be > 0 messages per > 0 seconds".into());
        }
        if b.heartbeat_interval_secs == 0 || b.subscription_timeout_secs == 0 {
            return Err("broadcaster heartbeat and timeout intervals must be > 0".into());
        }
        if b.outbound_buffer == 0 {
            return Err("broadcaster.outbound_buffer must be > 0".into());
        }
        // Job validation
        let mut names = std::collections::HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err("jobs[].name must not be empty".into());
            }
            if !names.insert(job.name.as_str()) {
                return Err(format!("duplicate job name: {}", job.name));
            }
            if !(job.url.starts_with("http://") || job.url.starts_with("https://")) {
                return Err(format!("job {}: url must be http(s)", job.name));
            }
            if job.interval_secs == 0 {
                return Err(format!("job {}: interval_secs must be > 0", job.name));
            }
            if job.ttl_secs == Some(0) {
                return Err(format!("job {}: ttl_secs must be > 0", job.name));
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timeout for upstream HTTP fetches.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_upstream_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (single-instance deployments)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    2000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_max_entries() -> usize {
    10_000
}
fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self, redis: &RedisConfig) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            remote_timeout: Duration::from_millis(redis.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_medium_delay_ms")]
    pub medium_delay_ms: u64,
    #[serde(default = "default_low_delay_ms")]
    pub low_delay_ms: u64,
    /// Retry `n` waits `n * backoff_base_ms`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_tick_interval_secs() -> u64 {
    10
}
fn default_medium_delay_ms() -> u64 {
    2_000
}
fn default_low_delay_ms() -> u64 {
    5_000
}
fn default_backoff_base_ms() -> u64 {
    5_000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            medium_delay_ms: default_medium_delay_ms(),
            low_delay_ms: default_low_delay_ms(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            medium_delay: Duration::from_millis(self.medium_delay_ms),
            low_delay: Duration::from_millis(self.low_delay_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_rate_limit_messages")]
    pub rate_limit_messages: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_subscription_timeout_secs")]
    pub subscription_timeout_secs: u64,
    /// Period of the topic push loop; 0 disables it.
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
    #[serde(default = "default_topic_ttl_secs")]
    pub topic_ttl_secs: u64,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Base URL queried for topics that are neither cached nor prefetched,
    /// as `{topic_source_url}/{topic}?symbols=A,B`.
    #[serde(default)]
    pub topic_source_url: Option<String>,
}

fn default_max_connections() -> usize {
    1_000
}
fn default_rate_limit_messages() -> u32 {
    100
}
fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_subscription_timeout_secs() -> u64 {
    300
}
fn default_push_interval_secs() -> u64 {
    5
}
fn default_topic_ttl_secs() -> u64 {
    5
}
fn default_outbound_buffer() -> usize {
    64
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            rate_limit_messages: default_rate_limit_messages(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            subscription_timeout_secs: default_subscription_timeout_secs(),
            push_interval_secs: default_push_interval_secs(),
            topic_ttl_secs: default_topic_ttl_secs(),
            outbound_buffer: default_outbound_buffer(),
            topic_source_url: None,
        }
    }
}

impl BroadcasterSettings {
    pub fn to_broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            max_connections: self.max_connections,
            rate_limit_messages: self.rate_limit_messages,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            subscription_timeout: Duration::from_secs(self.subscription_timeout_secs),
            push_interval: (self.push_interval_secs > 0)
                .then(|| Duration::from_secs(self.push_interval_secs)),
            topic_ttl: Duration::from_secs(self.topic_ttl_secs),
            outbound_buffer: self.outbound_buffer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One upstream endpoint polled into the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_job_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_job_priority")]
    pub priority: Priority,
    #[serde(default = "default_job_max_retries")]
    pub max_retries: u32,
    /// Defaults to three intervals.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_job_interval_secs() -> u64 {
    60
}
fn default_job_priority() -> Priority {
    Priority::Medium
}
fn default_job_max_retries() -> u32 {
    3
}

impl JobConfig {
    /// Apply the scheduling settings of this entry to a job definition.
    pub fn configure(&self, definition: JobDefinition) -> JobDefinition {
        let definition = definition
            .with_priority(self.priority)
            .with_max_retries(self.max_retries)
            .with_tags(self.tags.iter().cloned());
        match self.ttl_secs {
            Some(ttl) => definition.with_ttl(Duration::from_secs(ttl)),
            None => definition,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("quoteflow.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., QUOTEFLOW__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("QUOTEFLOW")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.addr().port(), 8080);
        assert!(cfg.jobs.is_empty());
    }

    #[test]
    fn test_push_interval_zero_disables_push() {
        let settings = BroadcasterSettings {
            push_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.to_broadcaster_config().push_interval, None);
        assert_eq!(
            BroadcasterSettings::default()
                .to_broadcaster_config()
                .push_interval,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let job = JobConfig {
            name: "prices".into(),
            url: "https://example.test/prices".into(),
            interval_secs: 30,
            priority: Priority::High,
            max_retries: 3,
            ttl_secs: None,
            tags: Vec::new(),
        };
        let cfg = AppConfig {
            jobs: vec![job.clone(), job],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("duplicate job name"));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }
}
