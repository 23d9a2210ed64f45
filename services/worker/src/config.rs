use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the analysis worker
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Redis Streams configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Worker admission and concurrency configuration
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Analysis pipeline configuration
    pub pipeline: PipelineConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Redis Streams configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. redis://localhost:6379
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Optional password, injected into the URL when it has none
    pub password: Option<String>,
    /// Work stream name
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Consumer group name
    #[serde(default = "default_group")]
    pub group: String,
    /// Consumer name within the group (random when unset)
    pub consumer_name: Option<String>,
    /// How long a claim blocks waiting for new entries
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Maximum entries claimed per cycle
    #[serde(default = "default_batch_count")]
    pub batch_count: usize,
    /// Idle time after which an unacknowledged entry may be reclaimed
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Interval between reclaim sweeps
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
    /// Attempts allowed before an entry is dead-lettered
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Dead-letter stream name
    #[serde(default = "default_dead_letter_stream")]
    pub dead_letter_stream: String,
    /// Delay before a failed entry is re-enqueued
    #[serde(default)]
    pub retry_delay_ms: u64,
}

/// Admission and concurrency configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Initial concurrency ceiling
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Defer admission while free GPU memory is low
    #[serde(default = "default_true")]
    pub gpu_memory_guard: bool,
    /// Minimum free GPU memory required to admit an entry
    #[serde(default = "default_min_free_gpu_memory_mb")]
    pub min_free_gpu_memory_mb: u64,
    /// Wait between admission retries of a deferred entry
    #[serde(default = "default_admission_backoff_ms")]
    pub admission_backoff_ms: u64,
    /// Upper bound on draining in-flight work at shutdown
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
    /// Root directory for per-attempt scratch workspaces
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

/// External analysis pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Executable invoked once per attempt
    pub command: String,
    /// Arguments; {media_ref}, {duration}, {workspace} and {source_id} are substituted
    #[serde(default)]
    pub args: Vec<String>,
    /// Overall deadline for one attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket (container) receiving artifacts
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, Swift S3 API, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key; the default credential chain is used when unset
    pub access_key_id: Option<String>,
    /// Static secret key
    pub secret_access_key: Option<String>,
    /// Key prefix for every uploaded artifact
    #[serde(default = "default_upload_prefix")]
    pub upload_prefix: String,
    /// Concurrent uploads per job
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

/// Operational API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

// Default value functions
fn default_service_name() -> String {
    "analysis-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_stream() -> String {
    "stream:preprocess".to_string()
}

fn default_group() -> String {
    "workers".to_string()
}

fn default_block_ms() -> u64 {
    5000
}

fn default_batch_count() -> usize {
    20
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_reclaim_interval_secs() -> u64 {
    30
}

fn default_max_retry() -> u32 {
    3
}

fn default_dead_letter_stream() -> String {
    "stream:preprocess:dlq".to_string()
}

fn default_max_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_min_free_gpu_memory_mb() -> u64 {
    1024
}

fn default_admission_backoff_ms() -> u64 {
    1000
}

fn default_drain_grace_secs() -> u64 {
    30
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("analysis-worker")
}

fn default_attempt_timeout_secs() -> u64 {
    240
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_prefix() -> String {
    "preprocess".to_string()
}

fn default_upload_concurrency() -> usize {
    5
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/worker").required(false))
            .add_source(config::File::with_name("/etc/analysis-worker/worker").required(false))
            // Override with environment variables
            // WORKER__REDIS__URL -> redis.url
            .add_source(
                config::Environment::with_prefix("WORKER")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("pipeline.args")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the worker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.max_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.redis.batch_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "redis.batch_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.redis.stream == self.redis.dead_letter_stream {
            return Err(ConfigError::InvalidValue {
                key: "redis.dead_letter_stream".to_string(),
                message: "must differ from redis.stream".to_string(),
            });
        }
        if self.pipeline.command.trim().is_empty() {
            return Err(ConfigError::MissingRequired("pipeline.command".to_string()));
        }
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }
        if self.s3.access_key_id.is_some() != self.s3.secret_access_key.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "s3.secret_access_key".to_string(),
                message: "access_key_id and secret_access_key must be set together".to_string(),
            });
        }
        if self.attempt_timeout() >= self.visibility_timeout() {
            tracing::warn!(
                attempt_timeout_secs = self.pipeline.attempt_timeout_secs,
                visibility_timeout_secs = self.redis.visibility_timeout_secs,
                "Attempt deadline is not below the visibility timeout; slow attempts may be reclaimed by other consumers"
            );
        }
        Ok(())
    }

    /// Redis URL with the configured password applied
    pub fn redis_url(&self) -> String {
        match (&self.redis.password, self.redis.url.split_once("://")) {
            (Some(password), Some((scheme, rest))) if !rest.contains('@') => {
                format!("{scheme}://:{}@{rest}", urlencoding::encode(password))
            }
            _ => self.redis.url.clone(),
        }
    }

    /// Get claim block duration as Duration
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.redis.block_ms)
    }

    /// Get visibility timeout as Duration
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.redis.visibility_timeout_secs)
    }

    /// Get reclaim sweep interval as Duration
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.redis.reclaim_interval_secs)
    }

    /// Get re-enqueue delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.redis.retry_delay_ms)
    }

    /// Get attempt deadline as Duration
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.attempt_timeout_secs)
    }

    /// Get admission backoff as Duration
    pub fn admission_backoff(&self) -> Duration {
        Duration::from_millis(self.worker.admission_backoff_ms)
    }

    /// Get drain grace period as Duration
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.worker.drain_grace_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            password: None,
            stream: default_stream(),
            group: default_group(),
            consumer_name: None,
            block_ms: default_block_ms(),
            batch_count: default_batch_count(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            max_retry: default_max_retry(),
            dead_letter_stream: default_dead_letter_stream(),
            retry_delay_ms: 0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            gpu_memory_guard: default_true(),
            min_free_gpu_memory_mb: default_min_free_gpu_memory_mb(),
            admission_backoff_ms: default_admission_backoff_ms(),
            drain_grace_secs: default_drain_grace_secs(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
        [pipeline]
        command = "/usr/local/bin/extract-background"
        [s3]
        bucket = "cctv-preprocess"
    "#;

    #[test]
    fn test_default_values() {
        let config = parse(MINIMAL);
        assert_eq!(config.redis.stream, "stream:preprocess");
        assert_eq!(config.redis.group, "workers");
        assert_eq!(config.redis.block_ms, 5000);
        assert_eq!(config.redis.batch_count, 20);
        assert_eq!(config.redis.max_retry, 3);
        assert_eq!(config.worker.max_concurrency, 2);
        assert!(config.worker.gpu_memory_guard);
        assert_eq!(config.s3.upload_prefix, "preprocess");
        assert_eq!(config.api.port, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_url_with_password() {
        let mut config = parse(MINIMAL);
        config.redis.password = Some("s3cret".to_string());
        assert_eq!(config.redis_url(), "redis://:s3cret@localhost:6379");

        config.redis.url = "redis://user:pw@cache:6379".to_string();
        assert_eq!(config.redis_url(), "redis://user:pw@cache:6379");
    }

    #[test]
    fn test_redis_password_is_percent_encoded() {
        let mut config = parse(MINIMAL);
        config.redis.password = Some("p@ss/w:rd".to_string());
        assert_eq!(config.redis_url(), "redis://:p%40ss%2Fw%3Ard@localhost:6379");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = parse(MINIMAL);
        config.worker.max_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "worker.max_concurrency"
        ));
    }

    #[test]
    fn test_dead_letter_stream_must_differ() {
        let mut config = parse(MINIMAL);
        config.redis.dead_letter_stream = config.redis.stream.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_half_configured_credentials_rejected() {
        let mut config = parse(MINIMAL);
        config.s3.access_key_id = Some("AKIA".to_string());
        assert!(config.validate().is_err());
    }
}
