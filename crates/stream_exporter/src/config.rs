//! Exporter configuration.

use crate::error::ConfigError;
use crate::retry::RetryConfig;
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api.s2.dev";
pub const DEFAULT_STREAM_PREFIX: &str = "agent-session-";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the stream exporter.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Base URL of the stream store.
    ///
    /// Default: `https://api.s2.dev`
    pub endpoint: String,

    /// Bearer credential attached to every request. Required.
    pub api_key: String,

    /// Prepended to every conversation id to form a stream name.
    ///
    /// Default: `agent-session-`
    pub stream_prefix: String,

    /// Pending events per stream that trigger an immediate flush.
    ///
    /// Default: 100
    pub batch_size: usize,

    /// Period of the background flush of all streams.
    ///
    /// Default: 5s
    pub flush_interval: Duration,

    /// Timeout applied to each HTTP request.
    ///
    /// Default: 30s
    pub request_timeout: Duration,

    /// Retry policy for store requests.
    pub retry: RetryConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            api_key: String::new(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_owned(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Creates a configuration with defaults for everything but the credential.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads configuration from `S2_*` environment variables.
    ///
    /// Unset or unparsable values keep their defaults; call
    /// [`validate`](Self::validate) afterwards.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(endpoint) = lookup("S2_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(api_key) = lookup("S2_API_KEY") {
            config.api_key = api_key;
        }
        if let Some(prefix) = lookup("S2_STREAM_PREFIX") {
            config.stream_prefix = prefix;
        }
        if let Some(batch_size) = lookup("S2_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            config.batch_size = batch_size;
        }
        if let Some(ms) = lookup("S2_FLUSH_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            config.flush_interval = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks required fields and replaces unusable optional values with
    /// their defaults.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        self.endpoint_url()?;
        self.apply_defaults();
        Ok(())
    }

    /// Replaces zero or empty optional values with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.request_timeout.is_zero() {
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        if self.stream_prefix.is_empty() {
            self.stream_prefix = DEFAULT_STREAM_PREFIX.to_owned();
        }
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
    }

    /// Parses the endpoint, accepting only `http` and `https` URLs.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.endpoint.trim())
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {e}", self.endpoint)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::InvalidEndpoint(format!(
                "unsupported scheme {other:?} in {}",
                self.endpoint
            ))),
        }
    }
}
