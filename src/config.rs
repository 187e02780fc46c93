//! Runtime configuration for servers and clients.
//!
//! Both structs have sensible defaults and can be overridden through
//! environment variables. Values that fail to parse fall back to the
//! default.

use crate::descriptor::normalize_prefix;
use std::time::Duration;

/// Route prefix used when none is configured.
pub const DEFAULT_PATH_PREFIX: &str = "/twirp";

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Route prefix, normalized: empty, or a leading `/` and no trailing `/`.
    pub path_prefix: String,

    /// Largest request body accepted before decoding.
    pub max_body_bytes: usize,

    /// Capacity of the channel between a streaming producer and the
    /// connection.
    pub stream_channel_capacity: usize,

    /// Leave default-valued fields out of JSON responses.
    pub json_skip_defaults: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            max_body_bytes: 4 * 1024 * 1024, // 4 MB
            stream_channel_capacity: 32,
            json_skip_defaults: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// - `TWIRP_PATH_PREFIX` (default: `/twirp`; set to empty for no prefix)
    /// - `TWIRP_MAX_BODY_BYTES` (default: 4194304)
    /// - `TWIRP_STREAM_CAPACITY` (default: 32)
    /// - `TWIRP_JSON_SKIP_DEFAULTS` (default: false)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            path_prefix: std::env::var("TWIRP_PATH_PREFIX")
                .map(|v| normalize_prefix(&v))
                .unwrap_or(default.path_prefix),

            max_body_bytes: std::env::var("TWIRP_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_body_bytes),

            stream_channel_capacity: std::env::var("TWIRP_STREAM_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default.stream_channel_capacity),

            json_skip_defaults: std::env::var("TWIRP_JSON_SKIP_DEFAULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.json_skip_defaults),
        }
    }

    /// Returns a copy with `prefix` normalized and set.
    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = normalize_prefix(prefix);
        self
    }
}

/// Client transport settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total timeout for one request, including reading the body.
    pub timeout: Option<Duration>,

    pub connect_timeout: Duration,

    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// - `TWIRP_CLIENT_TIMEOUT_SECS` (default: none)
    /// - `TWIRP_CLIENT_CONNECT_TIMEOUT_SECS` (default: 10)
    /// - `TWIRP_CLIENT_POOL_MAX_IDLE` (default: 32)
    /// - `TWIRP_CLIENT_POOL_IDLE_TIMEOUT_SECS` (default: 90)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            timeout: std::env::var("TWIRP_CLIENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .or(default.timeout),

            connect_timeout: std::env::var("TWIRP_CLIENT_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.connect_timeout),

            pool_max_idle_per_host: std::env::var("TWIRP_CLIENT_POOL_MAX_IDLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.pool_max_idle_per_host),

            pool_idle_timeout: std::env::var("TWIRP_CLIENT_POOL_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.pool_idle_timeout),
        }
    }
}
