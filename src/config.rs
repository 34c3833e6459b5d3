//! Startup configuration (spec.md section 6, "Environment-driven
//! configuration") and runtime reconfiguration support (section 6,
//! "Runtime reconfiguration").
//!
//! Every option is read from a TOML file or struct literal and may be
//! overridden by an `FS123_*` environment variable, matching the spirit
//! of the original's large set of named options while keeping
//! construction from a plain struct ergonomic for library callers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a [`crate::core::Fs123Core`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Base URLs tried in fallback order (spec.md section 4.1.1).
    pub base_urls: Vec<String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Full request/response transfer timeout.
    pub transfer_timeout: Duration,
    /// Chunk size for `/f` file-content requests (spec.md section 4.7).
    pub chunk_size_bytes: u64,
    /// Root directory of the disk cache.
    pub cache_dir: String,
    /// Disk cache size ceiling, in megabytes.
    pub max_cache_mbytes: u64,
    /// Disk cache size ceiling, in files.
    pub max_cache_files: u64,
    /// Fraction of capacity at which eviction begins (`evict_target_fraction`).
    pub evict_target_fraction: f64,
    /// Fraction of capacity eviction aims to reduce usage to (`evict_lwm`).
    pub evict_lwm: f64,
    /// Fraction below which admission throttling relaxes fully (`evict_throttle_lwm`).
    pub evict_throttle_lwm: f64,
    /// Minutes between eviction scans of all sub-directories.
    pub evict_period_minutes: f64,
    /// Default `stale_if_error` tolerance (seconds) when a request
    /// doesn't override it.
    pub default_stale_if_error_secs: i64,
    /// Default `past_stale_while_revalidate` extension (seconds).
    pub default_past_swr_secs: i64,
    /// Initial retry delay (milliseconds).
    pub retry_initial_millis: u64,
    /// Retry delay ceiling (seconds).
    pub retry_saturate_secs: u64,
    /// Total retry budget (seconds); `0` disables retries.
    pub retry_timeout_secs: u64,
    /// Maximum redirects the HTTP backend will follow.
    pub max_redirects: u32,
    /// Background refresh/serialize pool size.
    pub bg_pool_threads: usize,
    /// Background refresh/serialize pool backlog.
    pub bg_pool_backlog: usize,
    /// Directory holding the request-encryption secret, if any (spec.md
    /// section 4.1.1; secret management itself is an external
    /// collaborator per section 1).
    pub secret_dir: Option<String>,
    /// Protocol minor version (drives e.g. the `/f` chunk framing in
    /// spec.md section 4.7).
    pub protocol_minor_version: u32,
    /// Enable the custodian-election multi-process disk-cache sharing
    /// protocol (spec.md section 4.1.2, "Fancy sharing").
    pub enable_custodian_sharing: bool,
    /// Enable the optional distributed peer cache (spec.md section
    /// 4.1.3).
    pub enable_distributed_cache: bool,
    /// When false, mismatched ESTALE cookies are only counted, never
    /// acted on (spec.md section 4.4).
    pub ignore_estale_mismatch: bool,
    /// Diagnostic log destination; `None` logs to stderr.
    pub log_destination: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            base_urls: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(30),
            chunk_size_bytes: 128 * 1024,
            cache_dir: "/var/cache/fs123".to_string(),
            max_cache_mbytes: 10_000,
            max_cache_files: 1_000_000,
            evict_target_fraction: 0.8,
            evict_lwm: 0.7,
            evict_throttle_lwm: 0.5,
            evict_period_minutes: 5.0,
            default_stale_if_error_secs: 0,
            default_past_swr_secs: 0,
            retry_initial_millis: 100,
            retry_saturate_secs: 30,
            retry_timeout_secs: 300,
            max_redirects: 10,
            bg_pool_threads: 10,
            bg_pool_backlog: 10_000,
            secret_dir: None,
            protocol_minor_version: 2,
            enable_custodian_sharing: true,
            enable_distributed_cache: false,
            ignore_estale_mismatch: false,
            log_destination: None,
        }
    }
}

impl CoreConfig {
    /// Parses a TOML configuration file, falling back to
    /// [`CoreConfig::default`] field-by-field for anything the file
    /// omits.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Layers `FS123_*` environment-variable overrides on top of `self`.
    /// Unrecognized or unparsable variables are ignored, matching the
    /// "best effort" tone of the original's option parser.
    pub fn with_env_overrides(mut self) -> Self {
        macro_rules! env_override {
            ($var:literal, $field:expr) => {
                if let Ok(val) = std::env::var($var) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                    }
                }
            };
        }
        env_override!("FS123_MAX_CACHE_MBYTES", self.max_cache_mbytes);
        env_override!("FS123_MAX_CACHE_FILES", self.max_cache_files);
        env_override!("FS123_CHUNK_SIZE_BYTES", self.chunk_size_bytes);
        env_override!("FS123_RETRY_TIMEOUT_SECS", self.retry_timeout_secs);
        env_override!(
            "FS123_ENABLE_CUSTODIAN_SHARING",
            self.enable_custodian_sharing
        );
        env_override!(
            "FS123_ENABLE_DISTRIBUTED_CACHE",
            self.enable_distributed_cache
        );
        if let Ok(dir) = std::env::var("FS123_CACHE_DIR") {
            self.cache_dir = dir;
        }
        if let Ok(secret_dir) = std::env::var("FS123_SECRET_DIR") {
            self.secret_dir = Some(secret_dir);
        }
        self
    }

    /// Builds configuration straight from the environment, layering
    /// overrides onto defaults (no TOML file).
    pub fn from_env() -> Self {
        CoreConfig::default().with_env_overrides()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = CoreConfig::default();
        assert!(cfg.evict_lwm < cfg.evict_target_fraction);
        assert!(cfg.evict_throttle_lwm < cfg.evict_lwm);
    }

    #[test]
    fn toml_round_trip_overrides_only_named_fields() {
        let cfg = CoreConfig::from_toml_str("max_cache_files = 42").unwrap();
        assert_eq!(cfg.max_cache_files, 42);
        assert_eq!(cfg.chunk_size_bytes, CoreConfig::default().chunk_size_bytes);
    }

    #[test]
    fn env_override_parses_bool() {
        std::env::set_var("FS123_ENABLE_DISTRIBUTED_CACHE", "true");
        let cfg = CoreConfig::default().with_env_overrides();
        assert!(cfg.enable_distributed_cache);
        std::env::remove_var("FS123_ENABLE_DISTRIBUTED_CACHE");
    }
}
