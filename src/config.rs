use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub policy: PolicyConfig,
    pub rate: RateConfig,
    pub janitor: JanitorConfig,
    pub audit: AuditConfig,
    pub ip: IpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

/// Threat scoring and blocking policy constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Suspicion score at which a client is auto-banned
    pub ban_threshold: u32,
    /// Auto-ban duration in seconds (30 minutes)
    pub ban_duration_secs: u64,
    /// Inputs longer than this are treated as content, not attack payloads
    pub max_inspected_len: usize,
    /// JSON bodies nested deeper than this are rejected
    pub max_json_depth: usize,
    /// Path prefixes treated as static assets (exempt from rate governance)
    pub static_prefixes: Vec<String>,
    /// Path prefixes handled by the upload path (exempt from injection and
    /// traversal checks; file checks apply instead)
    pub upload_prefixes: Vec<String>,
}

/// Burst-rate governance constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Requests allowed per (client, endpoint) within one window
    pub burst_limit: u32,
    /// Fixed window length in milliseconds
    pub window_ms: u64,
    /// Block duration applied on a burst violation (5 minutes)
    pub burst_block_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// Sweep period in seconds (5 minutes)
    pub period_secs: u64,
    /// Per-sweep suspicion score decay
    pub decay_step: u32,
    /// Fingerprints unseen for longer than this are evicted
    pub fingerprint_ttl_secs: u64,
    /// Rate buckets whose window expired longer ago than this are evicted
    pub bucket_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// In-memory ring buffer capacity
    pub buffer_capacity: usize,
    /// Append-only JSONL log file; empty disables the file sink
    pub log_path: String,
}

/// Client identity extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConfig {
    /// Ordered list of headers consulted for the client IP
    pub trusted_headers: Vec<String>,
    /// Proxies whose forwarding headers are believed
    pub trusted_proxies: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            policy: PolicyConfig::default(),
            rate: RateConfig::default(),
            janitor: JanitorConfig::default(),
            audit: AuditConfig::default(),
            ip: IpConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ban_threshold: 500,
            ban_duration_secs: 30 * 60,
            max_inspected_len: crate::detectors::MAX_INSPECTED_LEN,
            max_json_depth: 20,
            static_prefixes: vec![
                "/static/".to_string(),
                "/assets/".to_string(),
                "/favicon".to_string(),
            ],
            upload_prefixes: vec!["/api/upload".to_string()],
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            burst_limit: 100,
            window_ms: 1_000,
            burst_block_secs: 5 * 60,
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            period_secs: 5 * 60,
            decay_step: 10,
            fingerprint_ttl_secs: 60 * 60,
            bucket_grace_secs: 60,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            log_path: "palisade-audit.log".to_string(),
        }
    }
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            trusted_headers: vec![
                "X-Forwarded-For".to_string(),
                "X-Real-IP".to_string(),
            ],
            trusted_proxies: vec![
                "127.0.0.1".to_string(),
                "::1".to_string(),
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port",
                reason: "cannot be 0".to_string(),
            });
        }
        if self.policy.ban_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "policy.ban_threshold",
                reason: "must be > 0".to_string(),
            });
        }
        if self.rate.burst_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rate.burst_limit",
                reason: "must be > 0".to_string(),
            });
        }
        if self.rate.window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rate.window_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.janitor.period_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "janitor.period_secs",
                reason: "must be > 0".to_string(),
            });
        }
        if self.audit.buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "audit.buffer_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}
