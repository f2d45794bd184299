//! Configuration management for Edgeguard.
//!
//! Settings come from an optional file (YAML, TOML or JSON, by extension)
//! overlaid with `EDGEGUARD__SECTION__FIELD` environment variables, e.g.
//! `EDGEGUARD__SIGNING__SECRET` or `EDGEGUARD__RATE_LIMITING__WINDOW=hour`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{EdgeguardError, Result};
use crate::quota::TimeWindow;
use crate::rules::DEV_PLACEHOLDER_SECRET;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "EDGEGUARD";

/// Main configuration for the Edgeguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeguardConfig {
    /// Deployment environment
    #[serde(default)]
    pub environment: Deployment,

    /// Rule source locations
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Usage store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rule signing configuration
    #[serde(default)]
    pub signing: SigningConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the process is running. Production forbids the placeholder secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    /// Local or test runs; the placeholder secret is tolerated
    #[default]
    Development,
    /// Live traffic; an explicit secret is mandatory
    Production,
}

/// Rule source file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Path to the API key registry (YAML or JSON)
    #[serde(default = "default_keys_path")]
    pub keys_path: PathBuf,

    /// Path to the newline-delimited IP blocklist
    #[serde(default = "default_blocklist_path")]
    pub blocklist_path: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            keys_path: default_keys_path(),
            blocklist_path: default_blocklist_path(),
        }
    }
}

fn default_keys_path() -> PathBuf {
    PathBuf::from("keys.json")
}

fn default_blocklist_path() -> PathBuf {
    PathBuf::from("blocklist.txt")
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Quota window length
    #[serde(default)]
    pub window: TimeWindow,

    /// Past windows kept before usage rows are purged
    #[serde(default = "default_retention_windows")]
    pub retention_windows: u64,

    /// Requests per window for each tier
    #[serde(default = "default_tier_limits")]
    pub tier_limits: HashMap<String, u64>,

    /// Periodic rule reload interval in seconds (0 disables)
    #[serde(default)]
    pub reload_interval_secs: u64,

    /// Stale usage purge interval in seconds (0 disables)
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window: TimeWindow::default(),
            retention_windows: default_retention_windows(),
            tier_limits: default_tier_limits(),
            reload_interval_secs: 0,
            gc_interval_secs: default_gc_interval(),
        }
    }
}

fn default_retention_windows() -> u64 {
    2
}

fn default_tier_limits() -> HashMap<String, u64> {
    HashMap::from([
        ("free".to_string(), 30),
        ("pro".to_string(), 300),
        ("enterprise".to_string(), 3000),
    ])
}

fn default_gc_interval() -> u64 {
    60
}

/// Which backend holds per-window usage counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; counts are lost on restart
    #[default]
    Memory,
    /// SQLite database file; counts survive restarts
    Sqlite,
}

/// Usage store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file for the SQLite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a SQLite writer waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("usage.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Rule signing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    /// HMAC secret for rule artifacts
    #[serde(default)]
    pub secret: Option<String>,

    /// Reject rule sources that carry no signature trailer
    #[serde(default)]
    pub require_signatures: bool,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EdgeguardConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let config: EdgeguardConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Reject settings that would run fail-open.
    pub fn validate(&self) -> Result<()> {
        let secret = self.signing.secret.as_deref().map(str::trim);
        let usable = matches!(secret, Some(s) if !s.is_empty());

        if self.environment == Deployment::Production {
            match secret {
                Some(s) if s == DEV_PLACEHOLDER_SECRET => {
                    return Err(EdgeguardError::config(
                        "signing.secret",
                        "the development placeholder secret is not allowed in production",
                    ))
                }
                _ if !usable => {
                    return Err(EdgeguardError::config(
                        "signing.secret",
                        "production deployments require an explicit signing secret",
                    ))
                }
                _ => {}
            }
        }

        if self.signing.require_signatures && !usable {
            return Err(EdgeguardError::config(
                "signing.secret",
                "require_signatures is set but no signing secret is configured",
            ));
        }

        if self.storage.backend == StoreBackend::Sqlite && self.storage.path.as_os_str().is_empty() {
            return Err(EdgeguardError::config("storage.path", "the sqlite backend needs a database path"));
        }

        if self.rate_limiting.retention_windows == 0 {
            return Err(EdgeguardError::config(
                "rate_limiting.retention_windows",
                "must keep at least one window",
            ));
        }

        Ok(())
    }

    /// The signing secret to use, falling back to the placeholder in development.
    pub fn signing_secret(&self) -> Option<&str> {
        match self.signing.secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => Some(secret),
            _ if self.environment == Deployment::Development => {
                warn!("No signing secret configured; using the development placeholder");
                Some(DEV_PLACEHOLDER_SECRET)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn from_yaml(yaml: &str) -> EdgeguardConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = EdgeguardConfig::default();

        assert_eq!(config.environment, Deployment::Development);
        assert_eq!(config.sources.keys_path, PathBuf::from("keys.json"));
        assert_eq!(config.rate_limiting.window, TimeWindow::Minute);
        assert_eq!(config.rate_limiting.tier_limits["free"], 30);
        assert_eq!(config.rate_limiting.tier_limits["pro"], 300);
        assert_eq!(config.rate_limiting.tier_limits["enterprise"], 3000);
        assert_eq!(config.storage.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
environment: production
signing:
  secret: s3cr3t-value
rate_limiting:
  window: hour
  tier_limits:
    gold: 10
"#;
        let config = from_yaml(yaml);

        assert_eq!(config.environment, Deployment::Production);
        assert_eq!(config.rate_limiting.window, TimeWindow::Hour);
        assert_eq!(config.rate_limiting.tier_limits.get("gold"), Some(&10));
        assert!(config.rate_limiting.tier_limits.get("free").is_none());
        assert_eq!(config.rate_limiting.retention_windows, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_requires_secret() {
        let config = from_yaml("environment: production\n");
        assert!(config.validate().is_err());
        assert_eq!(config.signing_secret(), None);
    }

    #[test]
    fn test_production_rejects_placeholder_secret() {
        let yaml = "environment: production\nsigning:\n  secret: dev-key-change\n";
        let config = from_yaml(yaml);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn test_development_falls_back_to_placeholder() {
        let config = EdgeguardConfig::default();
        assert_eq!(config.signing_secret(), Some(DEV_PLACEHOLDER_SECRET));
    }

    #[test]
    fn test_require_signatures_needs_secret() {
        let yaml = "signing:\n  require_signatures: true\n";
        let config = from_yaml(yaml);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let yaml = "rate_limiting:\n  retention_windows: 0\n";
        let config = from_yaml(yaml);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sqlite_backend_selection() {
        let config = from_yaml("storage:\n  backend: sqlite\n  path: /var/lib/edgeguard/usage.db\n");

        assert_eq!(config.storage.backend, StoreBackend::Sqlite);
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/edgeguard/usage.db"));
        assert_eq!(config.storage.busy_timeout_ms, 5_000);
        assert!(config.validate().is_ok());

        let config = from_yaml("storage:\n  backend: sqlite\n  path: ''\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "sources:\n  keys_path: /etc/edgeguard/keys.yaml").unwrap();

        let config = EdgeguardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.sources.keys_path, PathBuf::from("/etc/edgeguard/keys.yaml"));
        assert_eq!(config.sources.blocklist_path, PathBuf::from("blocklist.txt"));
    }
}
