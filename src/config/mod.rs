//! Application configuration.
//!
//! Aggregates configuration for every pipeline component into a single
//! `Config` that can be loaded from YAML files or environment variables.

mod secret;

pub use secret::{EnvSecretResolver, SecretConfig, SecretResolver, StaticSecretResolver};

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::invoker::InvokerConfig;
use crate::queue::{secs, QueueConfig};
use crate::utils::bootstrap::LOG_ENV_VAR;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanout.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FANOUT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FANOUT";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Secret '{name}' not found in environment variable '{env_var}'")]
    SecretNotFound { name: String, env_var: String },
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `FANOUT_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// The change-logged table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,
    /// Change log retention window.
    #[serde(with = "secs", rename = "retention_secs")]
    pub retention: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: "newsletter".to_string(),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Blob storage for newsletter issue content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub name: String,
    /// Directory backing the bucket. Unset keeps issues in memory.
    pub path: Option<PathBuf>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            name: "newsletter-issues".to_string(),
            path: None,
        }
    }
}

/// HTTP ingress.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    pub addr: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
        }
    }
}

/// One statically registered route.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    /// JSON filter pattern, e.g. `{"Type": ["SubscriberToken"]}`.
    pub pattern: String,
    /// Message template with `<$.Path>` placeholders.
    pub template: String,
    /// Destination queue name. Defaults to the route id.
    #[serde(default)]
    pub destination: Option<String>,
}

impl RouteConfig {
    pub fn destination(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.id)
    }
}

/// Newsletter consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NewsletterConfig {
    /// Public URL confirmation links point at.
    pub base_url: String,
    /// Sender address on outgoing mail.
    pub sender: String,
}

impl Default for NewsletterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            sender: "newsletter@localhost".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub table: TableConfig,
    pub bucket: BucketConfig,
    pub ingress: IngressConfig,
    /// Secret resolved once at startup (optional).
    pub secret: Option<SecretConfig>,
    /// Settings shared by every route queue.
    pub queue: QueueConfig,
    pub invoker: InvokerConfig,
    /// Static routes. Empty means the built-in newsletter routes.
    pub routes: Vec<RouteConfig>,
    pub newsletter: NewsletterConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `fanout.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `FANOUT_CONFIG` environment variable (if set)
    /// 4. Environment variables with `FANOUT` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(settings_env())),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.invoker.batch_size == 0 {
            return Err(ConfigError::Invalid("invoker.batch_size must be positive".into()));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be positive".into()));
        }
        if self.queue.visibility_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "queue.visibility_timeout_secs must be positive".into(),
            ));
        }
        let mut ids = HashSet::new();
        for route in &self.routes {
            if !ids.insert(route.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate route id '{}'", route.id)));
            }
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Process environment minus the variables that are not settings.
fn settings_env() -> ::config::Map<String, String> {
    std::env::vars()
        .filter(|(key, _)| key != CONFIG_ENV_VAR && key != LOG_ENV_VAR)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.table.name, "newsletter");
        assert_eq!(config.queue.max_receive_count, 5);
        assert_eq!(config.invoker.batch_size, 10);
        assert!(config.routes.is_empty());
        assert!(config.secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_yaml_file() {
        let file = write_yaml(
            r#"
log:
  level: debug
  json: true
table:
  name: subscriptions
  retention_secs: 60
queue:
  visibility_timeout_secs: 10
  max_receive_count: 3
invoker:
  batch_size: 5
  max_wait_ms: 200
routes:
  - id: new-subscriber
    pattern: '{"Type": ["SubscriberToken"]}'
    template: '{"email_address": <$.EmailAddress>}'
  - id: audit
    pattern: '{}'
    template: '{"pk": <$.PK>}'
    destination: audit-queue
newsletter:
  base_url: https://example.com
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        assert_eq!(config.table.name, "subscriptions");
        assert_eq!(config.table.retention, Duration::from_secs(60));
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(10));
        assert_eq!(config.queue.max_receive_count, 3);
        assert_eq!(config.queue.capacity, crate::queue::DEFAULT_CAPACITY);
        assert_eq!(config.invoker.batch_size, 5);
        assert_eq!(config.invoker.max_wait, Duration::from_millis(200));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].pattern, r#"{"Type": ["SubscriberToken"]}"#);
        assert_eq!(config.routes[0].destination(), "new-subscriber");
        assert_eq!(config.routes[1].destination(), "audit-queue");
        assert_eq!(config.newsletter.base_url, "https://example.com");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_yaml("table:\n  name: from-file\n");
        std::env::set_var("FANOUT_TABLE__NAME", "from-env");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("FANOUT_TABLE__NAME");
        assert_eq!(config.unwrap().table.name, "from-env");
    }

    #[test]
    #[serial]
    fn test_log_env_var_is_not_a_setting() {
        std::env::set_var(LOG_ENV_VAR, "trace");
        let config = Config::load(None);
        std::env::remove_var(LOG_ENV_VAR);
        assert_eq!(config.unwrap().log, LogConfig::default());
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        let result = Config::load(Some("/nonexistent/fanout.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    #[serial]
    fn test_duplicate_route_ids_rejected() {
        let file = write_yaml(
            r#"
routes:
  - id: a
    pattern: '{}'
    template: '{}'
  - id: a
    pattern: '{}'
    template: '{}'
"#,
        );
        let result = Config::load(file.path().to_str());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
