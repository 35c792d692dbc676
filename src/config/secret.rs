//! Startup secret resolution.
//!
//! Secrets (e.g. the email provider key) are resolved once when the process
//! starts and handed to the components that need them. Nothing looks a
//! secret up per request.

use std::collections::HashMap;

use serde::Deserialize;

use super::ConfigError;

/// Where to find a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecretConfig {
    /// Logical secret name, used in logs and errors.
    pub name: String,
    /// Environment variable holding the value.
    pub env_var: String,
}

/// Resolves a configured secret to its value.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, secret: &SecretConfig) -> Result<String, ConfigError>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, secret: &SecretConfig) -> Result<String, ConfigError> {
        match std::env::var(&secret.env_var) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(ConfigError::SecretNotFound {
                name: secret.name.clone(),
                env_var: secret.env_var.clone(),
            }),
        }
    }
}

/// Fixed secrets keyed by name, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretResolver for StaticSecretResolver {
    fn resolve(&self, secret: &SecretConfig) -> Result<String, ConfigError> {
        self.secrets
            .get(&secret.name)
            .cloned()
            .ok_or_else(|| ConfigError::SecretNotFound {
                name: secret.name.clone(),
                env_var: secret.env_var.clone(),
            })
    }
}
