//! Bootstrap utilities for the fanout binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV_VAR: &str = "FANOUT_LOG";

/// Build the tracing filter.
///
/// `FANOUT_LOG` wins when set; otherwise the configured level is used.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Initialize tracing with the `FANOUT_LOG` environment variable.
pub fn init_tracing(config: &LogConfig) {
    let registry = tracing_subscriber::registry().with(env_filter(config));
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
