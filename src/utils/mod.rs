//! Shared helpers: tracing bootstrap and backoff presets.

pub mod bootstrap;
pub mod retry;
