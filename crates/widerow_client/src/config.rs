//! Client configuration loaded from environment variables.

use std::time::Duration;

use anyhow::{Context, Result};

pub const ENV_MAX_RETRIES: &str = "WIDEROW_MAX_RETRIES";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "WIDEROW_RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "WIDEROW_RETRY_MAX_DELAY_MS";
pub const ENV_RPC_TIMEOUT_MS: &str = "WIDEROW_RPC_TIMEOUT_MS";
pub const ENV_APP_PROFILE: &str = "WIDEROW_APP_PROFILE";

/// Defaults applied to every `Table` created from this configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Retries after the first mutation attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Per-attempt deadline for opening and draining a call. `None` disables it.
    pub rpc_timeout: Option<Duration>,
    /// Routing profile attached to read requests.
    pub app_profile_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(1000),
            rpc_timeout: Some(Duration::from_millis(30_000)),
            app_profile_id: None,
        }
    }
}

impl ClientConfig {
    /// Read configuration from `WIDEROW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_retries = parse_u32(lookup(ENV_MAX_RETRIES), defaults.max_retries)?;
        let base_ms = parse_u64(lookup(ENV_RETRY_BASE_DELAY_MS), 10)?;
        let max_ms = parse_u64(lookup(ENV_RETRY_MAX_DELAY_MS), 1000)?;
        let timeout_ms = parse_u64(lookup(ENV_RPC_TIMEOUT_MS), 30_000)?;
        let app_profile_id = lookup(ENV_APP_PROFILE).filter(|value| !value.trim().is_empty());

        Ok(Self {
            max_retries,
            retry_base_delay: Duration::from_millis(base_ms),
            retry_max_delay: Duration::from_millis(max_ms.max(base_ms)),
            rpc_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            app_profile_id,
        })
    }
}

/// Parses an optional `u32` with fallback default.
fn parse_u32(value: Option<String>, default_value: u32) -> Result<u32> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid u32 value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
