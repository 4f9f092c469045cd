use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::events::StreamSettings;
use crate::identity::SessionStrategyKind;

pub const DEFAULT_BIND: &str = "127.0.0.1:4020";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_MAX_STREAM_SECS: u64 = 30 * 60;
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Server settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub bind: SocketAddr,
    pub heartbeat_interval: Duration,
    /// `None` leaves push streams open until the client goes away.
    pub max_stream_lifetime: Option<Duration>,
    pub stream_buffer: usize,
    pub session_strategy: SessionStrategyKind,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind = value("CASES_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .map_err(|err| invalid("CASES_BIND", &bind, err))?;

        let heartbeat_secs = parse_or(
            value("CASES_HEARTBEAT_SECS"),
            "CASES_HEARTBEAT_SECS",
            DEFAULT_HEARTBEAT_SECS,
        )?;
        if heartbeat_secs == 0 {
            return Err(invalid("CASES_HEARTBEAT_SECS", "0", "must be positive"));
        }
        let max_stream_secs = parse_or(
            value("CASES_MAX_STREAM_SECS"),
            "CASES_MAX_STREAM_SECS",
            DEFAULT_MAX_STREAM_SECS,
        )?;
        let stream_buffer = parse_or(
            value("CASES_STREAM_BUFFER"),
            "CASES_STREAM_BUFFER",
            DEFAULT_STREAM_BUFFER,
        )?;
        if stream_buffer == 0 {
            return Err(invalid("CASES_STREAM_BUFFER", "0", "must be positive"));
        }

        let session_strategy = match value("CASES_SESSION_STRATEGY") {
            Some(raw) => raw
                .parse::<SessionStrategyKind>()
                .map_err(|err| invalid("CASES_SESSION_STRATEGY", &raw, err))?,
            None => SessionStrategyKind::SessionToken,
        };

        Ok(Self {
            database_url: value("DATABASE_URL"),
            bind,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_stream_lifetime: (max_stream_secs > 0).then(|| Duration::from_secs(max_stream_secs)),
            stream_buffer,
            session_strategy,
        })
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            buffer: self.stream_buffer,
            max_lifetime: self.max_stream_lifetime,
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            LibError::invalid_with_code(
                "invalid_config",
                "DATABASE_URL is required",
                anyhow!("DATABASE_URL is not set"),
            )
        })
    }
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse::<T>().map_err(|err| invalid(name, &raw, err)),
        None => Ok(default),
    }
}

fn invalid(name: &str, raw: &str, reason: impl std::fmt::Display) -> LibError {
    LibError::invalid_with_code(
        "invalid_config",
        "Invalid configuration value",
        anyhow!("invalid {} '{}': {}", name, raw, reason),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).expect("defaults");
        assert_eq!(config.bind, DEFAULT_BIND.parse::<SocketAddr>().expect("addr"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_stream_lifetime, Some(Duration::from_secs(1800)));
        assert_eq!(config.session_strategy, SessionStrategyKind::SessionToken);
        assert_eq!(config.database_url, None);
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn zero_lifetime_means_unbounded() {
        let config = config_from(&[
            ("CASES_MAX_STREAM_SECS", "0"),
            ("CASES_SESSION_STRATEGY", "trusted-header"),
            ("CASES_STREAM_BUFFER", "8"),
        ])
        .expect("config");
        assert_eq!(config.max_stream_lifetime, None);
        assert_eq!(config.session_strategy, SessionStrategyKind::TrustedHeader);
        assert_eq!(
            config.stream_settings(),
            StreamSettings {
                buffer: 8,
                max_lifetime: None
            }
        );
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config_from(&[("CASES_HEARTBEAT_SECS", "soon")]).expect_err("not a number");
        assert_eq!(err.code, "invalid_config");
        assert!(err.source.to_string().contains("CASES_HEARTBEAT_SECS"));

        let err = config_from(&[("CASES_SESSION_STRATEGY", "oauth")]).expect_err("unknown");
        assert!(err.source.to_string().contains("CASES_SESSION_STRATEGY"));
    }
}
