//! Restart configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `MOULT_ADDR`: Address to bind when no listener is inherited. Default: `0.0.0.0:8080`
//! - `MOULT_LISTENER_NAME`: Name of the listener in `LISTEN_FD_NAMES`. Default: `tcp`
//! - `MOULT_DRAIN_TIMEOUT_SECS`: Upper bound on draining. Unset or `0` drains without limit.
//! - `MOULT_HANDOFF_STRATEGY`: `exec` (default) or `spawn`. See [`HandoffStrategy`].

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use crate::error::ConfigError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_LISTENER_NAME: &str = "tcp";

const ADDR_VAR: &str = "MOULT_ADDR";
const LISTENER_NAME_VAR: &str = "MOULT_LISTENER_NAME";
const DRAIN_TIMEOUT_VAR: &str = "MOULT_DRAIN_TIMEOUT_SECS";
const STRATEGY_VAR: &str = "MOULT_HANDOFF_STRATEGY";

/// How an upgrade event hands the socket to the next process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandoffStrategy {
    /// Drain, then exec the new binary in place of this process.
    #[default]
    Exec,
    /// Start the new binary as a child while this process keeps serving. The
    /// child sends SIGQUIT once it serves, and this process drains and exits.
    Spawn,
}

impl HandoffStrategy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exec" => Some(Self::Exec),
            "spawn" => Some(Self::Spawn),
            _ => None,
        }
    }
}

impl fmt::Display for HandoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffStrategy::Exec => write!(f, "exec"),
            HandoffStrategy::Spawn => write!(f, "spawn"),
        }
    }
}

/// Configuration for the [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartConfig {
    /// Address bound on a cold start. Ignored when a listener is inherited.
    pub addr: SocketAddr,
    /// Name under which the listener is passed to a replacement.
    pub listener_name: String,
    /// Drain bound. `None` waits for every connection, however long it takes.
    pub drain_timeout: Option<Duration>,
    /// What an upgrade event does with the socket.
    pub strategy: HandoffStrategy,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            listener_name: DEFAULT_LISTENER_NAME.to_string(),
            drain_timeout: None,
            strategy: HandoffStrategy::default(),
        }
    }
}

impl RestartConfig {
    /// Config with the given bind address and defaults for everything else.
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr_raw = lookup(ADDR_VAR).unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr_raw.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError {
            var: ADDR_VAR,
            value: addr_raw.clone(),
            reason: e.to_string(),
        })?;

        let listener_name =
            lookup(LISTENER_NAME_VAR).unwrap_or_else(|| DEFAULT_LISTENER_NAME.to_string());
        if listener_name.is_empty() || listener_name.contains(':') {
            return Err(ConfigError {
                var: LISTENER_NAME_VAR,
                value: listener_name,
                reason: "must be non-empty and must not contain ':'".to_string(),
            });
        }

        let drain_timeout = match lookup(DRAIN_TIMEOUT_VAR) {
            None => None,
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError {
                        var: DRAIN_TIMEOUT_VAR,
                        value: raw.clone(),
                        reason: e.to_string(),
                    }
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        let strategy = match lookup(STRATEGY_VAR) {
            None => HandoffStrategy::default(),
            Some(raw) => HandoffStrategy::parse(&raw).ok_or_else(|| ConfigError {
                var: STRATEGY_VAR,
                value: raw.clone(),
                reason: "expected 'exec' or 'spawn'".to_string(),
            })?,
        };

        Ok(Self {
            addr,
            listener_name,
            drain_timeout,
            strategy,
        })
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            addr = %self.addr,
            listener_name = %self.listener_name,
            strategy = %self.strategy,
            "Restart configuration"
        );
        match self.drain_timeout {
            Some(limit) => info!(timeout_secs = limit.as_secs(), "Drain timeout: bounded"),
            None => info!("Drain timeout: unbounded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RestartConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, RestartConfig::default());
        assert_eq!(config.addr.to_string(), DEFAULT_ADDR);
        assert!(config.drain_timeout.is_none());
        assert_eq!(config.strategy, HandoffStrategy::Exec);
    }

    #[test]
    fn test_all_values_parsed() {
        let config = RestartConfig::from_lookup(lookup_from(&[
            ("MOULT_ADDR", "127.0.0.1:9000"),
            ("MOULT_LISTENER_NAME", "echo"),
            ("MOULT_DRAIN_TIMEOUT_SECS", "15"),
            ("MOULT_HANDOFF_STRATEGY", "Spawn"),
        ]))
        .unwrap();

        assert_eq!(config.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.listener_name, "echo");
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.strategy, HandoffStrategy::Spawn);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = RestartConfig::from_lookup(lookup_from(&[("MOULT_HANDOFF_STRATEGY", "fork")]))
            .unwrap_err();
        assert_eq!(err.var, "MOULT_HANDOFF_STRATEGY");
        assert_eq!(err.value, "fork");
    }

    #[test]
    fn test_zero_drain_timeout_is_unbounded() {
        let config =
            RestartConfig::from_lookup(lookup_from(&[("MOULT_DRAIN_TIMEOUT_SECS", "0")])).unwrap();
        assert!(config.drain_timeout.is_none());
    }

    #[test]
    fn test_invalid_addr_rejected() {
        let err = RestartConfig::from_lookup(lookup_from(&[("MOULT_ADDR", "not-an-addr")]))
            .unwrap_err();
        assert_eq!(err.var, "MOULT_ADDR");
        assert_eq!(err.value, "not-an-addr");
    }

    #[test]
    fn test_invalid_drain_timeout_rejected() {
        let err = RestartConfig::from_lookup(lookup_from(&[("MOULT_DRAIN_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert_eq!(err.var, "MOULT_DRAIN_TIMEOUT_SECS");
    }

    #[test]
    fn test_listener_name_with_separator_rejected() {
        let err = RestartConfig::from_lookup(lookup_from(&[("MOULT_LISTENER_NAME", "a:b")]))
            .unwrap_err();
        assert_eq!(err.var, "MOULT_LISTENER_NAME");

        assert!(RestartConfig::from_lookup(lookup_from(&[("MOULT_LISTENER_NAME", "")])).is_err());
    }
}
