//! Configuration for the streaming and push collaborators.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Push channel configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Push endpoint (e.g., "wss://api.example.org/push")
    pub url: String,

    /// Reconnection attempts after an unexpected close (0 = no reconnection)
    pub max_reconnect_attempts: u32,

    /// Fixed delay between reconnection attempts in milliseconds
    pub reconnect_delay_ms: u64,

    /// How long a single read waits before re-checking for disconnect, in
    /// milliseconds
    pub read_poll_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/push".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            read_poll_ms: 250,
        }
    }
}

impl PushConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms.max(1))
    }
}

/// Streaming insight endpoint configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Streaming endpoint URL
    pub endpoint: String,

    /// Size of each read from the response body
    pub read_buffer_bytes: usize,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/insights/stream".to_string(),
            read_buffer_bytes: 8 * 1024,
        }
    }
}

/// Combined configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub push: PushConfig,
    pub insight: InsightConfig,
}

impl SyncConfig {
    /// Parse from a JSON document. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Environment variables:
    /// - `GRANTWIRE_PUSH_URL`: Push endpoint
    /// - `GRANTWIRE_RECONNECT_ATTEMPTS`: Number of reconnection attempts
    /// - `GRANTWIRE_RECONNECT_DELAY`: Delay between attempts in ms
    /// - `GRANTWIRE_READ_POLL`: Push read poll interval in ms
    /// - `GRANTWIRE_INSIGHT_URL`: Streaming insight endpoint
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("GRANTWIRE_PUSH_URL") {
            config.push.url = url;
        }
        if let Some(value) = lookup("GRANTWIRE_RECONNECT_ATTEMPTS") {
            config.push.max_reconnect_attempts =
                parse_number("GRANTWIRE_RECONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("GRANTWIRE_RECONNECT_DELAY") {
            config.push.reconnect_delay_ms = parse_number("GRANTWIRE_RECONNECT_DELAY", &value)?;
        }
        if let Some(value) = lookup("GRANTWIRE_READ_POLL") {
            config.push.read_poll_ms = parse_number("GRANTWIRE_READ_POLL", &value)?;
        }
        if let Some(url) = lookup("GRANTWIRE_INSIGHT_URL") {
            config.insight.endpoint = url;
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.push.max_reconnect_attempts, 5);
        assert_eq!(config.push.reconnect_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GRANTWIRE_RECONNECT_ATTEMPTS", "2"),
            ("GRANTWIRE_RECONNECT_DELAY", "50"),
            ("GRANTWIRE_PUSH_URL", "wss://push.example.org"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.push.max_reconnect_attempts, 2);
        assert_eq!(config.push.reconnect_delay_ms, 50);
        assert_eq!(config.push.url, "wss://push.example.org");
        assert_eq!(config.insight, InsightConfig::default());
    }

    #[test]
    fn test_invalid_number() {
        let result = SyncConfig::from_lookup(|key| {
            (key == "GRANTWIRE_RECONNECT_DELAY").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_partial_json() {
        let config = SyncConfig::from_json(r#"{"push": {"reconnect_delay_ms": 10}}"#).unwrap();
        assert_eq!(config.push.reconnect_delay_ms, 10);
        assert_eq!(config.push.max_reconnect_attempts, 5);
    }
}
