//! Feed configuration.
//!
//! Layers, later wins: built-in defaults, an optional JSON file, environment
//! variables, then whatever the host sets explicitly (CLI flags).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::QuantityPolicy;
use crate::bus::DeliveryPolicy;
use crate::error::{Error, Result};
use crate::protocol::Topic;

/// Stream endpoint override.
pub const ENDPOINT_ENV: &str = "TOPICS_WEBSOCKET_ENDPOINT";
pub const DELIVERY_ENV: &str = "STOCKFEED_DELIVERY";
pub const QUANTITY_ENV: &str = "STOCKFEED_QUANTITY";
pub const RECONNECT_ENV: &str = "STOCKFEED_RECONNECT";

/// Used when `TOPICS_WEBSOCKET_ENDPOINT` is unset.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/topic/messages";

/// What the connection does after the stream errors or closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ReconnectPolicy {
    /// Report the disconnect and stop.
    Never,
    /// Report the disconnect, then retry with exponential backoff.
    Backoff { initial_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Backoff {
            initial_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` to give
    /// up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(20);
                let ms = initial_ms.saturating_mul(1u64 << shift).min(max_ms);
                Some(Duration::from_millis(ms))
            }
        }
    }
}

impl FromStr for ReconnectPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(Self::Never),
            "backoff" => Ok(Self::default()),
            other => Err(Error::Config(format!(
                "unknown reconnect policy {other:?} (expected never or backoff)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// `ws://` or `wss://` address of the topic stream.
    pub endpoint: String,
    /// Default: isolate
    pub delivery: DeliveryPolicy,
    /// Default: strict
    pub quantity: QuantityPolicy,
    /// Default: backoff 500 ms doubling up to 30 s
    pub reconnect: ReconnectPolicy,
    /// Prefixes counted by the host. Default: orders, shipments
    pub counted_topics: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            delivery: DeliveryPolicy::default(),
            quantity: QuantityPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            counted_topics: Topic::COUNTED
                .iter()
                .map(|topic| topic.as_str().to_string())
                .collect(),
        }
    }
}

impl FeedConfig {
    /// Defaults, overlaid with `path` (if any) and then the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_lookup(|key| std::env::var(key).ok())
    }

    /// Overlays settings from `lookup`, keyed by the `*_ENV` names. Empty
    /// values are treated as unset.
    pub fn apply_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(endpoint) = get(ENDPOINT_ENV) {
            self.endpoint = endpoint;
        }
        if let Some(value) = get(DELIVERY_ENV) {
            self.delivery = value.trim().parse()?;
        }
        if let Some(value) = get(QUANTITY_ENV) {
            self.quantity = value.trim().parse()?;
        }
        if let Some(value) = get(RECONNECT_ENV) {
            self.reconnect = value.trim().parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(Error::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "expected a ws:// or wss:// address".to_string(),
            });
        }
        if let ReconnectPolicy::Backoff { initial_ms, max_ms } = self.reconnect {
            if initial_ms == 0 || max_ms < initial_ms {
                return Err(Error::Config(format!(
                    "backoff needs 0 < initial_ms <= max_ms, got {initial_ms}/{max_ms}"
                )));
            }
        }
        if self.counted_topics.iter().any(String::is_empty) {
            // An empty prefix would count every frame.
            return Err(Error::Config("counted topic prefix is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_fallback_endpoint() {
        let config = FeedConfig::default();
        assert_eq!(config.endpoint, "ws://localhost:8080/topic/messages");
        assert_eq!(config.counted_topics, vec!["orders", "shipments"]);
        assert_eq!(config.delivery, DeliveryPolicy::Isolate);
        assert_eq!(config.quantity, QuantityPolicy::Strict);
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_defaults() {
        let mut config = FeedConfig::default();
        config
            .apply_lookup(lookup(&[
                (ENDPOINT_ENV, "wss://feed.example/topic/messages"),
                (DELIVERY_ENV, "fail-fast"),
                (QUANTITY_ENV, " legacy "),
                (RECONNECT_ENV, "never"),
            ]))
            .unwrap();
        assert_eq!(config.endpoint, "wss://feed.example/topic/messages");
        assert_eq!(config.delivery, DeliveryPolicy::FailFast);
        assert_eq!(config.quantity, QuantityPolicy::Legacy);
        assert_eq!(config.reconnect, ReconnectPolicy::Never);
    }

    #[test]
    fn empty_endpoint_variable_keeps_fallback() {
        let mut config = FeedConfig::default();
        config.apply_lookup(lookup(&[(ENDPOINT_ENV, "")])).unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let mut config = FeedConfig::default();
        let err = config
            .apply_lookup(lookup(&[(QUANTITY_ENV, "lenient")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        config.endpoint = "http://localhost:8080".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidEndpoint { .. })));
    }

    #[test]
    fn json_file_is_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"quantity": "legacy", "reconnect": {{"mode": "backoff", "initial_ms": 100, "max_ms": 400}}}}"#
        )
        .unwrap();
        let config = FeedConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.quantity, QuantityPolicy::Legacy);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(
            config.reconnect,
            ReconnectPolicy::Backoff {
                initial_ms: 100,
                max_ms: 400
            }
        );
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::Backoff {
            initial_ms: 100,
            max_ms: 350,
        };
        let delays: Vec<_> = (1..=4).map(|n| policy.delay(n).unwrap().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        assert_eq!(ReconnectPolicy::Never.delay(1), None);
    }
}
