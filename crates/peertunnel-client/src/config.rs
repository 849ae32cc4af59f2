//! Tunnel configuration

use crate::error::TunnelError;
use peertunnel_connection::ReconnectConfig;
use peertunnel_proto::{is_feed_id, PeerId, DEFAULT_SCOPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Crates whose diagnostics the `logging` option turns on
const TUNNEL_TARGETS: [&str; 6] = [
    "peertunnel",
    "peertunnel_proto",
    "peertunnel_connection",
    "peertunnel_control",
    "peertunnel_client",
    "peertunnel_net",
];

/// Tunnel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Portal to register listeners with
    #[serde(default)]
    pub portal: Option<PeerId>,
    /// Emit diagnostic output
    #[serde(default)]
    pub logging: bool,
    /// Visibility scope reported to the transport host
    #[serde(default)]
    pub scope: Option<String>,
    /// Upper bound of the random delay between registration attempts
    #[serde(default = "default_jitter", with = "duration_millis")]
    pub reconnect_jitter: Duration,
}

fn default_jitter() -> Duration {
    ReconnectConfig::default().max_jitter
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            portal: None,
            logging: false,
            scope: None,
            reconnect_jitter: default_jitter(),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Scope reported to the transport host
    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_jitter: self.reconnect_jitter,
        }
    }

    /// Default filter directive for the log subscriber
    pub fn log_directive(&self) -> String {
        if self.logging {
            TUNNEL_TARGETS
                .iter()
                .map(|target| format!("{}=debug", target))
                .collect::<Vec<_>>()
                .join(",")
        } else {
            "warn".to_string()
        }
    }

    /// Check values that deserialization accepts unchecked
    pub fn validate(&self) -> Result<(), TunnelError> {
        if let Some(portal) = &self.portal {
            if !is_feed_id(portal.as_str()) {
                return Err(TunnelError::ConfigError(format!(
                    "portal is not a valid peer id: {}",
                    portal
                )));
            }
        }
        if matches!(&self.scope, Some(scope) if scope.is_empty()) {
            return Err(TunnelError::ConfigError("scope must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
    portal: Option<String>,
}

impl TunnelConfigBuilder {
    pub fn portal(mut self, portal: impl Into<String>) -> Self {
        self.portal = Some(portal.into());
        self
    }

    pub fn logging(mut self, enabled: bool) -> Self {
        self.config.logging = enabled;
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.config.scope = Some(scope.into());
        self
    }

    pub fn reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.config.reconnect_jitter = jitter;
        self
    }

    pub fn build(mut self) -> Result<TunnelConfig, TunnelError> {
        if let Some(portal) = self.portal {
            let portal = portal
                .parse::<PeerId>()
                .map_err(|e| TunnelError::ConfigError(e.to_string()))?;
            self.config.portal = Some(portal);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
