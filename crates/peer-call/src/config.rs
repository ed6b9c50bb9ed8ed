//! Configuration types for the call service
//!
//! Everything in here is static per service instance and only affects how
//! connections are created and supervised.

use crate::recovery::RecoveryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for [`CallService`](crate::CallService)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallServiceConfig {
    /// STUN/TURN servers used for NAT traversal
    pub ice_servers: Vec<IceServerConfig>,

    /// Media bundling policy (default: balanced)
    pub bundle_policy: BundlePolicy,

    /// Number of ICE candidates gathered ahead of the first offer (default: 0)
    pub ice_candidate_pool_size: u8,

    /// Log signaling payload details at info level
    pub debug: bool,

    /// Maximum remote participants in one call (default: 10, max: 32)
    pub max_participants: usize,

    /// Quality sampling interval in milliseconds (default: 5000)
    pub quality_interval_ms: u64,

    /// Offer/answer round-trip bound in milliseconds (default: 15000)
    pub negotiation_timeout_ms: u64,

    /// ICE-restart retry policy
    pub recovery: RecoveryPolicy,
}

/// A STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, stuns:, turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default)]
    pub username: String,

    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    /// A STUN server entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    /// A TURN server entry with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }

    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Bundle policy applied at connection creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    /// Bundle per media type
    #[default]
    Balanced,
    /// One transport per track
    MaxCompat,
    /// Everything over one transport
    MaxBundle,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            bundle_policy: BundlePolicy::Balanced,
            ice_candidate_pool_size: 0,
            debug: false,
            max_participants: 10,
            quality_interval_ms: 5000,
            negotiation_timeout_ms: 15000,
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl CallServiceConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - an ICE server has no URL or an unknown scheme
    /// - a TURN server has no credentials
    /// - `max_participants` is not in range 1-32
    /// - `quality_interval_ms` is not in range 1000-60000
    /// - `negotiation_timeout_ms` is zero
    /// - the recovery policy is unusable
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig(
                    "ICE server entry without URLs".to_string(),
                ));
            }

            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !known {
                    return Err(Error::InvalidConfig(format!(
                        "ICE server URL must start with stun:, stuns:, turn: or turns:, got {}",
                        url
                    )));
                }
            }

            if server.is_turn() && (server.username.is_empty() || server.credential.is_empty()) {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.urls.join(",")
                )));
            }
        }

        if self.max_participants == 0 || self.max_participants > 32 {
            return Err(Error::InvalidConfig(format!(
                "max_participants must be in range 1-32, got {}",
                self.max_participants
            )));
        }

        if !(1000..=60000).contains(&self.quality_interval_ms) {
            return Err(Error::InvalidConfig(format!(
                "quality_interval_ms must be in range 1000-60000, got {}",
                self.quality_interval_ms
            )));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be greater than zero".to_string(),
            ));
        }

        self.recovery.validate()
    }

    /// Parse a JSON configuration document
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML configuration document
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            other => Err(Error::InvalidConfig(format!(
                "unsupported config file extension: {:?}",
                other
            ))),
        }
    }

    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Set the quality sampling interval
    pub fn with_quality_interval(mut self, interval: Duration) -> Self {
        self.quality_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the negotiation timeout
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the recovery policy
    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Enable or disable debug logging of signaling payloads
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quality_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_no_ice_servers_is_valid() {
        let config = CallServiceConfig::default().with_ice_servers(Vec::new());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_ice_scheme_fails() {
        let config = CallServiceConfig::default()
            .with_ice_servers(vec![IceServerConfig::stun("http://stun.example.com")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_turn_without_credentials_fails() {
        let config = CallServiceConfig::default()
            .with_ice_servers(vec![IceServerConfig::turn("turn:turn.example.com:3478", "", "")]);
        assert!(config.validate().is_err());

        let config = CallServiceConfig::default().with_ice_servers(vec![IceServerConfig::turn(
            "turn:turn.example.com:3478",
            "user",
            "pass",
        )]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_max_participants_fails() {
        let mut config = CallServiceConfig::default();
        config.max_participants = 0;
        assert!(config.validate().is_err());

        config.max_participants = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_quality_interval_fails() {
        let config = CallServiceConfig::default().with_quality_interval(Duration::from_millis(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_negotiation_timeout_fails() {
        let config = CallServiceConfig::default().with_negotiation_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = CallServiceConfig::from_json_str(
            r#"{"bundle_policy": "max-bundle", "debug": true}"#,
        )
        .unwrap();
        assert_eq!(config.bundle_policy, BundlePolicy::MaxBundle);
        assert!(config.debug);
        assert_eq!(config.max_participants, 10);
        assert_eq!(config.recovery.max_retries, 5);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
ice_servers:
  - urls: ["stun:stun.example.com:3478"]
ice_candidate_pool_size: 4
quality_interval_ms: 2000
recovery:
  max_retries: 2
"#;
        let config = CallServiceConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ice_candidate_pool_size, 4);
        assert_eq!(config.quality_interval_ms, 2000);
        assert_eq!(config.recovery.max_retries, 2);
        assert_eq!(config.recovery.backoff_initial_ms, 1000);
    }

    #[test]
    fn test_config_from_json_rejects_invalid() {
        let result = CallServiceConfig::from_json_str(r#"{"max_participants": 0}"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_config_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("call.yaml");
        std::fs::write(&yaml, "max_participants: 4\n").unwrap();
        assert_eq!(CallServiceConfig::from_file(&yaml).unwrap().max_participants, 4);

        let json = dir.path().join("call.json");
        std::fs::write(&json, r#"{"negotiation_timeout_ms": 5000}"#).unwrap();
        assert_eq!(
            CallServiceConfig::from_file(&json).unwrap().negotiation_timeout(),
            Duration::from_secs(5)
        );

        let toml = dir.path().join("call.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(
            CallServiceConfig::from_file(&toml),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            CallServiceConfig::from_file(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = CallServiceConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: CallServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.ice_servers, deserialized.ice_servers);
        assert_eq!(config.bundle_policy, deserialized.bundle_policy);
    }
}
