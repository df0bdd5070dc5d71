//! Client configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `NEO_BACNET_*` environment variables (nested keys use `__`, e.g.
//! `NEO_BACNET_DEVICE__INSTANCE`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::TimeoutPolicy;
use crate::types::MAX_INSTANCE;

/// Standard BACnet/IP UDP port (0xBAC0)
pub const DEFAULT_PORT: u16 = 47808;

/// Retry backoff selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Client configuration (neo-bacnet.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local interface to bind
    pub interface: String,
    pub port: u16,
    /// Broadcast address, with or without port
    pub broadcast: Option<String>,
    pub apdu_timeout_ms: u64,
    /// Total transmissions per confirmed request, including the first
    pub apdu_retries: u32,
    pub backoff: BackoffKind,
    pub discovery_window_ms: u64,
    pub stale_after_secs: u64,
    /// Local device object; omitted means the client is not discoverable
    pub device: Option<DeviceConfig>,
}

/// Local device identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub instance: u32,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
}

fn default_device_name() -> String {
    "neo-bacnet".to_string()
}

fn default_vendor_id() -> u16 {
    // Unregistered vendor
    0xFFFF
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            broadcast: None,
            apdu_timeout_ms: 3000,
            apdu_retries: 3,
            backoff: BackoffKind::Fixed,
            discovery_window_ms: 2000,
            stale_after_secs: 600,
            device: None,
        }
    }
}

impl ClientConfig {
    /// Defaults, then `path` (if given and present), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("NEO_BACNET_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the plain `BACNET_IP`, `BACNET_PORT` and
    /// `BACNET_BROADCAST` variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            interface: lookup("BACNET_IP").unwrap_or(defaults.interface),
            port: lookup("BACNET_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            broadcast: lookup("BACNET_BROADCAST"),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apdu_retries == 0 {
            return Err(ConfigError::Invalid("apdu_retries must be at least 1".into()));
        }
        if self.apdu_timeout_ms == 0 {
            return Err(ConfigError::Invalid("apdu_timeout_ms must be positive".into()));
        }
        if let Some(device) = &self.device {
            if device.instance >= MAX_INSTANCE {
                return Err(ConfigError::Invalid(format!(
                    "device instance {} out of range (max {})",
                    device.instance,
                    MAX_INSTANCE - 1
                )));
            }
        }
        self.bind_addr()?;
        self.broadcast_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .interface
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad interface address '{}'", self.interface)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Broadcast target; the configured port is used when none is given
    pub fn broadcast_addr(&self) -> Result<SocketAddr, ConfigError> {
        let Some(broadcast) = &self.broadcast else {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port));
        };
        if let Ok(addr) = broadcast.parse::<SocketAddr>() {
            return Ok(addr);
        }
        broadcast
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, self.port))
            .map_err(|_| ConfigError::Invalid(format!("bad broadcast address '{}'", broadcast)))
    }

    /// Default policy for confirmed requests
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        let initial = Duration::from_millis(self.apdu_timeout_ms);
        let policy = TimeoutPolicy::new(initial, self.apdu_retries);
        match self.backoff {
            BackoffKind::Fixed => policy,
            BackoffKind::Exponential => policy.with_exponential_backoff(2.0, initial * 8),
        }
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Backoff;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.bind_addr().unwrap(), "0.0.0.0:47808".parse().unwrap());
        assert_eq!(
            config.broadcast_addr().unwrap(),
            "255.255.255.255:47808".parse().unwrap()
        );
        assert_eq!(config.timeout_policy(), TimeoutPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
interface = "127.0.0.1"
port = 47809
broadcast = "10.0.0.255"
apdu_timeout_ms = 500
backoff = "exponential"

[device]
instance = 1234
"#
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 47809);
        assert_eq!(config.apdu_retries, 3);
        assert_eq!(config.broadcast_addr().unwrap(), "10.0.0.255:47809".parse().unwrap());

        let device = config.device.as_ref().unwrap();
        assert_eq!(device.instance, 1234);
        assert_eq!(device.name, "neo-bacnet");

        let policy = config.timeout_policy();
        assert_eq!(policy.initial_timeout, Duration::from_millis(500));
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
    }

    #[test]
    fn test_from_toml_str() {
        let config = ClientConfig::from_toml_str("port = 47810\n[device]\ninstance = 7\n").unwrap();
        assert_eq!(config.port, 47810);
        assert_eq!(config.apdu_timeout_ms, 3000);
        assert_eq!(config.device.unwrap().vendor_id, 0xFFFF);

        assert!(matches!(
            ClientConfig::from_toml_str("port = \"nope\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "apdu_retries = 0").unwrap();
        assert!(matches!(
            ClientConfig::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));

        let config = ClientConfig {
            broadcast: Some("not-an-address".into()),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            device: Some(DeviceConfig {
                instance: MAX_INSTANCE,
                name: "x".into(),
                vendor_id: 1,
            }),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_plain_bacnet_variables() {
        let vars: HashMap<&str, &str> = [
            ("BACNET_IP", "192.168.1.50"),
            ("BACNET_PORT", "47820"),
            ("BACNET_BROADCAST", "192.168.1.255:47808"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.bind_addr().unwrap(), "192.168.1.50:47820".parse().unwrap());
        assert_eq!(
            config.broadcast_addr().unwrap(),
            "192.168.1.255:47808".parse().unwrap()
        );
        assert_eq!(config.apdu_timeout_ms, 3000);
    }
}
