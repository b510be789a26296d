use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::{bail, Context, Result};
use shared::protocol::{self, DEFAULT_MX, LOCATION_HOST, MAX_REPLY_DELAY_SECS, SERVICE_UUID};

/// Settings of the discovery engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Local interface address both roles bind to
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "protocol::ssdp_socket_addr")]
    pub multicast_addr: SocketAddrV4,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_location_host")]
    pub location_host: String,
    /// MX sent in our own search requests
    #[serde(default = "default_search_mx")]
    pub search_mx: u32,
    /// Cap on the random delay before answering a search, whatever its MX
    #[serde(default = "default_max_reply_delay")]
    pub max_reply_delay_secs: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: f64,
}

/// Daemon configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    #[serde(default = "default_service_address")]
    pub address: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Only report responses advertising this service id
    pub filter: Option<String>,
    #[serde(default)]
    pub auto_stop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_service_uuid() -> String {
    SERVICE_UUID.to_string()
}

fn default_location_host() -> String {
    LOCATION_HOST.to_string()
}

fn default_search_mx() -> u32 {
    DEFAULT_MX
}

fn default_max_reply_delay() -> u32 {
    MAX_REPLY_DELAY_SECS
}

fn default_initial_backoff() -> f64 {
    0.2
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_backoff() -> f64 {
    10.0
}

fn default_service_address() -> IpAddr {
    IpAddr::V4(protocol::WILDCARD_ADDR)
}

fn default_listen() -> String {
    "127.0.0.1:8190".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            multicast_addr: protocol::ssdp_socket_addr(),
            service_uuid: default_service_uuid(),
            location_host: default_location_host(),
            search_mx: default_search_mx(),
            max_reply_delay_secs: default_max_reply_delay(),
            initial_backoff_secs: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    /// Falls back to the default when the value is not a valid duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.initial_backoff_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_initial_backoff()))
    }

    /// Falls back to the default when the value is not a valid duration
    pub fn max_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_backoff_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_max_backoff()))
    }

    /// Reject search intervals that cannot drive a growing, capped backoff
    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("initial_backoff_secs", self.initial_backoff_secs),
            ("max_backoff_secs", self.max_backoff_secs),
        ] {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                bail!("{} must be a positive number of seconds, got {}", name, secs);
            }
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            bail!("backoff_multiplier must be at least 1.0, got {}", self.backoff_multiplier);
        }
        Ok(())
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.discovery.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.discovery, DiscoveryConfig::default());
        assert_eq!(config.discovery.multicast_addr, "239.255.255.250:1900".parse::<SocketAddrV4>().unwrap());
        assert_eq!(config.discovery.service_uuid, SERVICE_UUID);
        assert!(config.services.is_empty());
        assert!(!config.search.enabled);
        assert_eq!(config.api.listen, "127.0.0.1:8190");
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [discovery]
            interface = "192.168.1.10"
            search_mx = 3
            max_backoff_secs = 4.0

            [[services]]
            id = "store"
            port = 9000

            [[services]]
            id = "proxy"
            address = "192.168.1.10"
            port = 5000

            [search]
            enabled = true
            filter = "store"
            auto_stop = true
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.interface, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(config.discovery.search_mx, 3);
        assert_eq!(config.discovery.max_backoff(), Duration::from_secs(4));
        assert_eq!(config.discovery.initial_backoff(), Duration::from_millis(200));

        assert_eq!(config.services.len(), 2);
        assert!(config.services[0].address.is_unspecified(), "Address defaults to the wildcard");
        assert_eq!(config.services[1].port, 5000);

        assert!(config.search.enabled);
        assert_eq!(config.search.filter.as_deref(), Some("store"));
        assert!(config.search.auto_stop);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        for section in [
            "initial_backoff_secs = -0.2",
            "initial_backoff_secs = 0.0",
            "initial_backoff_secs = nan",
            "max_backoff_secs = inf",
            "max_backoff_secs = -10.0",
            "backoff_multiplier = -1.5",
            "backoff_multiplier = 0.5",
            "backoff_multiplier = nan",
        ] {
            let err = Config::parse(&format!("[discovery]\n{}\n", section));
            assert!(err.is_err(), "{} should be rejected", section);
        }

        let config = Config::parse("[discovery]\nbackoff_multiplier = 1.0\n").unwrap();
        assert!(config.discovery.validate().is_ok(), "A constant interval is allowed");
    }

    #[test]
    fn test_service_requires_port() {
        let err = Config::parse("[[services]]\nid = \"store\"\n");
        assert!(err.is_err());
    }
}
