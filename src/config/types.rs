//! Configuration types

use serde::Deserialize;

/// User-defined configuration (config.toml).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ports: PortsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_router_name")]
    pub name: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: default_router_name(),
        }
    }
}

fn default_router_name() -> String {
    "atrouter".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortsConfig {
    #[serde(default)]
    pub ltoudp: Vec<LtoudpConfig>,
    #[serde(default)]
    pub tashtalk: Vec<TashTalkConfig>,
    #[serde(default)]
    pub ethertalk: Vec<EtherTalkConfig>,
}

impl PortsConfig {
    pub fn is_empty(&self) -> bool {
        self.ltoudp.is_empty() && self.tashtalk.is_empty() && self.ethertalk.is_empty()
    }
}

/// A LocalTalk-over-UDP port.
#[derive(Debug, Clone, Deserialize)]
pub struct LtoudpConfig {
    /// Local interface address to bind the multicast socket to.
    #[serde(default = "default_interface_address")]
    pub interface: String,
    /// Network number when this port seeds its network.
    pub seed_network: Option<u16>,
    /// Zone name when this port seeds its network.
    pub seed_zone: Option<String>,
}

fn default_interface_address() -> String {
    "0.0.0.0".to_string()
}

/// A TashTalk serial LocalTalk port.
#[derive(Debug, Clone, Deserialize)]
pub struct TashTalkConfig {
    /// Serial device the modem is attached to.
    pub device: String,
    pub seed_network: Option<u16>,
    pub seed_zone: Option<String>,
}

/// An EtherTalk port.
#[derive(Debug, Clone, Deserialize)]
pub struct EtherTalkConfig {
    /// Ethernet interface name.
    pub interface: String,
    pub seed_network_min: Option<u16>,
    pub seed_network_max: Option<u16>,
    /// Zones for the seeded range; the first is the default zone.
    #[serde(default)]
    pub seed_zones: Vec<String>,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    #[serde(default = "default_true")]
    pub calculate_checksums: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.router.name, "atrouter");
        assert_eq!(config.logging.level, "info");
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [router]
            name = "attic"

            [logging]
            level = "debug"
            format = "compact"

            [[ports.ltoudp]]
            seed_network = 1
            seed_zone = "Twilight"

            [[ports.tashtalk]]
            device = "/dev/ttyUSB0"
            seed_network = 2
            seed_zone = "Twilight"

            [[ports.ethertalk]]
            interface = "eth0"
            seed_network_min = 3
            seed_network_max = 5
            seed_zones = ["Twilight", "Finance"]
            "#,
        )
        .unwrap();
        assert_eq!(config.router.name, "attic");
        assert_eq!(config.ports.ltoudp.len(), 1);
        assert_eq!(config.ports.ltoudp[0].interface, "0.0.0.0");
        assert_eq!(config.ports.ltoudp[0].seed_network, Some(1));
        assert_eq!(config.ports.tashtalk[0].device, "/dev/ttyUSB0");
        assert_eq!(config.ports.ethertalk[0].seed_zones.len(), 2);
        assert!(config.ports.ethertalk[0].verify_checksums);
    }

    #[test]
    fn test_non_seeded_port() {
        let config: Config = toml::from_str("[[ports.ethertalk]]\ninterface = \"eth0\"\n").unwrap();
        assert_eq!(config.ports.ethertalk[0].seed_network_min, None);
        assert!(config.ports.ethertalk[0].seed_zones.is_empty());
    }
}
