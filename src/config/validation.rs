//! Configuration validation
//!
//! Collects every problem in one pass so the operator sees them all
//! before the router refuses to start.

use super::{Config, EtherTalkConfig};
use crate::protocol::zone::MAX_ZONE_NAME_LENGTH;
use crate::protocol::{NetworkRange, NETWORK_MAX};

/// Outcome of validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        self.warnings.push(message);
    }
}

/// Validate a configuration.
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.ports.is_empty() {
        result.error("no ports configured".into());
    }

    let mut seed_ranges: Vec<(String, NetworkRange)> = Vec::new();

    for (index, port) in config.ports.ltoudp.iter().enumerate() {
        let label = format!("ports.ltoudp[{}]", index);
        if port.interface.parse::<std::net::Ipv4Addr>().is_err() {
            result.error(format!("{}: invalid interface address {}", label, port.interface));
        }
        check_localtalk_seed(&mut result, &label, port.seed_network, port.seed_zone.as_deref());
        if let Some(network) = port.seed_network {
            seed_ranges.push((label, NetworkRange::single(network)));
        }
    }

    for (index, port) in config.ports.tashtalk.iter().enumerate() {
        let label = format!("ports.tashtalk[{}]", index);
        if port.device.is_empty() {
            result.error(format!("{}: device must not be empty", label));
        }
        check_localtalk_seed(&mut result, &label, port.seed_network, port.seed_zone.as_deref());
        if let Some(network) = port.seed_network {
            seed_ranges.push((label, NetworkRange::single(network)));
        }
    }

    for (index, port) in config.ports.ethertalk.iter().enumerate() {
        let label = format!("ports.ethertalk[{}]", index);
        if port.interface.is_empty() {
            result.error(format!("{}: interface must not be empty", label));
        }
        if let Some(range) = check_ethertalk_seed(&mut result, &label, port) {
            seed_ranges.push((label, range));
        }
    }

    // seeded ranges must not collide across ports
    for (i, (label_a, range_a)) in seed_ranges.iter().enumerate() {
        for (label_b, range_b) in seed_ranges.iter().skip(i + 1) {
            if range_a.overlaps(range_b) {
                result.error(format!(
                    "{} and {} seed overlapping network ranges {} and {}",
                    label_a, label_b, range_a, range_b
                ));
            }
        }
    }

    let duplicate_devices = {
        let mut devices: Vec<&str> = config
            .ports
            .tashtalk
            .iter()
            .map(|p| p.device.as_str())
            .chain(config.ports.ethertalk.iter().map(|p| p.interface.as_str()))
            .collect();
        devices.sort_unstable();
        devices.windows(2).any(|pair| pair[0] == pair[1] && !pair[0].is_empty())
    };
    if duplicate_devices {
        result.warning("two ports share a device or interface".into());
    }

    result
}

fn check_network_number(result: &mut ValidationResult, label: &str, network: u16) {
    if network == 0 || network > NETWORK_MAX {
        result.error(format!(
            "{}: network number {} outside the assignable range 1-{}",
            label, network, NETWORK_MAX
        ));
    }
}

fn check_zone_name(result: &mut ValidationResult, label: &str, zone_name: &str) {
    let length = zone_name.as_bytes().len();
    if length == 0 || length > MAX_ZONE_NAME_LENGTH {
        result.error(format!(
            "{}: zone name must be 1-{} bytes, got {}",
            label, MAX_ZONE_NAME_LENGTH, length
        ));
    }
}

fn check_localtalk_seed(
    result: &mut ValidationResult,
    label: &str,
    seed_network: Option<u16>,
    seed_zone: Option<&str>,
) {
    match (seed_network, seed_zone) {
        (Some(network), Some(zone_name)) => {
            check_network_number(result, label, network);
            check_zone_name(result, label, zone_name);
        }
        (None, None) => {}
        _ => result.error(format!(
            "{}: seed_network and seed_zone must be provided together",
            label
        )),
    }
}

fn check_ethertalk_seed(
    result: &mut ValidationResult,
    label: &str,
    port: &EtherTalkConfig,
) -> Option<NetworkRange> {
    match (port.seed_network_min, port.seed_network_max) {
        (Some(first), Some(last)) => {
            check_network_number(result, label, first);
            check_network_number(result, label, last);
            if first > last {
                result.error(format!(
                    "{}: seed_network_min {} exceeds seed_network_max {}",
                    label, first, last
                ));
            }
            if port.seed_zones.is_empty() {
                result.error(format!("{}: a seeded range needs at least one zone", label));
            }
            for zone_name in &port.seed_zones {
                check_zone_name(result, label, zone_name);
            }
            Some(NetworkRange::new(first, last))
        }
        (None, None) => {
            if !port.seed_zones.is_empty() {
                result.error(format!(
                    "{}: seed_zones given without a seed network range",
                    label
                ));
            }
            None
        }
        _ => {
            result.error(format!(
                "{}: seed_network_min and seed_network_max must be provided together",
                label
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_empty_config_is_an_error() {
        let result = validate(&parse(""));
        assert!(result.has_errors());
    }

    #[test]
    fn test_valid_config() {
        let result = validate(&parse(
            r#"
            [[ports.ltoudp]]
            seed_network = 1
            seed_zone = "Twilight"

            [[ports.ethertalk]]
            interface = "eth0"
            seed_network_min = 3
            seed_network_max = 5
            seed_zones = ["Finance"]
            "#,
        ));
        assert!(!result.has_errors(), "{:?}", result.errors);
    }

    #[test]
    fn test_seed_fields_must_pair() {
        let result = validate(&parse("[[ports.ltoudp]]\nseed_network = 1\n"));
        assert!(result.has_errors());
        let result = validate(&parse(
            "[[ports.ethertalk]]\ninterface = \"eth0\"\nseed_network_min = 3\n",
        ));
        assert!(result.has_errors());
    }

    #[test]
    fn test_network_number_bounds() {
        let result = validate(&parse(
            "[[ports.ltoudp]]\nseed_network = 65280\nseed_zone = \"Z\"\n",
        ));
        assert!(result.has_errors());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let result = validate(&parse(
            r#"
            [[ports.ethertalk]]
            interface = "eth0"
            seed_network_min = 5
            seed_network_max = 3
            seed_zones = ["Finance"]
            "#,
        ));
        assert!(result.has_errors());
    }

    #[test]
    fn test_overlapping_seed_ranges_rejected() {
        let result = validate(&parse(
            r#"
            [[ports.ltoudp]]
            seed_network = 4
            seed_zone = "Twilight"

            [[ports.ethertalk]]
            interface = "eth0"
            seed_network_min = 3
            seed_network_max = 5
            seed_zones = ["Finance"]
            "#,
        ));
        assert!(result.has_errors());
    }

    #[test]
    fn test_non_seeded_ports_are_fine() {
        let result = validate(&parse("[[ports.ethertalk]]\ninterface = \"eth0\"\n"));
        assert!(!result.has_errors(), "{:?}", result.errors);
    }
}
