//! C1 — Identity & Address Derivation.
//!
//! Turns the mesh interface's MAC address into a stable, collision-reduced
//! link-local IPv4 address in `169.254.0.0/16`. That address is used
//! verbatim both as this node's transport bind address and as its
//! `node_id` string.

use std::net::Ipv4Addr;

use crate::config::Config;
use crate::error::CoreError;

const RESERVED_LOW: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 0);
const RESERVED_HIGH: Ipv4Addr = Ipv4Addr::new(169, 254, 255, 255);
const COLLISION_FALLBACK_A: Ipv4Addr = Ipv4Addr::new(169, 254, 254, 254);
const COLLISION_FALLBACK_B: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 1);

/// Identity handle held by the running node: its derived address/id and the
/// MAC it was derived from (kept for diagnostics).
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub mac: [u8; 6],
    pub address: Ipv4Addr,
}

impl NodeIdentity {
    pub fn self_node_id(&self) -> String {
        self.address.to_string()
    }
}

/// Read the mesh interface's MAC and derive this node's identity. Fails
/// with `ConfigurationError` if the interface is absent — per spec, this
/// must happen before the HTTP surface starts serving.
pub fn resolve_identity(config: &Config) -> Result<NodeIdentity, CoreError> {
    let mac = read_mac(config)?;
    let address = derive_address(mac);
    Ok(NodeIdentity { mac, address })
}

fn read_mac(config: &Config) -> Result<[u8; 6], CoreError> {
    if let Some(ref raw) = config.mac_override {
        return parse_mac(raw);
    }

    let path = format!("/sys/class/net/{}/address", config.mesh_interface_name);
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!(
            "mesh interface '{}' not found (reading {path}): {e}",
            config.mesh_interface_name
        ))
    })?;
    parse_mac(raw.trim())
}

fn parse_mac(raw: &str) -> Result<[u8; 6], CoreError> {
    let mut bytes = [0u8; 6];
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 6 {
        return Err(CoreError::ConfigurationError(format!(
            "malformed MAC address '{raw}'"
        )));
    }
    for (i, part) in parts.iter().enumerate() {
        bytes[i] = u8::from_str_radix(part, 16)
            .map_err(|_| CoreError::ConfigurationError(format!("malformed MAC address '{raw}'")))?;
    }
    Ok(bytes)
}

/// Pure, deterministic derivation: MD5 of the full MAC supplies a
/// collision-reducing third octet; the fourth octet is the MAC's own last
/// byte. Reserved broadcast/network addresses are substituted per a fixed
/// policy order.
pub fn derive_address(mac: [u8; 6]) -> Ipv4Addr {
    let digest = md5::compute(mac);
    let third = digest[0];
    let fourth = mac[5];

    let candidate = Ipv4Addr::new(169, 254, third, fourth);
    if candidate == RESERVED_LOW || candidate == RESERVED_HIGH {
        if COLLISION_FALLBACK_A != RESERVED_LOW && COLLISION_FALLBACK_A != RESERVED_HIGH {
            COLLISION_FALLBACK_A
        } else {
            COLLISION_FALLBACK_B
        }
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
        assert_eq!(derive_address(mac), derive_address(mac));
    }

    #[test]
    fn fourth_octet_is_mac_derived() {
        let mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0xAB];
        let addr = derive_address(mac);
        assert_eq!(addr.octets()[3], 0xAB);
    }

    #[test]
    fn never_produces_reserved_addresses() {
        // Hand-picked MACs whose MD5 third-octet happens to land on the
        // reserved boundaries are not something we can brute-force here,
        // but the substitution path itself must never reproduce a reserved
        // address.
        assert_ne!(derive_address([0, 0, 0, 0, 0, 0]), RESERVED_LOW);
        assert_ne!(derive_address([0, 0, 0, 0, 0, 0]), RESERVED_HIGH);
    }

    #[test]
    fn distinct_macs_usually_differ() {
        let a = derive_address([0x02, 0x11, 0x22, 0x33, 0x44, 0x01]);
        let b = derive_address([0x02, 0x11, 0x22, 0x33, 0x44, 0x02]);
        assert_ne!(a, b);
    }

    #[test]
    fn parses_colon_separated_mac() {
        assert_eq!(
            parse_mac("02:11:22:33:44:55").unwrap(),
            [0x02, 0x11, 0x22, 0x33, 0x44, 0x55]
        );
        assert!(parse_mac("not-a-mac").is_err());
    }
}
