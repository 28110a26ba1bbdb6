//! Active tunnel configuration and the transport callback envelope.
//!
//! The transport delivers a [`ConfigUpdate`] over the control socket when
//! the tunnel comes up or goes down. The embedded [`VpnConfig`] describes
//! the concrete network state of the tunnel: device, addresses, DNS
//! remotes and split-routing directives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Update reason for a VPN connect.
pub const REASON_CONNECT: &str = "connect";
/// Update reason for a VPN disconnect.
pub const REASON_DISCONNECT: &str = "disconnect";

/// Tunnel device settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub mtu: u32,
}

/// IPv4 address assigned to the tunnel device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressV4 {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

/// IPv6 address assigned to the tunnel device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressV6 {
    pub address: Ipv6Addr,
    pub prefix: u8,
}

/// DNS settings of the tunnel.
///
/// `remotes` maps domain suffixes to resolver addresses; the key `.`
/// selects the default resolvers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub default_domain: String,
    #[serde(default)]
    pub remotes: BTreeMap<String, Vec<String>>,
}

/// Split routing directives of the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSettings {
    /// Networks excluded from the tunnel, in CIDR notation
    #[serde(default)]
    pub exclude_networks: Vec<String>,
    /// Domain suffixes whose resolved addresses bypass the tunnel
    #[serde(default)]
    pub exclude_dns: Vec<String>,
}

/// Additional tunnel flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub disable_always_on_vpn: bool,
}

/// Network configuration of an active tunnel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpnConfig {
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub ipv4: Option<AddressV4>,
    #[serde(default)]
    pub ipv6: Option<AddressV6>,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub split: SplitSettings,
    #[serde(default)]
    pub flags: Flags,
}

impl VpnConfig {
    /// Address assigned to the tunnel device as text, empty if none.
    ///
    /// Assumes a single IPv4 or a single IPv6 address on the device.
    pub fn ip(&self) -> String {
        if let Some(v4) = &self.ipv4 {
            return v4.address.to_string();
        }
        if let Some(v6) = &self.ipv6 {
            return v6.address.to_string();
        }
        String::new()
    }
}

/// Config update sent by the transport over the control socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigUpdate {
    pub reason: String,
    pub token: String,
    #[serde(default)]
    pub config: Option<VpnConfig>,
}

impl ConfigUpdate {
    /// A connect update must carry a config; a disconnect ignores it.
    pub fn valid(&self) -> bool {
        match self.reason.as_str() {
            REASON_CONNECT => self.config.is_some(),
            REASON_DISCONNECT => true,
            _ => false,
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> VpnConfig {
        let mut remotes = BTreeMap::new();
        remotes.insert(".".to_string(), vec!["10.0.0.1:53".to_string()]);
        VpnConfig {
            gateway: "vpn.example.com".to_string(),
            device: Device {
                name: "octun0".to_string(),
                mtu: 1400,
            },
            ipv4: Some(AddressV4 {
                address: "10.0.0.2".parse().unwrap(),
                prefix: 24,
            }),
            dns: DnsSettings {
                default_domain: "example.com".to_string(),
                remotes,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_ip() {
        assert_eq!(test_config().ip(), "10.0.0.2");
        assert_eq!(VpnConfig::default().ip(), "");

        let v6 = VpnConfig {
            ipv6: Some(AddressV6 {
                address: "fd00::2".parse().unwrap(),
                prefix: 64,
            }),
            ..Default::default()
        };
        assert_eq!(v6.ip(), "fd00::2");
    }

    #[test]
    fn test_deep_equality() {
        let a = test_config();
        let mut b = test_config();
        assert_eq!(a, b);

        b.dns
            .remotes
            .insert("corp.example.com.".to_string(), vec!["10.0.0.53:53".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = test_config();
        let json = serde_json::to_vec(&config).unwrap();
        let parsed: VpnConfig = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_update_valid() {
        let connect = ConfigUpdate {
            reason: REASON_CONNECT.to_string(),
            token: "t".to_string(),
            config: Some(test_config()),
        };
        assert!(connect.valid());

        let connect_without_config = ConfigUpdate {
            reason: REASON_CONNECT.to_string(),
            token: "t".to_string(),
            config: None,
        };
        assert!(!connect_without_config.valid());

        let disconnect = ConfigUpdate {
            reason: REASON_DISCONNECT.to_string(),
            token: "t".to_string(),
            config: None,
        };
        assert!(disconnect.valid());

        let bogus = ConfigUpdate {
            reason: "reconnect".to_string(),
            token: "t".to_string(),
            config: None,
        };
        assert!(!bogus.valid());
    }

    #[test]
    fn test_update_wire_field_names() {
        let update = ConfigUpdate {
            reason: REASON_DISCONNECT.to_string(),
            token: "secret".to_string(),
            config: None,
        };
        let json = String::from_utf8(update.to_json().unwrap()).unwrap();
        assert!(json.contains("\"Reason\""));
        assert!(json.contains("\"Token\""));

        let parsed = ConfigUpdate::from_json(json.as_bytes()).unwrap();
        assert_eq!(parsed.reason, REASON_DISCONNECT);
        assert_eq!(parsed.token, "secret");
    }
}
