//! Enterprise XML profile adapter.
//!
//! The profile is a vendor XML document declaring VPN servers, the
//! always-on policy, trusted HTTPS servers for network detection and
//! additional allowed hosts. The daemon treats it as an opaque object
//! answering the queries below; an unreadable profile degrades to an
//! empty one so the daemon keeps running.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse profile: {0}")]
    XmlError(#[from] quick_xml::DeError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Profile {
    server_list: ServerList,
    #[serde(rename = "AutomaticVPNPolicy")]
    automatic_vpn_policy: AutomaticVpnPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct ServerList {
    #[serde(rename = "HostEntry")]
    entries: Vec<HostEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct HostEntry {
    host_name: String,
    host_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct AutomaticVpnPolicy {
    always_on: bool,
    trusted_https_server_list: TrustedHttpsServerList,
    allowed_hosts: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
struct TrustedHttpsServerList {
    #[serde(rename = "TrustedHttpsServer")]
    servers: Vec<TrustedHttpsServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct TrustedHttpsServer {
    address: String,
    port: u16,
    certificate_hash: String,
}

impl Profile {
    pub fn parse(xml: &str) -> Result<Self, ProfileError> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load the profile from `path`, degrading to an empty profile with
    /// an error log when the file is missing or malformed.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(profile) => profile,
            Err(e) => {
                error!(error = %e, "Could not read XML profile");
                Profile::default()
            }
        }
    }

    /// Always-on policy flag.
    pub fn always_on(&self) -> bool {
        self.automatic_vpn_policy.always_on
    }

    /// VPN server addresses in allowlist form.
    pub fn vpn_servers(&self) -> Vec<String> {
        self.server_list
            .entries
            .iter()
            .filter(|e| !e.host_address.is_empty())
            .map(|e| e.host_address.clone())
            .collect()
    }

    /// VPN server display names for the status, falling back to the
    /// address when no display name is set.
    pub fn vpn_server_host_names(&self) -> Vec<String> {
        self.server_list
            .entries
            .iter()
            .map(|e| {
                if e.host_name.is_empty() {
                    e.host_address.clone()
                } else {
                    e.host_name.clone()
                }
            })
            .filter(|n| !n.is_empty())
            .collect()
    }

    /// Trusted HTTPS probe servers as (url, expected certificate hash).
    pub fn tnd_https_servers(&self) -> Vec<(String, String)> {
        self.automatic_vpn_policy
            .trusted_https_server_list
            .servers
            .iter()
            .filter(|s| !s.address.is_empty())
            .map(|s| {
                let port = if s.port == 0 { 443 } else { s.port };
                (
                    format!("https://{}:{}", s.address, port),
                    s.certificate_hash.clone(),
                )
            })
            .collect()
    }

    /// Trusted HTTPS probe server names, used in the allowlist.
    pub fn tnd_server_names(&self) -> Vec<String> {
        self.automatic_vpn_policy
            .trusted_https_server_list
            .servers
            .iter()
            .filter(|s| !s.address.is_empty())
            .map(|s| s.address.clone())
            .collect()
    }

    /// Additional allowed hosts declared in the profile.
    pub fn allowed_hosts(&self) -> Vec<String> {
        self.automatic_vpn_policy
            .allowed_hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PROFILE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<AnyConnectProfile>
    <ServerList>
        <HostEntry>
            <HostName>Example VPN</HostName>
            <HostAddress>vpn.example.com</HostAddress>
        </HostEntry>
        <HostEntry>
            <HostName></HostName>
            <HostAddress>vpn2.example.com</HostAddress>
        </HostEntry>
    </ServerList>
    <AutomaticVPNPolicy>
        <AlwaysOn>true</AlwaysOn>
        <TrustedHttpsServerList>
            <TrustedHttpsServer>
                <Address>tnd.example.com</Address>
                <Port>443</Port>
                <CertificateHash>AABBCCDD</CertificateHash>
            </TrustedHttpsServer>
        </TrustedHttpsServerList>
        <AllowedHosts>allowed1.example.com, allowed2.example.com</AllowedHosts>
    </AutomaticVPNPolicy>
</AnyConnectProfile>"#;

    #[test]
    fn test_parse_profile() {
        let profile = Profile::parse(TEST_PROFILE).unwrap();
        assert!(profile.always_on());
        assert_eq!(
            profile.vpn_servers(),
            vec!["vpn.example.com", "vpn2.example.com"]
        );
        assert_eq!(
            profile.vpn_server_host_names(),
            vec!["Example VPN", "vpn2.example.com"]
        );
    }

    #[test]
    fn test_tnd_servers() {
        let profile = Profile::parse(TEST_PROFILE).unwrap();
        assert_eq!(
            profile.tnd_https_servers(),
            vec![(
                "https://tnd.example.com:443".to_string(),
                "AABBCCDD".to_string()
            )]
        );
        assert_eq!(profile.tnd_server_names(), vec!["tnd.example.com"]);
    }

    #[test]
    fn test_allowed_hosts() {
        let profile = Profile::parse(TEST_PROFILE).unwrap();
        assert_eq!(
            profile.allowed_hosts(),
            vec!["allowed1.example.com", "allowed2.example.com"]
        );
    }

    #[test]
    fn test_empty_profile() {
        let profile = Profile::default();
        assert!(!profile.always_on());
        assert!(profile.vpn_servers().is_empty());
        assert!(profile.vpn_server_host_names().is_empty());
        assert!(profile.tnd_https_servers().is_empty());
        assert!(profile.allowed_hosts().is_empty());
    }

    #[test]
    fn test_tnd_default_port() {
        let xml = r#"<AnyConnectProfile>
            <AutomaticVPNPolicy>
                <TrustedHttpsServerList>
                    <TrustedHttpsServer>
                        <Address>tnd.example.com</Address>
                        <CertificateHash>AABB</CertificateHash>
                    </TrustedHttpsServer>
                </TrustedHttpsServerList>
            </AutomaticVPNPolicy>
        </AnyConnectProfile>"#;
        let profile = Profile::parse(xml).unwrap();
        assert_eq!(
            profile.tnd_https_servers()[0].0,
            "https://tnd.example.com:443"
        );
    }

    #[test]
    fn test_load_or_empty_missing_file() {
        let profile = Profile::load_or_empty(Path::new("/nonexistent/profile.xml"));
        assert_eq!(profile, Profile::default());
    }

    #[test]
    fn test_load_or_empty_malformed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("profile.xml");
        std::fs::write(&path, "<AnyConnectProfile><broken").unwrap();
        let profile = Profile::load_or_empty(&path);
        assert_eq!(profile, Profile::default());
    }
}
