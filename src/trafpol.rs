//! Always-on traffic policy firewall.
//!
//! While active, all outbound traffic is dropped except loopback,
//! DHCP, traffic carrying the split-routing firewall mark and traffic
//! to the allowlist derived from the profile: VPN servers, trusted
//! HTTPS probe servers, captive portal detection hosts and explicitly
//! allowed hosts.

use crate::splitrt::FWMARK;
use std::collections::BTreeSet;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Captive portal detection servers used by common browsers and
/// desktops, always allowed so portal logins work without the tunnel.
pub const CPD_SERVERS: [&str; 5] = [
    "connectivity-check.ubuntu.com", // ubuntu
    "detectportal.firefox.com",      // firefox
    "www.gstatic.com",               // chrome
    "clients3.google.com",           // chromium
    "nmcheck.gnome.org",             // gnome
];

const NFT_TABLE: &str = "octun";

#[derive(Error, Debug)]
pub enum TrafPolError {
    #[error("nft command failed: {0}")]
    Command(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Traffic policy instance, alive while always-on is enforced.
pub struct TrafPol {
    _private: (),
}

impl TrafPol {
    /// Install the firewall allowing only the given hosts.
    pub fn start(allowed_hosts: &[String]) -> Result<Self, TrafPolError> {
        let (v4, v6) = resolve_allowed(allowed_hosts);
        let ruleset = build_ruleset(&v4, &v6);
        apply_ruleset(&ruleset)?;
        Ok(Self { _private: () })
    }

    /// Remove the firewall.
    pub fn stop(self) {
        cleanup();
    }
}

/// Delete the firewall table, also used for crash recovery.
pub fn cleanup() {
    let _ = Command::new("nft")
        .args(["delete", "table", "inet", NFT_TABLE])
        .output();
}

/// Resolve allowlist hostnames to addresses. Entries that are already
/// addresses are taken as-is; unresolvable names are skipped.
fn resolve_allowed(hosts: &[String]) -> (BTreeSet<Ipv4Addr>, BTreeSet<Ipv6Addr>) {
    let mut v4 = BTreeSet::new();
    let mut v6 = BTreeSet::new();
    let mut insert = |addr: IpAddr| match addr {
        IpAddr::V4(a) => {
            v4.insert(a);
        }
        IpAddr::V6(a) => {
            v6.insert(a);
        }
    };

    for host in hosts {
        if let Ok(addr) = host.parse::<IpAddr>() {
            insert(addr);
            continue;
        }
        match (host.as_str(), 443).to_socket_addrs() {
            Ok(addrs) => {
                for addr in addrs {
                    insert(addr.ip());
                }
            }
            Err(e) => debug!(error = %e, host, "Could not resolve allowed host"),
        }
    }
    (v4, v6)
}

fn build_ruleset(v4: &BTreeSet<Ipv4Addr>, v6: &BTreeSet<Ipv6Addr>) -> String {
    let mut rules = String::new();
    rules.push_str(&format!("add table inet {}\n", NFT_TABLE));
    rules.push_str(&format!(
        "add chain inet {} output {{ type filter hook output priority 0 ; policy drop ; }}\n",
        NFT_TABLE
    ));
    rules.push_str(&format!("add rule inet {} output oifname \"lo\" accept\n", NFT_TABLE));
    rules.push_str(&format!(
        "add rule inet {} output meta mark {} accept\n",
        NFT_TABLE, FWMARK
    ));
    rules.push_str(&format!(
        "add rule inet {} output ct state established,related accept\n",
        NFT_TABLE
    ));
    rules.push_str(&format!(
        "add rule inet {} output udp dport {{ 67, 68, 546, 547 }} accept\n",
        NFT_TABLE
    ));
    if !v4.is_empty() {
        let addrs: Vec<String> = v4.iter().map(|a| a.to_string()).collect();
        rules.push_str(&format!(
            "add rule inet {} output ip daddr {{ {} }} accept\n",
            NFT_TABLE,
            addrs.join(", ")
        ));
    }
    if !v6.is_empty() {
        let addrs: Vec<String> = v6.iter().map(|a| a.to_string()).collect();
        rules.push_str(&format!(
            "add rule inet {} output ip6 daddr {{ {} }} accept\n",
            NFT_TABLE,
            addrs.join(", ")
        ));
    }
    rules.push_str(&format!(
        "add chain inet {} input {{ type filter hook input priority 0 ; policy drop ; }}\n",
        NFT_TABLE
    ));
    rules.push_str(&format!("add rule inet {} input iifname \"lo\" accept\n", NFT_TABLE));
    rules.push_str(&format!(
        "add rule inet {} input ct state established,related accept\n",
        NFT_TABLE
    ));
    rules.push_str(&format!(
        "add rule inet {} input udp dport {{ 68, 546 }} accept\n",
        NFT_TABLE
    ));
    rules
}

fn apply_ruleset(rules: &str) -> Result<(), TrafPolError> {
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(rules.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TrafPolError::Command(stderr.trim().to_string()));
    }
    Ok(())
}
