//! Split routing for an active tunnel.
//!
//! Routes everything through the tunnel device via a dedicated routing
//! table and selects it with an ip rule. Excluded destinations get
//! `throw` routes so lookup falls through to the main table. Excludes
//! come from the VPN config, the VPN gateway itself and DNS reports for
//! watched domains.

use crate::dnsproxy::Report;
use crate::vpnconfig::VpnConfig;
use std::collections::HashSet;
use std::net::{IpAddr, ToSocketAddrs};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

/// Firewall mark carried by traffic that must escape the always-on
/// firewall (TND probes, excluded traffic).
pub const FWMARK: u32 = 59109;
/// Routing table holding the tunnel routes.
pub const ROUTE_TABLE: &str = "42111";
/// Priority of the routing rule selecting the tunnel table.
const RULE_PRIORITY: &str = "2111";

#[derive(Error, Debug)]
pub enum SplitRtError {
    #[error("ip command failed: {0}")]
    Command(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn run_ip(args: &[&str]) -> Result<(), SplitRtError> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SplitRtError::Command(format!(
            "ip {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Split routing instance, alive while the tunnel is up.
pub struct SplitRouting {
    excludes: HashSet<String>,
}

impl SplitRouting {
    /// Install split routing for the given tunnel config.
    pub fn start(config: &VpnConfig) -> Result<Self, SplitRtError> {
        let device = config.device.name.as_str();

        run_ip(&["-4", "rule", "add", "pref", RULE_PRIORITY, "table", ROUTE_TABLE])?;
        run_ip(&["-4", "route", "add", "default", "dev", device, "table", ROUTE_TABLE])?;
        if config.ipv6.is_some() {
            run_ip(&["-6", "rule", "add", "pref", RULE_PRIORITY, "table", ROUTE_TABLE])?;
            run_ip(&["-6", "route", "add", "default", "dev", device, "table", ROUTE_TABLE])?;
        }

        let mut routing = Self {
            excludes: HashSet::new(),
        };

        for net in &config.split.exclude_networks {
            routing.exclude_net(net);
        }
        // The tunnel transport itself must bypass the tunnel
        for addr in resolve_host(&config.gateway) {
            routing.exclude_address(addr);
        }

        Ok(routing)
    }

    fn exclude_net(&mut self, net: &str) {
        if !self.excludes.insert(net.to_string()) {
            return;
        }
        let family = if net.contains(':') { "-6" } else { "-4" };
        if let Err(e) = run_ip(&[family, "route", "add", "throw", net, "table", ROUTE_TABLE]) {
            warn!(error = %e, net, "Could not add exclude route");
        }
    }

    pub fn exclude_address(&mut self, addr: IpAddr) {
        self.exclude_net(&host_net(addr));
    }

    /// Follow a DNS report for a watched domain: its addresses bypass
    /// the tunnel.
    pub fn handle_dns_report(&mut self, report: &Report) {
        debug!(name = %report.name, address = %report.address, "Split routing excluding watched address");
        self.exclude_address(report.address);
    }

    /// Remove split routing.
    pub fn stop(self) {
        cleanup();
    }
}

/// Remove rule and table leftovers, also used for crash recovery.
pub fn cleanup() {
    for family in ["-4", "-6"] {
        let _ = Command::new("ip")
            .args([family, "rule", "del", "pref", RULE_PRIORITY])
            .output();
        let _ = Command::new("ip")
            .args([family, "route", "flush", "table", ROUTE_TABLE])
            .output();
    }
}

fn host_net(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(a) => format!("{}/32", a),
        IpAddr::V6(a) => format!("{}/128", a),
    }
}

fn resolve_host(host: &str) -> Vec<IpAddr> {
    if host.is_empty() {
        return Vec::new();
    }
    if let Ok(addr) = host.parse::<IpAddr>() {
        return vec![addr];
    }
    match (host, 0).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            warn!(error = %e, host, "Could not resolve VPN gateway for exclude route");
            Vec::new()
        }
    }
}
