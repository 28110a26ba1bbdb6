//! Tunnel device and host resolver configuration.

use crate::vpnconfig::VpnConfig;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No tunnel device in VPN config")]
    NoDevice,
    #[error("ip command failed: {0}")]
    Command(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn run_ip(args: &[&str]) -> Result<(), DeviceError> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeviceError::Command(format!(
            "ip {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Configure the tunnel device from the VPN config: mtu, addresses, up.
pub fn setup(config: &VpnConfig) -> Result<(), DeviceError> {
    let name = config.device.name.as_str();
    if name.is_empty() {
        return Err(DeviceError::NoDevice);
    }

    if config.device.mtu > 0 {
        run_ip(&["link", "set", name, "mtu", &config.device.mtu.to_string()])?;
    }
    run_ip(&["link", "set", name, "up"])?;

    if let Some(v4) = &config.ipv4 {
        let addr = format!("{}/{}", v4.address, v4.prefix);
        run_ip(&["addr", "add", &addr, "dev", name])?;
    }
    if let Some(v6) = &config.ipv6 {
        let addr = format!("{}/{}", v6.address, v6.prefix);
        run_ip(&["-6", "addr", "add", &addr, "dev", name])?;
    }

    Ok(())
}

/// Deconfigure the tunnel device, best effort.
pub fn teardown(config: &VpnConfig) {
    let name = config.device.name.as_str();
    if name.is_empty() {
        return;
    }
    cleanup(name);
}

/// Remove leftover device state, also used for crash recovery.
pub fn cleanup(name: &str) {
    let _ = Command::new("ip").args(["addr", "flush", "dev", name]).output();
    let _ = Command::new("ip").args(["link", "set", name, "down"]).output();
}

/// Point the host resolver for the tunnel device at the DNS proxy.
pub fn set_vpn_dns(config: &VpnConfig, dns_listen: &str) {
    let name = config.device.name.as_str();
    if name.is_empty() {
        return;
    }
    for args in [
        vec!["dns", name, dns_listen],
        vec!["domain", name, "~."],
        vec!["default-route", name, "true"],
    ] {
        if let Err(e) = Command::new("resolvectl").args(&args).output() {
            debug!(error = %e, "resolvectl failed");
        }
    }
}

/// Restore the host resolver configuration of the tunnel device.
pub fn unset_vpn_dns(config: &VpnConfig) {
    let name = config.device.name.as_str();
    if name.is_empty() {
        return;
    }
    if let Err(e) = Command::new("resolvectl").args(["revert", name]).output() {
        debug!(error = %e, "resolvectl revert failed");
    }
}
