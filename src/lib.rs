//! octun - enterprise TLS VPN tunnel daemon for Linux

pub mod api;
pub mod config;
pub mod daemon;
pub mod dbus;
pub mod device;
pub mod dnsproxy;
pub mod logininfo;
pub mod ocrunner;
pub mod profile;
pub mod profilemon;
pub mod sleepmon;
pub mod splitrt;
pub mod status;
pub mod tnd;
pub mod token;
pub mod trafpol;
pub mod vpnconfig;

pub use config::Config;
pub use daemon::Daemon;
