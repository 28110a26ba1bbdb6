//! Daemon configuration handling.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config file location.
pub const SYSTEM_CONFIG: &str = "/var/lib/octun/octund.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Control socket path
    pub socket_file: PathBuf,
    /// Enterprise XML profile path, watched for modification
    pub xml_profile: PathBuf,
    pub transport: TransportConfig,
    pub dns: DnsConfig,
}

/// External VPN transport process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport binary
    pub binary: PathBuf,
    /// Script the transport runs to report tunnel configuration
    pub script: PathBuf,
    /// Tunnel device name
    pub device: String,
    /// PID file used for crash-leftover cleanup
    pub pid_file: PathBuf,
}

/// DNS proxy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS proxy listen address
    pub listen: String,
    /// Default system resolver used while no tunnel is up
    pub default_server: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_file: PathBuf::from("/run/oc-daemon/daemon.sock"),
            xml_profile: PathBuf::from("/var/lib/octun/profile.xml"),
            transport: TransportConfig {
                binary: PathBuf::from("openconnect"),
                script: PathBuf::from("/usr/lib/octun/octun-script"),
                device: "octun0".to_string(),
                pid_file: PathBuf::from("/run/oc-daemon/transport.pid"),
            },
            dns: DnsConfig {
                listen: "127.0.0.1:4253".to_string(),
                default_server: "127.0.0.53:53".to_string(),
            },
        }
    }
}

/// Expand environment variables of the form `$VAR` or `${VAR}`; unset
/// variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(braced) = rest.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    out.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
                    rest = &braced[end + 1..];
                }
                None => {
                    // unterminated brace, keep literally
                    out.push_str("${");
                    rest = braced;
                }
            }
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            if end == 0 {
                out.push('$');
            } else {
                out.push_str(&std::env::var(&rest[..end]).unwrap_or_default());
                rest = &rest[end..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand tilde and environment variables in a path.
///
/// Tilde handling is limited: it only works for paths beginning with `~`.
fn expand_path(path: &Path) -> PathBuf {
    let path = path.to_string_lossy();
    let path = match path.strip_prefix('~') {
        Some(rest) => format!("$HOME{}", rest),
        None => path.into_owned(),
    };
    PathBuf::from(expand_env(&path))
}

impl Config {
    /// Expand tilde and environment variables in the path fields.
    fn expand(&mut self) {
        self.socket_file = expand_path(&self.socket_file);
        self.xml_profile = expand_path(&self.xml_profile);
        self.transport.binary = expand_path(&self.transport.binary);
        self.transport.script = expand_path(&self.transport.script);
        self.transport.pid_file = expand_path(&self.transport.pid_file);
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.expand();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the config from `path`, falling back to defaults if the file
    /// does not exist. A present but malformed file is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.socket_file,
            PathBuf::from("/run/oc-daemon/daemon.sock")
        );
        assert_eq!(config.transport.device, "octun0");
        assert_eq!(config.dns.listen, "127.0.0.1:4253");
        assert_eq!(config.dns.default_server, "127.0.0.53:53");
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("octund.toml");

        let config = Config::default();
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_custom_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("custom.toml");

        let config = Config {
            socket_file: PathBuf::from("/tmp/test.sock"),
            xml_profile: PathBuf::from("/tmp/profile.xml"),
            transport: TransportConfig {
                binary: PathBuf::from("/usr/bin/openconnect"),
                script: PathBuf::from("/tmp/script"),
                device: "tun9".to_string(),
                pid_file: PathBuf::from("/tmp/transport.pid"),
            },
            dns: DnsConfig {
                listen: "127.0.0.1:5353".to_string(),
                default_server: "127.0.0.53:53".to_string(),
            },
        };
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.transport.device, "tun9");
        assert_eq!(loaded.dns.listen, "127.0.0.1:5353");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/octund.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");

        std::fs::write(&config_path, "this is not valid toml {{{{").unwrap();

        assert!(Config::load(&config_path).is_err());
        assert!(Config::load_or_default(&config_path).is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("OCTUN_TEST_RUN_DIR", "/run/octun-test");

        assert_eq!(
            expand_env("$OCTUN_TEST_RUN_DIR/daemon.sock"),
            "/run/octun-test/daemon.sock"
        );
        assert_eq!(
            expand_env("${OCTUN_TEST_RUN_DIR}/daemon.sock"),
            "/run/octun-test/daemon.sock"
        );
        // unset variables expand to the empty string
        assert_eq!(expand_env("$OCTUN_TEST_UNSET_VAR/x"), "/x");
        // no variables: unchanged
        assert_eq!(expand_env("/run/daemon.sock"), "/run/daemon.sock");
        // lone dollar and unterminated brace stay literal
        assert_eq!(expand_env("a$"), "a$");
        assert_eq!(expand_env("a${b"), "a${b");
    }

    #[test]
    fn test_expand_path_tilde() {
        std::env::set_var("HOME", "/home/octun-test");

        assert_eq!(
            expand_path(Path::new("~/octun/profile.xml")),
            PathBuf::from("/home/octun-test/octun/profile.xml")
        );
        assert_eq!(expand_path(Path::new("~")), PathBuf::from("/home/octun-test"));
        // tilde not at the start stays literal
        assert_eq!(
            expand_path(Path::new("/tmp/~profile.xml")),
            PathBuf::from("/tmp/~profile.xml")
        );
    }

    #[test]
    fn test_load_expands_paths() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("expand.toml");

        std::env::set_var("HOME", "/home/octun-test");
        std::env::set_var("OCTUN_TEST_STATE_DIR", "/var/lib/octun-test");

        std::fs::write(
            &config_path,
            r#"socket_file = "$OCTUN_TEST_STATE_DIR/daemon.sock"
xml_profile = "~/profile.xml"

[transport]
binary = "openconnect"
script = "${OCTUN_TEST_STATE_DIR}/script"
device = "octun0"
pid_file = "~/transport.pid"

[dns]
listen = "127.0.0.1:4253"
default_server = "127.0.0.53:53"
"#,
        )
        .unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(
            loaded.socket_file,
            PathBuf::from("/var/lib/octun-test/daemon.sock")
        );
        assert_eq!(
            loaded.xml_profile,
            PathBuf::from("/home/octun-test/profile.xml")
        );
        assert_eq!(
            loaded.transport.script,
            PathBuf::from("/var/lib/octun-test/script")
        );
        assert_eq!(
            loaded.transport.pid_file,
            PathBuf::from("/home/octun-test/transport.pid")
        );
        assert_eq!(loaded.transport.binary, PathBuf::from("openconnect"));
    }
}
