//! Login info passed with a desktop-bus connect request.

use serde::{Deserialize, Serialize};

/// Login information for a single VPN session, obtained by the
/// unprivileged client during out-of-band authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub cookie: String,
    pub host: String,
    pub connect_url: String,
    pub fingerprint: String,
    pub resolve: String,
}

impl LoginInfo {
    /// A login is usable if it carries at least a cookie and a host.
    pub fn valid(&self) -> bool {
        !self.cookie.is_empty() && !self.host.is_empty()
    }

    /// Server address the transport should connect to.
    pub fn server(&self) -> &str {
        if self.connect_url.is_empty() {
            &self.host
        } else {
            &self.connect_url
        }
    }
}
