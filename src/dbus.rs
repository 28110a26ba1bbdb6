//! Desktop bus control surface.
//!
//! Owns the well-known name `com.example.octun` on the system bus and
//! exports Connect/Disconnect methods plus read-only properties
//! mirroring the daemon status. Method calls are translated into core
//! intents and acknowledged once accepted; property updates flow from
//! the daemon loop over a channel and are published with
//! PropertiesChanged signals.

use crate::logininfo::LoginInfo;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "com.example.octun";
pub const OBJECT_PATH: &str = "/com/example/octun";

#[derive(Error, Debug)]
pub enum DBusError {
    #[error("D-Bus error: {0}")]
    Zbus(#[from] zbus::Error),
}

/// Requests from bus clients to the daemon loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DbusRequest {
    Connect(LoginInfo),
    Disconnect,
}

/// Property updates from the daemon loop to the bus mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    TrustedNetwork(String),
    ConnectionState(String),
    OcRunning(String),
    Ip(String),
    Device(String),
    ConnectedAt(i64),
    Servers(Vec<String>),
    VpnConfig(String),
}

/// Mirrored status values exported as bus properties.
#[derive(Debug, Clone, Default)]
struct Mirror {
    trusted_network: String,
    connection_state: String,
    oc_running: String,
    ip: String,
    device: String,
    connected_at: i64,
    servers: Vec<String>,
    vpn_config: String,
}

struct DaemonInterface {
    requests: mpsc::Sender<DbusRequest>,
    mirror: Mirror,
}

#[interface(name = "com.example.octun.Daemon")]
impl DaemonInterface {
    /// Request a VPN connect with login info from out-of-band
    /// authentication. Acknowledged when accepted, not when connected.
    async fn connect(
        &self,
        cookie: String,
        host: String,
        connect_url: String,
        fingerprint: String,
        resolve: String,
    ) -> fdo::Result<()> {
        debug!("D-Bus connect request");
        let login = LoginInfo {
            cookie,
            host,
            connect_url,
            fingerprint,
            resolve,
        };
        self.requests
            .send(DbusRequest::Connect(login))
            .await
            .map_err(|_| fdo::Error::Failed("daemon is shutting down".to_string()))
    }

    /// Request a VPN disconnect.
    async fn disconnect(&self) -> fdo::Result<()> {
        debug!("D-Bus disconnect request");
        self.requests
            .send(DbusRequest::Disconnect)
            .await
            .map_err(|_| fdo::Error::Failed("daemon is shutting down".to_string()))
    }

    #[zbus(property)]
    fn trusted_network(&self) -> String {
        self.mirror.trusted_network.clone()
    }

    #[zbus(property)]
    fn connection_state(&self) -> String {
        self.mirror.connection_state.clone()
    }

    #[zbus(property)]
    fn oc_running(&self) -> String {
        self.mirror.oc_running.clone()
    }

    #[zbus(property)]
    fn ip(&self) -> String {
        self.mirror.ip.clone()
    }

    #[zbus(property)]
    fn device(&self) -> String {
        self.mirror.device.clone()
    }

    #[zbus(property)]
    fn connected_at(&self) -> i64 {
        self.mirror.connected_at
    }

    #[zbus(property)]
    fn servers(&self) -> Vec<String> {
        self.mirror.servers.clone()
    }

    /// Active VPN config as JSON, empty when no tunnel is up.
    #[zbus(property)]
    fn vpn_config(&self) -> String {
        self.mirror.vpn_config.clone()
    }
}

/// Desktop bus service handle.
pub struct Service {
    conn: zbus::Connection,
    handle: JoinHandle<()>,
}

impl Service {
    /// Acquire the bus name and start serving. Name acquisition failure
    /// is fatal to daemon start.
    ///
    /// Property updates sent by the daemon loop on `updates_rx` are
    /// applied to the mirror and published as PropertiesChanged.
    pub async fn start(
        requests_tx: mpsc::Sender<DbusRequest>,
        updates_rx: mpsc::UnboundedReceiver<Property>,
    ) -> Result<Self, DBusError> {
        let iface = DaemonInterface {
            requests: requests_tx,
            mirror: Mirror::default(),
        };

        let conn = zbus::connection::Builder::system()?
            .name(BUS_NAME)?
            .serve_at(OBJECT_PATH, iface)?
            .build()
            .await?;

        let handle = tokio::spawn(mirror_task(conn.clone(), updates_rx));

        Ok(Self { conn, handle })
    }

    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.conn.release_name(BUS_NAME).await;
    }
}

async fn mirror_task(conn: zbus::Connection, mut updates_rx: mpsc::UnboundedReceiver<Property>) {
    while let Some(update) = updates_rx.recv().await {
        if let Err(e) = apply_update(&conn, update).await {
            error!(error = %e, "Failed to publish property update");
        }
    }
}

async fn apply_update(conn: &zbus::Connection, update: Property) -> zbus::Result<()> {
    let iface_ref = conn
        .object_server()
        .interface::<_, DaemonInterface>(OBJECT_PATH)
        .await?;
    let mut iface = iface_ref.get_mut().await;
    let emitter = iface_ref.signal_emitter();

    match update {
        Property::TrustedNetwork(v) => {
            iface.mirror.trusted_network = v;
            iface.trusted_network_changed(emitter).await?;
        }
        Property::ConnectionState(v) => {
            iface.mirror.connection_state = v;
            iface.connection_state_changed(emitter).await?;
        }
        Property::OcRunning(v) => {
            iface.mirror.oc_running = v;
            iface.oc_running_changed(emitter).await?;
        }
        Property::Ip(v) => {
            iface.mirror.ip = v;
            iface.ip_changed(emitter).await?;
        }
        Property::Device(v) => {
            iface.mirror.device = v;
            iface.device_changed(emitter).await?;
        }
        Property::ConnectedAt(v) => {
            iface.mirror.connected_at = v;
            iface.connected_at_changed(emitter).await?;
        }
        Property::Servers(v) => {
            iface.mirror.servers = v;
            iface.servers_changed(emitter).await?;
        }
        Property::VpnConfig(v) => {
            iface.mirror.vpn_config = v;
            iface.vpn_config_changed(emitter).await?;
        }
    }

    Ok(())
}
