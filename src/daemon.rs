//! The daemon core.
//!
//! One reconciliation loop consumes events from all adapters (control
//! socket, desktop bus, DNS proxy, trusted network detection, transport
//! lifecycle, suspend/resume, profile changes) and drives the policy
//! subsystems so host network state always matches the current policy.
//! Status is mutated only here; adapters communicate exclusively over
//! channels owned by the loop.

use crate::api;
use crate::config::Config;
use crate::dbus::{DbusRequest, Property, Service};
use crate::device;
use crate::dnsproxy::{DnsProxy, DnsProxyError, Report};
use crate::logininfo::LoginInfo;
use crate::ocrunner::{self, ConnectEvent, Runner};
use crate::profile::Profile;
use crate::profilemon::ProfileMon;
use crate::sleepmon::{SleepMon, SleepMonError};
use crate::splitrt::{self, SplitRouting, FWMARK};
use crate::status::{ConnectionState, OcRunning, Status, TrustedNetwork};
use crate::tnd::{Tnd, TndServer};
use crate::token::{Token, TokenError};
use crate::trafpol::{self, TrafPol, CPD_SERVERS};
use crate::vpnconfig::{ConfigUpdate, VpnConfig, REASON_DISCONNECT};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

const CHANNEL_SIZE: usize = 16;

/// Environment variable carrying the run token to the transport.
const TOKEN_ENV: &str = "oc_daemon_token";

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Token error: {0}")]
    Token(#[from] TokenError),
    #[error("Sleep monitor error: {0}")]
    SleepMon(#[from] SleepMonError),
    #[error("DNS proxy error: {0}")]
    DnsProxy(#[from] DnsProxyError),
    #[error("Control socket error: {0}")]
    Api(#[from] api::ApiError),
    #[error("D-Bus error: {0}")]
    DBus(#[from] crate::dbus::DBusError),
}

/// Loop-owned daemon state. Handlers take it by exclusive reference;
/// nothing outside the loop mutates it.
struct DaemonState {
    config: Config,
    status: Status,
    token: Token,
    profile: Profile,
    props_tx: mpsc::UnboundedSender<Property>,
    dns: DnsProxy,
    runner: Runner,
    tnd: Option<Tnd>,
    trafpol: Option<TrafPol>,
    splitrt: Option<SplitRouting>,
    tnd_tx: mpsc::Sender<bool>,
    /// Set from the active VPN config; overrides other traffic
    /// policing settings
    disable_trafpol: bool,
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl DaemonState {
    fn emit(&self, property: Property) {
        let _ = self.props_tx.send(property);
    }

    fn set_status_trusted_network(&mut self, trusted: bool) {
        let trusted_network = if trusted {
            TrustedNetwork::Trusted
        } else {
            TrustedNetwork::NotTrusted
        };
        if self.status.trusted_network == trusted_network {
            return;
        }
        self.status.trusted_network = trusted_network;
        self.emit(Property::TrustedNetwork(trusted_network.to_string()));
    }

    fn set_status_connection_state(&mut self, connection_state: ConnectionState) {
        if self.status.connection_state == connection_state {
            return;
        }
        self.status.connection_state = connection_state;
        self.emit(Property::ConnectionState(connection_state.to_string()));
    }

    fn set_status_ip(&mut self, ip: String) {
        if self.status.ip == ip {
            return;
        }
        self.emit(Property::Ip(ip.clone()));
        self.status.ip = ip;
    }

    fn set_status_device(&mut self, device: String) {
        if self.status.device == device {
            return;
        }
        self.emit(Property::Device(device.clone()));
        self.status.device = device;
    }

    fn set_status_connected_at(&mut self, connected_at: i64) {
        if self.status.connected_at == connected_at {
            return;
        }
        self.status.connected_at = connected_at;
        self.emit(Property::ConnectedAt(connected_at));
    }

    fn set_status_servers(&mut self, servers: Vec<String>) {
        if self.status.servers == servers {
            return;
        }
        self.emit(Property::Servers(servers.clone()));
        self.status.servers = servers;
    }

    fn set_status_oc_running(&mut self, running: bool) {
        let oc_running = if running {
            OcRunning::Running
        } else {
            OcRunning::NotRunning
        };
        if self.status.oc_running == oc_running {
            return;
        }
        self.status.oc_running = oc_running;
        self.emit(Property::OcRunning(oc_running.to_string()));
    }

    fn set_status_vpn_config(&mut self, config: Option<VpnConfig>) {
        if self.status.vpn_config == config {
            return;
        }
        self.status.vpn_config = config;

        match &self.status.vpn_config {
            None => self.emit(Property::VpnConfig(String::new())),
            Some(config) => match serde_json::to_string(config) {
                Ok(json) => self.emit(Property::VpnConfig(json)),
                Err(e) => {
                    error!(error = %e, "Daemon could not encode VPN config for publication")
                }
            },
        }
    }

    /// Connect the VPN using login info from a client request.
    fn connect_vpn(&mut self, login: &LoginInfo) {
        // allow only one connection
        if self.status.oc_running.running() {
            debug!("Daemon ignoring connect, transport already running");
            return;
        }
        if !login.valid() {
            debug!("Daemon ignoring connect with invalid login info");
            return;
        }

        self.set_status_oc_running(true);
        self.set_status_connection_state(ConnectionState::Connecting);

        let env = [(TOKEN_ENV.to_string(), self.token.as_str().to_string())];
        self.runner.connect(login, &env);
    }

    /// Disconnect the VPN.
    fn disconnect_vpn(&mut self) {
        self.set_status_connection_state(ConnectionState::Disconnecting);
        self.set_status_oc_running(false);
        self.runner.disconnect();
    }

    fn setup_routing(&mut self, config: &VpnConfig) {
        if self.splitrt.is_some() {
            return;
        }
        match SplitRouting::start(config) {
            Ok(splitrt) => self.splitrt = Some(splitrt),
            Err(e) => error!(error = %e, "Daemon could not set up split routing"),
        }
    }

    fn teardown_routing(&mut self) {
        if let Some(splitrt) = self.splitrt.take() {
            splitrt.stop();
        }
    }

    fn setup_dns(&mut self, config: &VpnConfig) {
        self.dns.set_remotes(config.dns.remotes.clone());
        let excludes = &config.split.exclude_dns;
        debug!(?excludes, "Daemon setting DNS split excludes");
        self.dns.set_watches(excludes);
        device::set_vpn_dns(config, &self.config.dns.listen);
    }

    fn teardown_dns(&mut self) {
        let mut remotes = BTreeMap::new();
        remotes.insert(
            ".".to_string(),
            vec![self.config.dns.default_server.clone()],
        );
        self.dns.set_remotes(remotes);
        self.dns.set_watches(&[]);
        if let Some(config) = &self.status.vpn_config {
            device::unset_vpn_dns(config);
        }
    }

    /// Handle a config update for VPN connect.
    fn update_vpn_config_up(&mut self, config: VpnConfig) {
        if Some(&config) == self.status.vpn_config.as_ref() {
            error!("Daemon config up error: old and new vpn configs are equal");
            return;
        }
        if !self.status.oc_running.running() {
            error!("Daemon config up error: vpn not running");
            return;
        }
        if self.status.connection_state.connected() {
            error!("Daemon config up error: vpn already connected");
            return;
        }

        info!("Daemon setting up vpn configuration");
        if let Err(e) = device::setup(&config) {
            error!(error = %e, "Daemon could not set up vpn device");
        }
        self.setup_routing(&config);
        self.setup_dns(&config);

        // the active config may opt out of always-on enforcement
        self.disable_trafpol = config.flags.disable_always_on_vpn;

        let ip = config.ip();
        let device_name = config.device.name.clone();
        self.set_status_vpn_config(Some(config));
        self.set_status_connection_state(ConnectionState::Connected);
        self.set_status_connected_at(now_epoch());
        self.set_status_ip(ip);
        self.set_status_device(device_name);
    }

    /// Handle a config update for VPN disconnect.
    fn update_vpn_config_down(&mut self) {
        if self.status.oc_running.running() {
            error!("Daemon config down error: vpn still running");
            return;
        }
        if self.status.connection_state.connected() {
            error!("Daemon config down error: vpn still connected");
            return;
        }

        info!("Daemon tearing down vpn configuration");
        if self.status.vpn_config.is_some() {
            if let Some(config) = self.status.vpn_config.clone() {
                device::teardown(&config);
            }
            self.teardown_routing();
            self.teardown_dns();
        }

        self.set_status_vpn_config(None);
        self.set_status_connection_state(ConnectionState::Disconnected);
        self.set_status_connected_at(0);
        self.set_status_ip(String::new());
        self.set_status_device(String::new());
    }

    /// Handle a control socket request carrying a VPN config update.
    fn handle_client_request(&mut self, request: api::Request) {
        debug!("Daemon handling client request");

        if request.typ() != api::TYPE_CONFIG_UPDATE {
            request.reply_error("invalid request type");
            return;
        }

        let update = match ConfigUpdate::from_json(request.data()) {
            Ok(update) => update,
            Err(e) => {
                error!(error = %e, "Daemon could not parse config update from JSON");
                request.reply_error("invalid config update message");
                return;
            }
        };

        if !update.valid() {
            error!("Daemon got invalid vpn config update");
            request.reply_error("invalid config update in config update message");
            return;
        }

        if !self.token.matches(&update.token) {
            error!("Daemon got invalid token in vpn config update");
            request.reply_error("invalid token in config update message");
            return;
        }

        match (update.reason.as_str(), update.config) {
            (REASON_DISCONNECT, _) => self.update_vpn_config_down(),
            (_, Some(config)) => self.update_vpn_config_up(config),
            // valid connect updates always carry a config
            (_, None) => {}
        }
        request.reply_ok();
    }

    /// Handle a desktop bus request.
    fn handle_dbus_request(&mut self, request: DbusRequest) {
        debug!("Daemon handling D-Bus client request");

        match request {
            DbusRequest::Connect(login) => self.connect_vpn(&login),
            DbusRequest::Disconnect => self.disconnect_vpn(),
        }
    }

    /// Handle a DNS report, forwarding it to split routing.
    fn handle_dns_report(&mut self, report: Report) {
        debug!(?report, "Daemon handling DNS report");

        if !self.status.oc_running.running() {
            return;
        }
        let Some(splitrt) = self.splitrt.as_mut() else {
            return;
        };
        splitrt.handle_dns_report(&report);
    }

    /// Disconnect when a trusted network was detected while the
    /// transport is running.
    fn check_disconnect_vpn(&mut self) {
        if self.status.trusted_network.trusted() && self.status.oc_running.running() {
            info!("Daemon detected trusted network, disconnecting VPN connection");
            self.disconnect_vpn();
        }
    }

    /// Handle a TND verdict.
    fn handle_tnd_result(&mut self, trusted: bool) {
        debug!(trusted, "Daemon handling TND result");
        self.set_status_trusted_network(trusted);
        self.check_disconnect_vpn();
        self.check_trafpol();
    }

    /// Clean up after a transport disconnect. Also invoked as synthetic
    /// cleanup during daemon stop so VPN state is torn down even
    /// without a live event.
    fn handle_runner_disconnect(&mut self) {
        self.set_status_oc_running(false);
        self.set_status_connection_state(ConnectionState::Disconnected);
        self.set_status_connected_at(0);
        self.update_vpn_config_down();
    }

    /// Handle a transport lifecycle event.
    fn handle_runner_event(&mut self, event: ConnectEvent) {
        debug!(?event, "Daemon handling Runner event");

        if event.connect {
            self.set_status_oc_running(true);
            return;
        }
        self.handle_runner_disconnect();
    }

    /// Handle a suspend/resume event: disconnect on resume while the
    /// transport is running.
    fn handle_sleepmon_event(&mut self, sleep: bool) {
        debug!(sleep, "Daemon handling SleepMon event");

        if !sleep && self.status.oc_running.running() {
            self.disconnect_vpn();
        }
    }

    /// Handle an XML profile update: reload, restart the policy gates
    /// and republish the server list.
    fn handle_profile_update(&mut self) {
        debug!("Daemon handling XML profile update");
        self.profile = Profile::load_or_empty(&self.config.xml_profile);
        self.stop_tnd();
        self.stop_trafpol();
        self.check_trafpol();
        self.check_tnd();
        self.set_status_servers(self.profile.vpn_server_host_names());
    }

    fn start_tnd(&mut self) {
        if self.tnd.is_some() {
            return;
        }
        let servers = self
            .profile
            .tnd_https_servers()
            .into_iter()
            .map(|(url, hash)| TndServer::new(url, hash))
            .collect();
        self.tnd = Some(Tnd::start(servers, FWMARK, self.tnd_tx.clone()));
    }

    fn stop_tnd(&mut self) {
        if let Some(tnd) = self.tnd.take() {
            tnd.stop();
        }
    }

    /// Start or stop TND based on the profile.
    fn check_tnd(&mut self) {
        if self.profile.tnd_server_names().is_empty() {
            self.stop_tnd();
            return;
        }
        self.start_tnd();
    }

    /// Union of all hosts reachable while the always-on firewall is up.
    fn allowed_hosts(&self) -> Vec<String> {
        let mut hosts = self.profile.vpn_servers();
        hosts.extend(self.profile.tnd_server_names());
        hosts.extend(CPD_SERVERS.iter().map(|s| s.to_string()));
        hosts.extend(self.profile.allowed_hosts());
        hosts
    }

    fn start_trafpol(&mut self) {
        if self.trafpol.is_some() {
            return;
        }
        match TrafPol::start(&self.allowed_hosts()) {
            Ok(trafpol) => self.trafpol = Some(trafpol),
            Err(e) => error!(error = %e, "Daemon could not start traffic policing"),
        }
    }

    fn stop_trafpol(&mut self) {
        if let Some(trafpol) = self.trafpol.take() {
            trafpol.stop();
        }
    }

    /// Start or stop traffic policing based on current status and
    /// profile.
    fn check_trafpol(&mut self) {
        if self.disable_trafpol {
            self.stop_trafpol();
            return;
        }
        if !self.profile.always_on() {
            self.stop_trafpol();
            return;
        }
        if self.status.trusted_network.trusted() {
            self.stop_trafpol();
            return;
        }
        self.start_trafpol();
    }
}

/// Clean up host state left over from a previous failed run. This is
/// the only crash recovery mechanism; the daemon keeps no persistent
/// state.
fn cleanup(config: &Config) {
    ocrunner::cleanup(&config.transport.pid_file);
    device::cleanup(&config.transport.device);
    splitrt::cleanup();
    trafpol::cleanup();
}

/// The daemon.
pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bring up all subsystems, run the reconciliation loop until
    /// `shutdown` resolves, then tear everything down in reverse order.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<(), DaemonError> {
        let config = self.config;

        // clean up leftovers of a previous failed run first
        cleanup(&config);

        let token = Token::generate()?;
        let profile = Profile::load_or_empty(&config.xml_profile);

        // channels owned by the loop
        let (sleep_tx, mut sleep_rx) = mpsc::channel(CHANNEL_SIZE);
        let (dns_reports_tx, mut dns_reports_rx) = mpsc::channel(CHANNEL_SIZE);
        let (tnd_tx, mut tnd_rx) = mpsc::channel(CHANNEL_SIZE);
        let (runner_events_tx, mut runner_events_rx) = mpsc::channel(CHANNEL_SIZE);
        let (api_requests_tx, mut api_requests_rx) = mpsc::channel(CHANNEL_SIZE);
        let (dbus_requests_tx, mut dbus_requests_rx) = mpsc::channel(CHANNEL_SIZE);
        let (profile_updates_tx, mut profile_updates_rx) = mpsc::channel(CHANNEL_SIZE);
        let (props_tx, props_rx) = mpsc::unbounded_channel();

        let sleepmon = SleepMon::start(sleep_tx).await?;
        let dns = DnsProxy::start(
            &config.dns.listen,
            &config.dns.default_server,
            dns_reports_tx,
        )
        .await?;
        let runner = Runner::new(
            config.transport.clone(),
            config.xml_profile.clone(),
            runner_events_tx,
        );
        let server = api::Server::start(&config.socket_file, api_requests_tx)?;
        let dbus = Service::start(dbus_requests_tx, props_rx).await?;
        let profmon = ProfileMon::start(config.xml_profile.clone(), profile_updates_tx);

        let mut state = DaemonState {
            config,
            status: Status::new(),
            token,
            profile,
            props_tx,
            dns,
            runner,
            tnd: None,
            trafpol: None,
            splitrt: None,
            tnd_tx,
            disable_trafpol: false,
        };

        // policy gates evaluate the freshly loaded profile
        state.check_trafpol();
        state.check_tnd();

        // initial status
        state.set_status_connection_state(ConnectionState::Disconnected);
        state.set_status_servers(state.profile.vpn_server_host_names());

        info!("Daemon started");
        loop {
            tokio::select! {
                Some(request) = api_requests_rx.recv() => state.handle_client_request(request),
                Some(request) = dbus_requests_rx.recv() => state.handle_dbus_request(request),
                Some(report) = dns_reports_rx.recv() => state.handle_dns_report(report),
                Some(trusted) = tnd_rx.recv() => state.handle_tnd_result(trusted),
                Some(event) = runner_events_rx.recv() => state.handle_runner_event(event),
                Some(sleep) = sleep_rx.recv() => state.handle_sleepmon_event(sleep),
                Some(_) = profile_updates_rx.recv() => state.handle_profile_update(),
                _ = &mut shutdown => break,
            }
        }

        info!("Daemon stopping");
        profmon.stop();
        dbus.stop().await;
        server.stop();
        state.runner.stop().await;
        // synthetic transport disconnect so vpn state is guaranteed torn
        // down even if no live event arrived
        state.handle_runner_disconnect();
        state.stop_tnd();
        state.stop_trafpol();
        let DaemonState { dns, .. } = state;
        dns.stop();
        sleepmon.stop();
        info!("Daemon stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::message::Message;
    use crate::api::server::test_request;
    use crate::api::{TYPE_ERROR, TYPE_OK};
    use crate::config::{DnsConfig, TransportConfig};
    use crate::status::OcRunning;
    use crate::vpnconfig::{AddressV4, Device, REASON_CONNECT};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestHarness {
        state: DaemonState,
        props_rx: mpsc::UnboundedReceiver<Property>,
        runner_events_rx: mpsc::Receiver<ConnectEvent>,
        _tnd_rx: mpsc::Receiver<bool>,
        _dns_reports_rx: mpsc::Receiver<Report>,
        _dir: tempfile::TempDir,
    }

    async fn test_harness(profile: Profile) -> TestHarness {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            socket_file: dir.path().join("daemon.sock"),
            xml_profile: dir.path().join("profile.xml"),
            transport: TransportConfig {
                binary: PathBuf::from("true"),
                script: dir.path().join("script"),
                device: "octun-test0".to_string(),
                pid_file: dir.path().join("transport.pid"),
            },
            dns: DnsConfig {
                listen: "127.0.0.1:0".to_string(),
                default_server: "127.0.0.53:53".to_string(),
            },
        };

        let (dns_reports_tx, dns_reports_rx) = mpsc::channel(CHANNEL_SIZE);
        let (tnd_tx, tnd_rx) = mpsc::channel(CHANNEL_SIZE);
        let (runner_events_tx, runner_events_rx) = mpsc::channel(CHANNEL_SIZE);
        let (props_tx, props_rx) = mpsc::unbounded_channel();

        let dns = DnsProxy::start(
            &config.dns.listen,
            &config.dns.default_server,
            dns_reports_tx,
        )
        .await
        .unwrap();
        let runner = Runner::new(
            config.transport.clone(),
            config.xml_profile.clone(),
            runner_events_tx,
        );

        let state = DaemonState {
            config,
            status: Status::new(),
            token: Token::generate().unwrap(),
            profile,
            props_tx,
            dns,
            runner,
            tnd: None,
            trafpol: None,
            splitrt: None,
            tnd_tx,
            disable_trafpol: false,
        };

        TestHarness {
            state,
            props_rx,
            runner_events_rx,
            _tnd_rx: tnd_rx,
            _dns_reports_rx: dns_reports_rx,
            _dir: dir,
        }
    }

    fn test_login() -> LoginInfo {
        LoginInfo {
            cookie: "c".to_string(),
            host: "vpn.example.com".to_string(),
            ..Default::default()
        }
    }

    fn test_vpn_config() -> VpnConfig {
        let mut remotes = BTreeMap::new();
        remotes.insert(".".to_string(), vec!["10.0.0.1:53".to_string()]);
        VpnConfig {
            gateway: "192.0.2.1".to_string(),
            device: Device {
                name: "octun-test0".to_string(),
                mtu: 1400,
            },
            ipv4: Some(AddressV4 {
                address: "10.0.0.2".parse().unwrap(),
                prefix: 24,
            }),
            dns: crate::vpnconfig::DnsSettings {
                default_domain: "example.com".to_string(),
                remotes,
            },
            ..Default::default()
        }
    }

    fn connect_update(token: &str) -> ConfigUpdate {
        ConfigUpdate {
            reason: REASON_CONNECT.to_string(),
            token: token.to_string(),
            config: Some(test_vpn_config()),
        }
    }

    fn drain_props(rx: &mut mpsc::UnboundedReceiver<Property>) -> Vec<Property> {
        let mut props = Vec::new();
        while let Ok(p) = rx.try_recv() {
            props.push(p);
        }
        props
    }

    #[tokio::test]
    async fn test_setters_emit_once() {
        let mut h = test_harness(Profile::default()).await;

        h.state.set_status_ip("10.0.0.2".to_string());
        h.state.set_status_ip("10.0.0.2".to_string());

        let props = drain_props(&mut h.props_rx);
        assert_eq!(props, vec![Property::Ip("10.0.0.2".to_string())]);
    }

    #[tokio::test]
    async fn test_repeated_tnd_verdicts_emit_once() {
        let mut h = test_harness(Profile::default()).await;

        h.state.handle_tnd_result(false);
        h.state.handle_tnd_result(false);
        h.state.handle_tnd_result(false);

        let props = drain_props(&mut h.props_rx);
        assert_eq!(
            props,
            vec![Property::TrustedNetwork("not trusted".to_string())]
        );
    }

    #[tokio::test]
    async fn test_clean_connect() {
        let mut h = test_harness(Profile::default()).await;
        h.state.set_status_connection_state(ConnectionState::Disconnected);

        // connect intent from the bus
        h.state
            .handle_dbus_request(DbusRequest::Connect(test_login()));
        assert_eq!(h.state.status.connection_state, ConnectionState::Connecting);
        assert_eq!(h.state.status.oc_running, OcRunning::Running);

        // the transport came up
        let event = timeout(Duration::from_secs(5), h.runner_events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnectEvent { connect: true });

        // config callback from the transport
        let update = connect_update(h.state.token.as_str());
        let (request, mut reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);

        assert_eq!(reply_rx.try_recv().unwrap().typ, TYPE_OK);
        assert_eq!(h.state.status.connection_state, ConnectionState::Connected);
        assert_eq!(h.state.status.ip, "10.0.0.2");
        assert_eq!(h.state.status.device, "octun-test0");
        assert!(h.state.status.connected_at > 0);
        assert!(h.state.status.vpn_config.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_connect_rejected() {
        let mut h = test_harness(Profile::default()).await;

        h.state.connect_vpn(&test_login());
        let before = h.state.status.clone();
        drain_props(&mut h.props_rx);

        h.state.connect_vpn(&test_login());
        assert_eq!(h.state.status, before);
        assert!(drain_props(&mut h.props_rx).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_login_rejected() {
        let mut h = test_harness(Profile::default()).await;

        h.state.connect_vpn(&LoginInfo::default());
        assert_eq!(h.state.status.oc_running, OcRunning::Unknown);
        assert!(drain_props(&mut h.props_rx).is_empty());
    }

    #[tokio::test]
    async fn test_bad_token_never_mutates_status() {
        let mut h = test_harness(Profile::default()).await;
        h.state.connect_vpn(&test_login());
        let before = h.state.status.clone();
        drain_props(&mut h.props_rx);

        let update = connect_update("wrong-token");
        let (request, mut reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);

        let reply = reply_rx.try_recv().unwrap();
        assert_eq!(reply.typ, TYPE_ERROR);
        assert_eq!(h.state.status, before);
        assert!(drain_props(&mut h.props_rx).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_update_rejected() {
        let mut h = test_harness(Profile::default()).await;

        let (request, mut reply_rx) =
            test_request(Message::config_update(b"not json".to_vec()));
        h.state.handle_client_request(request);
        assert_eq!(reply_rx.try_recv().unwrap().typ, TYPE_ERROR);

        let bogus = ConfigUpdate {
            reason: "reconnect".to_string(),
            token: h.state.token.as_str().to_string(),
            config: None,
        };
        let (request, mut reply_rx) =
            test_request(Message::config_update(bogus.to_json().unwrap()));
        h.state.handle_client_request(request);
        assert_eq!(reply_rx.try_recv().unwrap().typ, TYPE_ERROR);
    }

    #[tokio::test]
    async fn test_equal_config_update_is_noop() {
        let mut h = test_harness(Profile::default()).await;
        h.state.connect_vpn(&test_login());

        let update = connect_update(h.state.token.as_str());
        let (request, _reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);
        assert_eq!(h.state.status.connection_state, ConnectionState::Connected);
        let connected_at = h.state.status.connected_at;

        // same config again: rejected as re-entry, status untouched
        let update = connect_update(h.state.token.as_str());
        let (request, mut reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);
        assert_eq!(reply_rx.try_recv().unwrap().typ, TYPE_OK);
        assert_eq!(h.state.status.connected_at, connected_at);
        assert_eq!(h.state.status.connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_trusted_network_preempts_connection() {
        let mut h = test_harness(Profile::default()).await;

        // bring the tunnel up
        h.state.connect_vpn(&test_login());
        let update = connect_update(h.state.token.as_str());
        let (request, _reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);
        assert_eq!(h.state.status.connection_state, ConnectionState::Connected);

        // trusted verdict triggers the disconnect sequence
        h.state.handle_tnd_result(true);
        assert_eq!(h.state.status.trusted_network, TrustedNetwork::Trusted);
        assert_eq!(
            h.state.status.connection_state,
            ConnectionState::Disconnecting
        );
        assert_eq!(h.state.status.oc_running, OcRunning::NotRunning);

        // transport exit completes the teardown
        h.state.handle_runner_event(ConnectEvent { connect: false });
        assert_eq!(
            h.state.status.connection_state,
            ConnectionState::Disconnected
        );
        assert!(h.state.status.vpn_config.is_none());
        assert!(h.state.status.ip.is_empty());
        assert!(h.state.status.device.is_empty());
        assert_eq!(h.state.status.connected_at, 0);
    }

    #[tokio::test]
    async fn test_disconnect_update_tears_down() {
        let mut h = test_harness(Profile::default()).await;

        h.state.connect_vpn(&test_login());
        let update = connect_update(h.state.token.as_str());
        let (request, _reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);

        // user disconnect puts the daemon in Disconnecting first
        h.state.handle_dbus_request(DbusRequest::Disconnect);
        assert_eq!(
            h.state.status.connection_state,
            ConnectionState::Disconnecting
        );

        let update = ConfigUpdate {
            reason: REASON_DISCONNECT.to_string(),
            token: h.state.token.as_str().to_string(),
            config: None,
        };
        let (request, mut reply_rx) = test_request(Message::config_update(update.to_json().unwrap()));
        h.state.handle_client_request(request);

        assert_eq!(reply_rx.try_recv().unwrap().typ, TYPE_OK);
        assert_eq!(
            h.state.status.connection_state,
            ConnectionState::Disconnected
        );
        assert!(h.state.status.vpn_config.is_none());
    }

    #[tokio::test]
    async fn test_resume_disconnects_running_tunnel() {
        let mut h = test_harness(Profile::default()).await;
        h.state.connect_vpn(&test_login());

        // suspend is ignored
        h.state.handle_sleepmon_event(true);
        assert_eq!(h.state.status.oc_running, OcRunning::Running);

        // resume disconnects
        h.state.handle_sleepmon_event(false);
        assert_eq!(
            h.state.status.connection_state,
            ConnectionState::Disconnecting
        );
        assert_eq!(h.state.status.oc_running, OcRunning::NotRunning);
    }

    #[tokio::test]
    async fn test_resume_without_tunnel_is_noop() {
        let mut h = test_harness(Profile::default()).await;
        h.state.set_status_connection_state(ConnectionState::Disconnected);
        drain_props(&mut h.props_rx);

        h.state.handle_sleepmon_event(false);
        assert_eq!(
            h.state.status.connection_state,
            ConnectionState::Disconnected
        );
        assert!(drain_props(&mut h.props_rx).is_empty());
    }

    #[tokio::test]
    async fn test_profile_update_reloads_servers() {
        let mut h = test_harness(Profile::default()).await;

        std::fs::write(
            &h.state.config.xml_profile,
            r#"<AnyConnectProfile>
                <ServerList>
                    <HostEntry>
                        <HostName>New VPN</HostName>
                        <HostAddress>new.example.com</HostAddress>
                    </HostEntry>
                </ServerList>
            </AnyConnectProfile>"#,
        )
        .unwrap();

        h.state.handle_profile_update();
        assert_eq!(h.state.status.servers, vec!["New VPN".to_string()]);
        // no TND servers in the profile: the detector stays off
        assert!(h.state.tnd.is_none());
        // always-on is off: no traffic policing
        assert!(h.state.trafpol.is_none());
    }

    #[tokio::test]
    async fn test_dns_report_dropped_without_tunnel() {
        let mut h = test_harness(Profile::default()).await;

        let report = Report {
            name: "www.example.com".to_string(),
            address: "10.0.0.9".parse().unwrap(),
        };
        // not running and split routing absent: silently dropped
        h.state.handle_dns_report(report);
        assert!(h.state.splitrt.is_none());
    }

    #[tokio::test]
    async fn test_tnd_gate_follows_profile() {
        let profile = Profile::parse(
            r#"<AnyConnectProfile>
                <AutomaticVPNPolicy>
                    <TrustedHttpsServerList>
                        <TrustedHttpsServer>
                            <Address>tnd.example.com</Address>
                            <Port>443</Port>
                            <CertificateHash>AABB</CertificateHash>
                        </TrustedHttpsServer>
                    </TrustedHttpsServerList>
                </AutomaticVPNPolicy>
            </AnyConnectProfile>"#,
        )
        .unwrap();
        let mut h = test_harness(profile).await;

        h.state.check_tnd();
        assert!(h.state.tnd.is_some());

        // idempotent start
        h.state.check_tnd();
        assert!(h.state.tnd.is_some());

        // profile without TND servers stops the detector
        h.state.profile = Profile::default();
        h.state.check_tnd();
        assert!(h.state.tnd.is_none());
    }
}
