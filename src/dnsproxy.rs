//! DNS proxy between local clients and the configured resolvers.
//!
//! The proxy runs for the whole daemon lifetime. While a tunnel is up
//! it forwards queries to the tunnel resolvers selected by domain
//! suffix; otherwise everything goes to the default system resolver.
//! Resolutions of watched domains (split-routing DNS excludes) are
//! reported to the daemon loop so the routing can follow them.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PACKET_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum DnsProxyError {
    #[error("Invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),
    #[error("Failed to bind DNS listener: {0}")]
    Bind(#[source] io::Error),
}

/// Observed resolution of a watched domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub name: String,
    pub address: IpAddr,
}

#[derive(Debug, Default)]
struct ProxyState {
    /// Domain suffix -> resolver addresses; `.` selects the default
    remotes: BTreeMap<String, Vec<String>>,
    /// Domain suffixes whose resolutions are reported
    watches: Vec<String>,
}

/// DNS proxy handle.
pub struct DnsProxy {
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<ProxyState>>,
    handle: JoinHandle<()>,
}

impl DnsProxy {
    /// Bind the proxy and start forwarding. Bind failure is fatal to
    /// daemon start.
    pub async fn start(
        listen: &str,
        default_server: &str,
        reports_tx: mpsc::Sender<Report>,
    ) -> Result<Self, DnsProxyError> {
        let addr: SocketAddr = listen.parse()?;
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(DnsProxyError::Bind)?);

        let mut remotes = BTreeMap::new();
        remotes.insert(".".to_string(), vec![default_server.to_string()]);
        let state = Arc::new(Mutex::new(ProxyState {
            remotes,
            watches: Vec::new(),
        }));

        let handle = tokio::spawn(run(socket.clone(), state.clone(), reports_tx));

        Ok(Self {
            socket,
            state,
            handle,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Replace the remote resolver map.
    pub fn set_remotes(&self, remotes: BTreeMap<String, Vec<String>>) {
        self.state.lock().unwrap().remotes = remotes;
    }

    /// Replace the watched domain suffixes.
    pub fn set_watches(&self, watches: &[String]) {
        self.state.lock().unwrap().watches = watches.iter().map(|w| normalize(w)).collect();
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn run(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<ProxyState>>,
    reports_tx: mpsc::Sender<Report>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, client) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "DNS proxy receive error");
                continue;
            }
        };
        let query = buf[..n].to_vec();
        let name = query_name(&query);

        let (remote, watched) = {
            let state = state.lock().unwrap();
            let remote = select_remote(&state.remotes, name.as_deref());
            let watched = name
                .as_deref()
                .map(|n| state.watches.iter().any(|w| matches_suffix(n, w)))
                .unwrap_or(false);
            (remote, watched)
        };

        let Some(remote) = remote else {
            debug!("DNS proxy has no remote for query");
            continue;
        };

        let socket = socket.clone();
        let reports_tx = reports_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = forward(socket, client, query, name, remote, watched, reports_tx).await
            {
                debug!(error = %e, "DNS proxy forward error");
            }
        });
    }
}

async fn forward(
    listen: Arc<UdpSocket>,
    client: SocketAddr,
    query: Vec<u8>,
    name: Option<String>,
    remote: String,
    watched: bool,
    reports_tx: mpsc::Sender<Report>,
) -> io::Result<()> {
    let remote: SocketAddr = remote
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let bind_addr: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(bind_addr).await?;
    upstream.connect(remote).await?;
    upstream.send(&query).await?;

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let n = timeout(FORWARD_TIMEOUT, upstream.recv(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream timeout"))??;
    let response = &buf[..n];

    listen.send_to(response, client).await?;

    if watched {
        if let Some(name) = name {
            for address in answer_addresses(response) {
                let _ = reports_tx
                    .send(Report {
                        name: name.clone(),
                        address,
                    })
                    .await;
            }
        }
    }

    Ok(())
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn matches_suffix(name: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    name == suffix || name.ends_with(&format!(".{}", suffix))
}

/// Pick the resolvers for a query name: longest matching suffix wins,
/// the `.` entry is the fallback.
fn select_remote(remotes: &BTreeMap<String, Vec<String>>, name: Option<&str>) -> Option<String> {
    let mut best: Option<(usize, &Vec<String>)> = None;
    if let Some(name) = name {
        for (suffix, servers) in remotes {
            if suffix == "." || servers.is_empty() {
                continue;
            }
            let suffix = normalize(suffix);
            if matches_suffix(name, &suffix) && best.map_or(true, |(l, _)| suffix.len() > l) {
                best = Some((suffix.len(), servers));
            }
        }
    }
    let servers = match best {
        Some((_, servers)) => servers,
        None => remotes.get(".")?,
    };
    servers.first().cloned()
}

/// Skip over a possibly compressed name, returning the next offset.
fn skip_name(packet: &[u8], mut i: usize) -> Option<usize> {
    loop {
        let len = *packet.get(i)? as usize;
        if len == 0 {
            return Some(i + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Some(i + 2);
        }
        i += len + 1;
    }
}

/// Extract the query name from a DNS packet.
fn query_name(packet: &[u8]) -> Option<String> {
    if packet.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut name = String::new();
    let mut i = 12;
    loop {
        let len = *packet.get(i)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xc0 != 0 {
            return None;
        }
        let label = packet.get(i + 1..i + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(std::str::from_utf8(label).ok()?);
        i += len + 1;
    }
    Some(name.to_ascii_lowercase())
}

/// Extract A/AAAA addresses from the answer section.
fn answer_addresses(packet: &[u8]) -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    if packet.len() < 12 {
        return addrs;
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut i = 12;
    for _ in 0..qdcount {
        i = match skip_name(packet, i) {
            Some(n) => n + 4,
            None => return addrs,
        };
    }

    for _ in 0..ancount {
        i = match skip_name(packet, i) {
            Some(n) => n,
            None => return addrs,
        };
        if packet.len() < i + 10 {
            return addrs;
        }
        let rtype = u16::from_be_bytes([packet[i], packet[i + 1]]);
        let rdlen = u16::from_be_bytes([packet[i + 8], packet[i + 9]]) as usize;
        i += 10;
        if packet.len() < i + rdlen {
            return addrs;
        }
        match (rtype, rdlen) {
            (1, 4) => {
                addrs.push(IpAddr::from([
                    packet[i],
                    packet[i + 1],
                    packet[i + 2],
                    packet[i + 3],
                ]));
            }
            (28, 16) => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&packet[i..i + 16]);
                addrs.push(IpAddr::from(bytes));
            }
            _ => {}
        }
        i += rdlen;
    }
    addrs
}
