//! Supervisor for the external VPN transport process.
//!
//! Starts one transport session per connect intent, delivers lifecycle
//! events to the daemon loop and terminates the process on disconnect.
//! The transport reports the tunnel's network configuration back
//! through the control socket, authenticated by the run token passed in
//! its environment.

use crate::config::TransportConfig;
use crate::logininfo::LoginInfo;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle event of the transport process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectEvent {
    pub connect: bool,
}

struct Session {
    terminate_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Transport supervisor.
pub struct Runner {
    config: TransportConfig,
    profile: PathBuf,
    events_tx: mpsc::Sender<ConnectEvent>,
    session: Option<Session>,
}

impl Runner {
    pub fn new(config: TransportConfig, profile: PathBuf, events_tx: mpsc::Sender<ConnectEvent>) -> Self {
        Self {
            config,
            profile,
            events_tx,
            session: None,
        }
    }

    /// Start one transport session with the given login and environment.
    ///
    /// At most one session is supervised at a time; a connect while one
    /// is active is ignored.
    pub fn connect(&mut self, login: &LoginInfo, env: &[(String, String)]) {
        if let Some(session) = &self.session {
            if !session.handle.is_finished() {
                warn!("Transport session already active, ignoring connect");
                return;
            }
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::spawn(supervise(
            self.config.clone(),
            self.profile.clone(),
            login.clone(),
            env.to_vec(),
            terminate_rx,
            self.events_tx.clone(),
        ));
        self.session = Some(Session {
            terminate_tx,
            handle,
        });
    }

    /// End the current session, if any.
    pub fn disconnect(&mut self) {
        match self.session.take() {
            Some(session) => {
                let _ = session.terminate_tx.send(());
            }
            None => debug!("No transport session to disconnect"),
        }
    }

    /// Disconnect and wait for the supervision task to finish.
    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.terminate_tx.send(());
            let _ = session.handle.await;
        }
    }
}

async fn supervise(
    config: TransportConfig,
    profile: PathBuf,
    login: LoginInfo,
    env: Vec<(String, String)>,
    mut terminate_rx: oneshot::Receiver<()>,
    events_tx: mpsc::Sender<ConnectEvent>,
) {
    let mut command = Command::new(&config.binary);
    command
        .arg("--protocol=anyconnect")
        .arg("--cookie-on-stdin")
        .arg(format!("--script={}", config.script.display()))
        .arg(format!("--interface={}", config.device))
        .arg(format!("--pid-file={}", config.pid_file.display()))
        .arg(format!("--xmlconfig={}", profile.display()));
    if !login.fingerprint.is_empty() {
        command.arg(format!("--servercert={}", login.fingerprint));
    }
    if !login.resolve.is_empty() {
        command.arg(format!("--resolve={}", login.resolve));
    }
    command.arg(login.server());
    for (key, value) in &env {
        command.env(key, value);
    }
    command.stdin(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "Could not start transport process");
            let _ = events_tx.send(ConnectEvent { connect: false }).await;
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let mut cookie = login.cookie.clone().into_bytes();
        cookie.push(b'\n');
        if let Err(e) = stdin.write_all(&cookie).await {
            warn!(error = %e, "Could not pass cookie to transport");
        }
    }

    info!("Transport process started");
    let _ = events_tx.send(ConnectEvent { connect: true }).await;

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(%status, "Transport process exited"),
                Err(e) => error!(error = %e, "Transport process wait failed"),
            }
        }
        _ = &mut terminate_rx => {
            terminate(&mut child).await;
        }
    }

    let _ = std::fs::remove_file(&config.pid_file);
    let _ = events_tx.send(ConnectEvent { connect: false }).await;
}

/// Terminate the transport: SIGTERM first, SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(TERMINATE_TIMEOUT, child.wait()).await.is_ok() {
            return;
        }
        warn!("Transport did not exit after SIGTERM, killing");
    }
    let _ = child.kill().await;
}

/// Remove crash leftovers: signal a stale transport process recorded in
/// the pid file and remove the file.
pub fn cleanup(pid_file: &Path) {
    let Ok(content) = std::fs::read_to_string(pid_file) else {
        return;
    };
    if let Ok(pid) = content.trim().parse::<i32>() {
        if kill(Pid::from_raw(pid), None).is_ok() {
            warn!(pid, "Found stale transport process, terminating");
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }
    let _ = std::fs::remove_file(pid_file);
}
