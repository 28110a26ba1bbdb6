//! Control socket server.
//!
//! Listens on a root-owned Unix socket and forwards framed requests to
//! the daemon loop. Each connection carries exactly one request and is
//! answered with OK or Error before the connection is closed.

use super::message::{read_message, write_message, Message, TYPE_CONFIG_UPDATE};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Timeout for the daemon loop to answer a request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to bind control socket: {0}")]
    Bind(#[source] io::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A client request pending an answer from the daemon loop.
#[derive(Debug)]
pub struct Request {
    msg: Message,
    reply: oneshot::Sender<Message>,
}

impl Request {
    pub fn typ(&self) -> u16 {
        self.msg.typ
    }

    pub fn data(&self) -> &[u8] {
        &self.msg.payload
    }

    /// Answer the request with OK.
    pub fn reply_ok(self) {
        let _ = self.reply.send(Message::ok());
    }

    /// Answer the request with an error surfaced to the caller.
    pub fn reply_error(self, reason: &str) {
        let _ = self.reply.send(Message::error(reason));
    }
}

#[cfg(test)]
pub(crate) fn test_request(msg: Message) -> (Request, oneshot::Receiver<Message>) {
    let (tx, rx) = oneshot::channel();
    (Request { msg, reply: tx }, rx)
}

/// Control socket server handle.
pub struct Server {
    path: PathBuf,
    handle: JoinHandle<()>,
}

impl Server {
    /// Bind the control socket and start accepting requests.
    ///
    /// A stale socket file from a previous run is removed first. The
    /// socket is restricted to the owner (0600).
    pub fn start(path: &Path, requests_tx: mpsc::Sender<Request>) -> Result<Self, ApiError> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(path).map_err(ApiError::Bind)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(path, perms);
        }

        debug!(path = %path.display(), "Control socket listening");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let requests_tx = requests_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_conn(stream, requests_tx).await {
                                debug!(error = %e, "Control socket client error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control socket connection");
                    }
                }
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            handle,
        })
    }

    /// Stop accepting requests and remove the socket file.
    pub fn stop(self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_conn(stream: UnixStream, requests_tx: mpsc::Sender<Request>) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let msg = read_message(&mut reader).await?;

    let reply = match msg.typ {
        TYPE_CONFIG_UPDATE => {
            let (tx, rx) = oneshot::channel();
            let request = Request { msg, reply: tx };
            if requests_tx.send(request).await.is_err() {
                Message::error("daemon is shutting down")
            } else {
                match timeout(REQUEST_TIMEOUT, rx).await {
                    Ok(Ok(reply)) => reply,
                    _ => Message::error("request not handled"),
                }
            }
        }
        _ => Message::error("invalid request type"),
    };

    write_message(&mut writer, &reply).await
}
