//! Suspend/resume monitor.
//!
//! Subscribes to logind's PrepareForSleep signal on the system bus and
//! forwards the sleep flag to the daemon loop.

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SleepMonError {
    #[error("D-Bus error: {0}")]
    Zbus(#[from] zbus::Error),
}

/// Sleep monitor handle.
pub struct SleepMon {
    handle: JoinHandle<()>,
}

impl SleepMon {
    /// Subscribe to suspend/resume signals.
    pub async fn start(events_tx: mpsc::Sender<bool>) -> Result<Self, SleepMonError> {
        let conn = zbus::Connection::system().await?;
        let proxy = zbus::Proxy::new(
            &conn,
            "org.freedesktop.login1",
            "/org/freedesktop/login1",
            "org.freedesktop.login1.Manager",
        )
        .await?;
        let mut stream = proxy.receive_signal("PrepareForSleep").await?;

        let handle = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg.body().deserialize::<bool>() {
                    Ok(sleep) => {
                        debug!(sleep, "SleepMon received PrepareForSleep");
                        if events_tx.send(sleep).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "SleepMon could not parse signal"),
                }
            }
        });

        Ok(Self { handle })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}
