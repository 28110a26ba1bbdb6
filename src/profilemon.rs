//! Profile file monitor.
//!
//! Polls the XML profile's modification time and notifies the daemon
//! loop when it changes. Creation and removal of the file count as
//! changes as well.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Profile monitor handle.
pub struct ProfileMon {
    handle: JoinHandle<()>,
}

impl ProfileMon {
    pub fn start(path: PathBuf, updates_tx: mpsc::Sender<()>) -> Self {
        let handle = tokio::spawn(run(path, updates_tx));
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn run(path: PathBuf, updates_tx: mpsc::Sender<()>) {
    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last = modified(&path);
    loop {
        ticker.tick().await;
        let current = modified(&path);
        if current != last {
            debug!(path = %path.display(), "Profile file changed");
            last = current;
            if updates_tx.send(()).await.is_err() {
                return;
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
