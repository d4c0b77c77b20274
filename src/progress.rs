//! Progress observers
//!
//! The coordinator pushes a [`ProgressSnapshot`] every tick; rendering it is
//! up to the sink.

use tokio::sync::watch;
use tracing::info;

use crate::models::ProgressSnapshot;

/// Receives periodic progress snapshots
pub trait ProgressSink: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

/// Logs one line per snapshot
#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, snapshot: &ProgressSnapshot) {
        let proxies = &snapshot.proxies;
        info!(
            completed = snapshot.completed,
            target = snapshot.target,
            valid = proxies.valid,
            in_use = proxies.in_use,
            cooldown = proxies.cooldown,
            fetched = proxies.fetched,
            dead = proxies.dead,
            checked = snapshot.checked,
            validated = snapshot.validated,
            stalled = snapshot.stalled,
            "Progress {}/{}",
            snapshot.completed,
            snapshot.target
        );
    }
}

/// Publishes the latest snapshot on a watch channel
pub struct WatchProgress {
    tx: watch::Sender<ProgressSnapshot>,
}

impl WatchProgress {
    pub fn new() -> (Self, watch::Receiver<ProgressSnapshot>) {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }
}

impl ProgressSink for WatchProgress {
    fn report(&self, snapshot: &ProgressSnapshot) {
        self.tx.send_replace(snapshot.clone());
    }
}
