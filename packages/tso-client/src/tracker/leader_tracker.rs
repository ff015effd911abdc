//! Leader discovery through a coordination backend.
//!
//! Reads the leader record, publishes its address when it differs from the
//! last one published, then blocks on the one-shot watch and repeats. Any
//! backend or decode failure is logged and retried after a fixed backoff;
//! callers never see it, they just keep using the last known leader.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use tokio::sync::watch;

use super::{
    leader_path, CoordinationBackend, LeaderLocator, LeaderReceiver, LeaderRecord, NodeWatch,
};

/// Locator that follows the leader record in a coordination store.
pub struct DiscoveryTracker {
    /// Store holding the leader record.
    backend: Arc<dyn CoordinationBackend>,
    /// Root path; the record lives at `<root_path>/leader`.
    root_path: String,
    /// Pause before retrying a failed lookup.
    retry_backoff: Duration,
    /// Latest published leader address.
    leader_tx: watch::Sender<Option<String>>,
}

impl DiscoveryTracker {
    /// Creates a tracker. Nothing is read until [`LeaderLocator::start`].
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        root_path: impl Into<String>,
        retry_backoff: Duration,
    ) -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            backend,
            root_path: root_path.into(),
            retry_backoff,
            leader_tx,
        }
    }

    /// Runs the watch loop until every subscriber has gone away.
    ///
    /// Should be spawned as a background task after at least one
    /// subscription exists.
    pub async fn run_leader_watcher(self: Arc<Self>) {
        debug!("Watching tso leader at {}", leader_path(&self.root_path));
        tokio::select! {
            _ = self.leader_tx.closed() => {
                debug!("No leader subscribers left, stopping watcher");
            }
            _ = self.watch_loop() => {}
        }
    }

    async fn watch_loop(&self) {
        loop {
            match self.fetch_leader().await {
                Ok((addr, watch)) => {
                    self.publish(addr);
                    // Fires on change or deletion; a dropped watch means the
                    // same thing for us: read again.
                    let _ = watch.await;
                }
                Err(e) => {
                    error!(
                        "Get tso leader error: {:#}, retrying in {:?}",
                        e, self.retry_backoff
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn fetch_leader(&self) -> Result<(String, NodeWatch)> {
        let path = leader_path(&self.root_path);
        let (data, watch) = self
            .backend
            .get_watch(&path)
            .await
            .with_context(|| format!("Failed to watch {}", path))?;
        let record: LeaderRecord =
            serde_json::from_slice(&data).context("Failed to decode leader record")?;
        if record.addr.is_empty() {
            bail!("Leader record at {} has an empty address", path);
        }
        Ok((record.addr, watch))
    }

    /// Publishes `addr` unless it is already the current leader.
    fn publish(&self, addr: String) -> bool {
        self.leader_tx.send_if_modified(|current| {
            if current.as_deref() == Some(addr.as_str()) {
                return false;
            }
            warn!(
                "Tso leader change {} -> {}",
                current.as_deref().unwrap_or("<none>"),
                addr
            );
            *current = Some(addr);
            true
        })
    }
}

impl LeaderLocator for DiscoveryTracker {
    fn start(self: Arc<Self>) {
        tokio::spawn(self.run_leader_watcher());
    }

    fn current_address(&self) -> Option<String> {
        self.leader_tx.borrow().clone()
    }

    fn subscribe(&self) -> LeaderReceiver {
        self.leader_tx.subscribe()
    }
}

impl std::fmt::Debug for DiscoveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryTracker")
            .field("root_path", &self.root_path)
            .field("leader", &*self.leader_tx.borrow())
            .finish()
    }
}
