//! Fixed leader address.

use std::sync::Arc;

use tokio::sync::watch;

use super::{LeaderLocator, LeaderReceiver};

/// Locator for a leader address fixed at construction. Never changes.
#[derive(Debug)]
pub struct StaticTracker {
    leader_tx: watch::Sender<Option<String>>,
}

impl StaticTracker {
    pub fn new(addr: impl Into<String>) -> Self {
        let (leader_tx, _) = watch::channel(Some(addr.into()));
        Self { leader_tx }
    }
}

impl LeaderLocator for StaticTracker {
    fn start(self: Arc<Self>) {}

    fn current_address(&self) -> Option<String> {
        self.leader_tx.borrow().clone()
    }

    fn subscribe(&self) -> LeaderReceiver {
        self.leader_tx.subscribe()
    }
}
