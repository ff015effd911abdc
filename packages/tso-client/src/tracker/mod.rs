//! Leader location for the TSO client.
//!
//! A locator yields the current leader address and publishes later changes
//! on a single-slot `watch` channel. Only the latest address matters, so a
//! burst of changes collapses into the most recent one.
//!
//! Two strategies share the contract:
//! - [`StaticTracker`] - a fixed address from configuration
//! - [`DiscoveryTracker`] - the leader record in a coordination store

mod coordinator;
mod leader_tracker;
mod static_tracker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub use coordinator::{CoordinationBackend, MemoryCoordinator, NodeWatch};
pub use leader_tracker::DiscoveryTracker;
pub use static_tracker::StaticTracker;

/// Receiving side of a locator's leader channel. `None` until a leader is known.
pub type LeaderReceiver = watch::Receiver<Option<String>>;

/// Default coordination root path.
pub const DEFAULT_ROOT_PATH: &str = "/zk/tso";

/// Yields the current leader address and notifies of changes.
pub trait LeaderLocator: Send + Sync {
    /// Begins background watching. Called once by the client.
    fn start(self: Arc<Self>);

    /// Returns the best-known leader address, if any.
    fn current_address(&self) -> Option<String>;

    /// Returns a receiver for leader changes.
    fn subscribe(&self) -> LeaderReceiver;
}

/// Leader record stored in the coordination backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    #[serde(rename = "Addr")]
    pub addr: String,
}

/// Path of the leader record under `root_path`.
pub fn leader_path(root_path: &str) -> String {
    format!("{}/leader", root_path.trim_end_matches('/'))
}
