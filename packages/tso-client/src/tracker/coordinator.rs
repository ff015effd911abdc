//! Coordination backend seam.
//!
//! The leader record lives in a ZooKeeper-like store. Only two reads are
//! needed: a plain `get` and a `get_watch` that also arms a one-shot watch
//! on the node. Re-arming the watch is the caller's job.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::LeaderRecord;

/// Fires once when the watched node changes or is deleted.
pub type NodeWatch = oneshot::Receiver<()>;

/// Read access to a hierarchical coordination store.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Fetches the data stored at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Fetches the data stored at `path` and watches it for the next change.
    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, NodeWatch)>;
}

#[derive(Default)]
struct Node {
    data: Vec<u8>,
    watches: Vec<oneshot::Sender<()>>,
}

impl Node {
    fn fire_watches(&mut self) {
        for watch in self.watches.drain(..) {
            let _ = watch.send(());
        }
    }
}

/// In-process coordination store.
///
/// Useful for tests and single-process deployments. Paths are flat keys;
/// there is no parent/child structure.
pub struct MemoryCoordinator {
    nodes: DashMap<String, Node>,
    reachable: AtomicBool,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            reachable: AtomicBool::new(true),
        }
    }

    /// Stores `data` at `path` and fires any pending watches on it.
    pub fn set(&self, path: &str, data: Vec<u8>) {
        let mut node = self.nodes.entry(path.to_string()).or_default();
        node.data = data;
        node.fire_watches();
    }

    /// Removes `path`, firing any pending watches on it.
    pub fn delete(&self, path: &str) -> bool {
        match self.nodes.remove(path) {
            Some((_, mut node)) => {
                node.fire_watches();
                true
            }
            None => false,
        }
    }

    /// Publishes `addr` as the leader under `root_path`.
    pub fn set_leader(&self, root_path: &str, addr: &str) -> Result<()> {
        let record = LeaderRecord {
            addr: addr.to_string(),
        };
        let data = serde_json::to_vec(&record).context("Failed to encode leader record")?;
        self.set(&super::leader_path(root_path), data);
        Ok(())
    }

    /// Simulates the store going down (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("coordination backend unreachable"))
        }
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for MemoryCoordinator {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| anyhow!("node does not exist: {}", path))
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, NodeWatch)> {
        self.check_reachable()?;
        let mut node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| anyhow!("node does not exist: {}", path))?;
        let (tx, rx) = oneshot::channel();
        node.watches.push(tx);
        Ok((node.data.clone(), rx))
    }
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator")
            .field("nodes", &self.nodes.len())
            .field("reachable", &self.reachable.load(Ordering::Relaxed))
            .finish()
    }
}
