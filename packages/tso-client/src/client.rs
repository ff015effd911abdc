//! TsoClient - main interface for requesting timestamps.
//!
//! Requests from any number of tasks are queued and pipelined by a single
//! background worker over one connection to the current leader.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::errors::TsoError;
use crate::pipeline::{
    PendingRequest, PendingTimestamp, PipelineSettings, PipelineStats, PipelineWorker,
};
use crate::timestamp::Timestamp;
use crate::tracker::{
    CoordinationBackend, DiscoveryTracker, LeaderLocator, StaticTracker, DEFAULT_ROOT_PATH,
};

/// Maximum number of requests waiting for the worker.
pub const MAX_PIPELINE_REQUEST: usize = 100_000;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_DISCOVERY_RETRY_MS: u64 = 3_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 50;

/// Configuration for the TSO client.
///
/// Every field is optional; unset fields use the documented default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TsoClientConfig {
    /// Fixed leader address. Ignored when a coordination backend is used.
    pub server_addr: Option<String>,
    /// Coordination root path (default: `/zk/tso`).
    pub root_path: Option<String>,
    /// TCP connect deadline (default: 1000).
    pub connect_timeout_ms: Option<u64>,
    /// Deadline for each read, write and flush (default: 1000).
    pub io_timeout_ms: Option<u64>,
    /// Pause after a failed session before reconnecting (default: 1000).
    pub reconnect_delay_ms: Option<u64>,
    /// Backoff when the coordination backend fails (default: 3000).
    pub discovery_retry_ms: Option<u64>,
    /// Submission queue capacity (default: 100000).
    pub max_pending_requests: Option<usize>,
    /// Attempts made by [`TsoClient::get_timestamp`] (default: 3).
    pub max_attempts: Option<u32>,
    /// Pause between those attempts (default: 50).
    pub retry_delay_ms: Option<u64>,
}

impl TsoClientConfig {
    /// Config for a fixed leader at `addr`.
    pub fn with_server(addr: impl Into<String>) -> Self {
        Self {
            server_addr: Some(addr.into()),
            ..Self::default()
        }
    }

    fn root_path(&self) -> &str {
        self.root_path.as_deref().unwrap_or(DEFAULT_ROOT_PATH)
    }

    fn discovery_retry(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_ms.unwrap_or(DEFAULT_DISCOVERY_RETRY_MS))
    }

    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            connect_timeout: Duration::from_millis(
                self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            io_timeout: Duration::from_millis(self.io_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS)),
            reconnect_delay: Duration::from_millis(
                self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
        }
    }

    fn validate(&self) -> Result<(), TsoError> {
        if self.max_pending_requests == Some(0) {
            return Err(TsoError::Config("max_pending_requests must be positive".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(TsoError::Config("max_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Point-in-time client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsoClientStats {
    /// Requests accepted into the queue.
    pub requests_submitted: u64,
    /// Batches written and flushed.
    pub batches_flushed: u64,
    /// Requests resolved with a timestamp.
    pub timestamps_delivered: u64,
    /// Requests resolved with an error by the worker.
    pub requests_failed: u64,
    /// Connections successfully opened.
    pub sessions_opened: u64,
    /// Leader changes observed by the worker.
    pub leader_changes: u64,
}

/// Pipelined timestamp oracle client.
///
/// Must be created inside a Tokio runtime. Dropping the client shuts the
/// worker down and fails anything still outstanding with
/// [`TsoError::Shutdown`].
pub struct TsoClient {
    /// Submission queue shared with the worker.
    requests: mpsc::Sender<PendingRequest>,
    /// Leader locator in use.
    locator: Arc<dyn LeaderLocator>,
    /// Counters shared with the worker.
    stats: Arc<PipelineStats>,
    /// Attempts made by `get_timestamp`.
    max_attempts: u32,
    /// Pause between those attempts.
    retry_delay: Duration,
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TsoClient {
    /// Creates a client for the fixed leader in `config.server_addr`.
    pub fn new(config: TsoClientConfig) -> Result<Self, TsoError> {
        let addr = config
            .server_addr
            .clone()
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| {
                TsoError::Config("server_addr is required without a coordinator".into())
            })?;
        Self::with_locator(config, Arc::new(StaticTracker::new(addr)))
    }

    /// Creates a client that discovers the leader under `config.root_path`.
    ///
    /// `config.server_addr` is ignored.
    pub fn with_coordinator(
        config: TsoClientConfig,
        backend: Arc<dyn CoordinationBackend>,
    ) -> Result<Self, TsoError> {
        let tracker = DiscoveryTracker::new(backend, config.root_path(), config.discovery_retry());
        Self::with_locator(config, Arc::new(tracker))
    }

    /// Creates a client driven by an arbitrary leader locator.
    pub fn with_locator(
        config: TsoClientConfig,
        locator: Arc<dyn LeaderLocator>,
    ) -> Result<Self, TsoError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TsoError::Config("TsoClient must be created inside a Tokio runtime".into())
        })?;

        let capacity = config.max_pending_requests.unwrap_or(MAX_PIPELINE_REQUEST);
        let settings = config.pipeline_settings();
        info!(
            "Creating TsoClient (leader: {}, queue: {}, connect timeout: {:?}, io timeout: {:?})",
            locator.current_address().as_deref().unwrap_or("<discovering>"),
            capacity,
            settings.connect_timeout,
            settings.io_timeout
        );

        let (requests_tx, requests_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(PipelineStats::default());

        // Subscribe before starting so the first address is never missed.
        let leader_rx = locator.subscribe();
        locator.clone().start();

        let worker = PipelineWorker::new(
            requests_rx,
            locator.clone(),
            leader_rx,
            shutdown_rx,
            settings,
            stats.clone(),
        );
        runtime.spawn(worker.run());

        Ok(Self {
            requests: requests_tx,
            locator,
            stats,
            max_attempts: config.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry_delay: Duration::from_millis(
                config.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Queues a timestamp request and returns a handle to wait on.
    ///
    /// Only waits if the queue is full. A client that has shut down returns
    /// a handle already failed with [`TsoError::Shutdown`].
    pub async fn request_timestamp(&self) -> PendingTimestamp {
        let (req, pending) = PendingRequest::channel();
        match self.requests.send(req).await {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(req)) => req.resolve(Err(TsoError::Shutdown)),
        }
        pending
    }

    /// Blocking variant of [`TsoClient::request_timestamp`] for plain threads.
    ///
    /// Must not be called from within an async execution context.
    pub fn blocking_request_timestamp(&self) -> PendingTimestamp {
        let (req, pending) = PendingRequest::channel();
        match self.requests.blocking_send(req) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(req)) => req.resolve(Err(TsoError::Shutdown)),
        }
        pending
    }

    /// Gets one timestamp, retrying transient failures.
    ///
    /// A leader failover usually settles within a few attempts, so
    /// retryable errors are retried up to `max_attempts` times.
    pub async fn get_timestamp(&self) -> Result<Timestamp, TsoError> {
        let mut attempt = 1;
        loop {
            match self.request_timestamp().await.wait().await {
                Ok(ts) => return Ok(ts),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    debug!(
                        "Retrying tso request (attempt {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submits `count` requests back to back and waits for all of them.
    ///
    /// Results are in submission order. No retries.
    pub async fn get_timestamps(&self, count: usize) -> Vec<Result<Timestamp, TsoError>> {
        let mut pending = Vec::with_capacity(count);
        for _ in 0..count {
            pending.push(self.request_timestamp().await);
        }
        join_all(pending.into_iter().map(PendingTimestamp::wait)).await
    }

    /// Returns the locator's best-known leader address.
    pub fn leader(&self) -> Option<String> {
        self.locator.current_address()
    }

    /// Returns a snapshot of the client counters.
    pub fn stats(&self) -> TsoClientStats {
        TsoClientStats {
            requests_submitted: self.stats.submitted.load(Ordering::Relaxed),
            batches_flushed: self.stats.batches.load(Ordering::Relaxed),
            timestamps_delivered: self.stats.delivered.load(Ordering::Relaxed),
            requests_failed: self.stats.failed.load(Ordering::Relaxed),
            sessions_opened: self.stats.sessions.load(Ordering::Relaxed),
            leader_changes: self.stats.leader_changes.load(Ordering::Relaxed),
        }
    }

    /// Stops the worker. Outstanding requests fail with `Shutdown`.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            info!("Shutting down TsoClient");
            let _ = tx.send(());
        }
    }
}

impl Drop for TsoClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TsoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsoClient")
            .field("leader", &self.leader())
            .field("stats", &self.stats())
            .finish()
    }
}
