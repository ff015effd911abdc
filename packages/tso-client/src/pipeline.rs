//! Pipelined request worker.
//!
//! One background task owns the leader connection. It drains every queued
//! request into an in-flight list, writes one header per request, flushes
//! once, then reads the same number of responses and resolves requests in
//! the order they were written. The protocol carries no request id, so
//! that order is the only thing pairing a response with its caller.
//!
//! Any I/O or decode failure, a leader change, or shutdown fails the whole
//! in-flight list and everything still queued behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::codec;
use crate::connection::Connection;
use crate::errors::TsoError;
use crate::timestamp::Timestamp;
use crate::tracker::{LeaderLocator, LeaderReceiver};

type Reply = Result<Timestamp, TsoError>;

/// Stands in for a leader address when a locator withdraws the leader.
const NO_LEADER: &str = "<none>";

/// One queued or in-flight request, owned by the worker.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    reply: oneshot::Sender<Reply>,
}

impl PendingRequest {
    pub(crate) fn channel() -> (Self, PendingTimestamp) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, PendingTimestamp { rx })
    }

    /// Completes the request. Consumes it, so it can only happen once.
    pub(crate) fn resolve(self, result: Reply) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

/// Handle for a submitted timestamp request.
#[derive(Debug)]
#[must_use = "a timestamp request does nothing unless waited on"]
pub struct PendingTimestamp {
    rx: oneshot::Receiver<Reply>,
}

impl PendingTimestamp {
    /// Waits until the worker resolves this request.
    pub async fn wait(self) -> Result<Timestamp, TsoError> {
        self.rx.await.unwrap_or(Err(TsoError::Shutdown))
    }

    /// Blocks the current thread until the request is resolved.
    ///
    /// Must not be called from within an async execution context.
    pub fn blocking_wait(self) -> Result<Timestamp, TsoError> {
        self.rx.blocking_recv().unwrap_or(Err(TsoError::Shutdown))
    }
}

/// Counters shared between the client and its worker.
#[derive(Debug, Default)]
pub(crate) struct PipelineStats {
    pub submitted: AtomicU64,
    pub batches: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub sessions: AtomicU64,
    pub leader_changes: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub reconnect_delay: Duration,
}

enum SessionEnd {
    Shutdown,
    Failed(TsoError),
}

pub(crate) struct PipelineWorker {
    requests: mpsc::Receiver<PendingRequest>,
    leader_rx: LeaderReceiver,
    /// Keeps the locator, and so the sending side of `leader_rx`, alive.
    _locator: Arc<dyn LeaderLocator>,
    shutdown_rx: oneshot::Receiver<()>,
    settings: PipelineSettings,
    stats: Arc<PipelineStats>,
    /// Drained from the queue, in write order, not yet answered.
    in_flight: VecDeque<PendingRequest>,
    /// Leader address of the current or last session.
    addr: String,
}

impl PipelineWorker {
    pub(crate) fn new(
        requests: mpsc::Receiver<PendingRequest>,
        locator: Arc<dyn LeaderLocator>,
        leader_rx: LeaderReceiver,
        shutdown_rx: oneshot::Receiver<()>,
        settings: PipelineSettings,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            requests,
            leader_rx,
            _locator: locator,
            shutdown_rx,
            settings,
            stats,
            in_flight: VecDeque::new(),
            addr: String::new(),
        }
    }

    /// Runs until the client shuts down.
    pub(crate) async fn run(mut self) {
        loop {
            let Some(addr) = self.wait_for_leader().await else {
                break;
            };
            self.addr = addr;
            debug!("Connecting to tso server {}", self.addr);

            match self.serve().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(err) => {
                    warn!("Tso session with {} failed: {}", self.addr, err);
                    self.fail_all(&err);
                }
            }

            if !self.pause_before_reconnect().await {
                break;
            }
        }

        self.requests.close();
        self.fail_all(&TsoError::Shutdown);
        debug!("Tso pipeline worker stopped");
    }

    /// Blocks until the locator names a leader. `None` means shutdown.
    async fn wait_for_leader(&mut self) -> Option<String> {
        loop {
            let current = self.leader_rx.borrow_and_update().clone();
            if let Some(addr) = current {
                return Some(addr);
            }
            tokio::select! {
                biased;
                _ = &mut self.shutdown_rx => return None,
                changed = self.leader_rx.changed() => {
                    if changed.is_err() {
                        // The locator went away without ever naming a leader.
                        let _ = (&mut self.shutdown_rx).await;
                        return None;
                    }
                }
            }
        }
    }

    /// One connection lifetime: connect, then round trips until failure.
    async fn serve(&mut self) -> SessionEnd {
        let opened = tokio::select! {
            biased;
            _ = &mut self.shutdown_rx => return SessionEnd::Shutdown,
            opened = Connection::open(
                &self.addr,
                self.settings.connect_timeout,
                self.settings.io_timeout,
            ) => opened,
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(err) => return SessionEnd::Failed(err),
        };
        debug!("Connected to tso server {}", self.addr);
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);

        let end = loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown_rx => break SessionEnd::Shutdown,
                to = leader_changed(&mut self.leader_rx) => break self.leader_change(to),
                req = self.requests.recv() => {
                    let Some(req) = req else {
                        break SessionEnd::Shutdown;
                    };
                    self.in_flight.push_back(req);
                    while let Ok(req) = self.requests.try_recv() {
                        self.in_flight.push_back(req);
                    }

                    tokio::select! {
                        biased;
                        _ = &mut self.shutdown_rx => break SessionEnd::Shutdown,
                        to = leader_changed(&mut self.leader_rx) => break self.leader_change(to),
                        result = round_trip(&mut conn, &mut self.in_flight, &self.stats) => {
                            if let Err(err) = result {
                                break SessionEnd::Failed(err);
                            }
                        }
                    }
                }
            }
        };

        conn.close();
        end
    }

    fn leader_change(&mut self, to: Option<String>) -> SessionEnd {
        self.stats.leader_changes.fetch_add(1, Ordering::Relaxed);
        SessionEnd::Failed(TsoError::LeaderChanged {
            from: self.addr.clone(),
            to: to.unwrap_or_else(|| NO_LEADER.to_string()),
        })
    }

    /// Waits before the next connection attempt. `false` means shutdown.
    async fn pause_before_reconnect(&mut self) -> bool {
        let delay = self.settings.reconnect_delay;
        tokio::select! {
            biased;
            _ = &mut self.shutdown_rx => false,
            to = leader_changed(&mut self.leader_rx) => {
                // A dead leader fails the connect immediately, so the change
                // often shows up here rather than mid-session.
                warn!(
                    "Tso leader change {} -> {}",
                    self.addr,
                    to.as_deref().unwrap_or(NO_LEADER)
                );
                self.stats.leader_changes.fetch_add(1, Ordering::Relaxed);
                // Let the new leader start accepting connections.
                tokio::select! {
                    biased;
                    _ = &mut self.shutdown_rx => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Fails every in-flight and queued request with `err`.
    fn fail_all(&mut self, err: &TsoError) {
        let mut failed: Vec<PendingRequest> = self.in_flight.drain(..).collect();
        while let Ok(req) = self.requests.try_recv() {
            failed.push(req);
        }
        if failed.is_empty() {
            return;
        }

        self.stats.failed.fetch_add(failed.len() as u64, Ordering::Relaxed);
        warn!("Failing {} pending tso requests: {}", failed.len(), err);
        for req in failed {
            req.resolve(Err(err.clone()));
        }
    }
}

/// Resolves on the next leader change. Never resolves once the locator is gone.
async fn leader_changed(leader_rx: &mut LeaderReceiver) -> Option<String> {
    if leader_rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
    leader_rx.borrow_and_update().clone()
}

/// Writes one header per in-flight request, flushes, and resolves each
/// request with the response in the same position.
///
/// Cancel safe with respect to `in_flight`: a request is only removed once
/// its response has been decoded.
async fn round_trip(
    conn: &mut Connection,
    in_flight: &mut VecDeque<PendingRequest>,
    stats: &PipelineStats,
) -> Result<(), TsoError> {
    let header = codec::encode_request_header();
    for _ in 0..in_flight.len() {
        conn.write_all(&header).await?;
    }
    conn.flush().await?;
    stats.batches.fetch_add(1, Ordering::Relaxed);

    while !in_flight.is_empty() {
        let ts = conn.read_response().await?;
        if let Some(req) = in_flight.pop_front() {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            req.resolve(Ok(ts));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TsoErrorCode;
    use crate::tracker::StaticTracker;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn worker(addr: &str) -> PipelineWorker {
        let (_requests_tx, requests_rx) = mpsc::channel(4);
        let locator: Arc<dyn LeaderLocator> = Arc::new(StaticTracker::new(addr));
        let leader_rx = locator.subscribe();
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let settings = PipelineSettings {
            connect_timeout: TIMEOUT,
            io_timeout: TIMEOUT,
            reconnect_delay: Duration::from_millis(10),
        };
        let mut worker = PipelineWorker::new(
            requests_rx,
            locator,
            leader_rx,
            shutdown_rx,
            settings,
            Arc::default(),
        );
        worker.addr = addr.to_string();
        worker
    }

    #[test]
    fn test_withdrawn_leader_is_named_in_error() {
        let mut worker = worker("127.0.0.1:1");
        match worker.leader_change(None) {
            SessionEnd::Failed(TsoError::LeaderChanged { from, to }) => {
                assert_eq!(from, "127.0.0.1:1");
                assert_eq!(to, NO_LEADER);
            }
            _ => panic!("expected a leader change"),
        }
        assert_eq!(worker.stats.leader_changes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch_for_fail_all() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut conn = Connection::open(&addr, TIMEOUT, TIMEOUT).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        // Closing with unread input makes the peer reset the connection.
        conn.write_all(&codec::encode_request_header()).await.unwrap();
        conn.flush().await.unwrap();
        server.readable().await.unwrap();
        drop(server);
        let mut buf = [0u8; 1];
        assert!(conn.read(&mut buf).await.is_err());

        let mut worker = worker(&addr);
        let mut waiting = Vec::new();
        for _ in 0..3 {
            let (req, pending) = PendingRequest::channel();
            worker.in_flight.push_back(req);
            waiting.push(pending);
        }

        let err = round_trip(&mut conn, &mut worker.in_flight, &worker.stats)
            .await
            .unwrap_err();
        assert_eq!(err.code(), TsoErrorCode::IoError);
        assert_eq!(worker.in_flight.len(), 3);
        assert_eq!(worker.stats.batches.load(Ordering::Relaxed), 0);
        assert_eq!(worker.stats.delivered.load(Ordering::Relaxed), 0);

        worker.fail_all(&err);
        assert!(worker.in_flight.is_empty());
        assert_eq!(worker.stats.failed.load(Ordering::Relaxed), 3);
        for pending in waiting {
            let failed = pending.wait().await.unwrap_err();
            assert_eq!(failed.code(), TsoErrorCode::IoError);
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let (req, pending) = PendingRequest::channel();
        req.resolve(Ok(Timestamp::new(1, 2)));
        assert_eq!(pending.wait().await.unwrap(), Timestamp::new(1, 2));
    }

    #[tokio::test]
    async fn test_dropped_request_reads_as_shutdown() {
        let (req, pending) = PendingRequest::channel();
        drop(req);
        assert!(matches!(pending.wait().await, Err(TsoError::Shutdown)));
    }

    #[test]
    fn test_blocking_wait() {
        let (req, pending) = PendingRequest::channel();
        let waiter = std::thread::spawn(move || pending.blocking_wait());
        req.resolve(Err(TsoError::Shutdown));
        assert!(matches!(waiter.join().unwrap(), Err(TsoError::Shutdown)));
    }

    #[test]
    fn test_resolve_after_caller_gave_up() {
        let (req, pending) = PendingRequest::channel();
        drop(pending);
        req.resolve(Ok(Timestamp::default()));
    }
}
