//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use tso_client::codec::encode_response;
use tso_client::{LocalOracle, Timestamp, TsoClientConfig};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub const ROOT_PATH: &str = "/zk/tso";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How a mock server answers request bytes.
#[derive(Clone)]
pub enum Reply {
    /// One timestamp per request byte from a shared oracle.
    Oracle(Arc<LocalOracle>),
    /// `physical` is the request's position on its connection, `logical` twice that.
    Sequence,
    /// Reads at least this many request bytes, then drops the connection unanswered.
    CloseAfter(usize),
    /// Reads requests and never answers.
    Silent,
}

/// A TSO server speaking the legacy one-byte / sixteen-byte protocol.
pub struct MockServer {
    pub addr: String,
    received: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        let task = tokio::spawn(async move {
            // Dropping the set on abort closes every accepted connection.
            let mut conns = JoinSet::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                conns.spawn(serve_conn(stream, reply.clone(), counter.clone()));
            }
        });

        Self {
            addr,
            received,
            task,
        }
    }

    /// Total request bytes read across all connections.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Stops listening and drops every open connection.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_conn(mut stream: TcpStream, reply: Reply, received: Arc<AtomicUsize>) {
    let mut buf = [0u8; 4096];
    let mut seq = 0i64;
    let mut total = 0usize;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        received.fetch_add(n, Ordering::SeqCst);
        total += n;

        let mut out = Vec::with_capacity(n * 16);
        match &reply {
            Reply::Oracle(oracle) => {
                for _ in 0..n {
                    out.extend_from_slice(&encode_response(&oracle.next()));
                }
            }
            Reply::Sequence => {
                for _ in 0..n {
                    out.extend_from_slice(&encode_response(&Timestamp::new(seq, seq * 2)));
                    seq += 1;
                }
            }
            Reply::CloseAfter(limit) => {
                if total >= *limit {
                    return;
                }
            }
            Reply::Silent => {}
        }

        if !out.is_empty() && stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Client config tuned for fast tests.
pub fn fast_config() -> TsoClientConfig {
    TsoClientConfig {
        root_path: Some(ROOT_PATH.to_string()),
        connect_timeout_ms: Some(500),
        io_timeout_ms: Some(2_000),
        reconnect_delay_ms: Some(20),
        discovery_retry_ms: Some(10),
        retry_delay_ms: Some(20),
        ..TsoClientConfig::default()
    }
}

/// Polls `cond` until it holds, panicking after [`WAIT`].
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
