//! tso-client
//!
//! Pipelined client for a timestamp oracle (TSO) server.
//!
//! ## Features
//!
//! - Many concurrent callers multiplexed onto one TCP connection
//! - One flush per batch of queued requests
//! - Strict in-order pairing of responses to requests
//! - Static leader address, or leader discovery through a coordination store
//! - Automatic failover and reconnect; batch-wide failure reporting
//!
//! ## Usage
//!
//! ```no_run
//! use tso_client::{TsoClient, TsoClientConfig};
//!
//! # async fn run() -> Result<(), tso_client::TsoError> {
//! let client = TsoClient::new(TsoClientConfig::with_server("127.0.0.1:1234"))?;
//!
//! // Fire off a request now, wait for it later.
//! let pending = client.request_timestamp().await;
//! let ts = pending.wait().await?;
//! println!("physical={} logical={}", ts.physical, ts.logical);
//!
//! // Or let the client retry through a leader failover.
//! let ts = client.get_timestamp().await?;
//! # let _ = ts;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]

mod client;
pub mod codec;
mod connection;
mod errors;
mod oracle;
mod pipeline;
mod timestamp;
pub mod tracker;

// Re-export main types
pub use client::{TsoClient, TsoClientConfig, TsoClientStats, MAX_PIPELINE_REQUEST};
pub use connection::{Connection, CONN_BUFFER_SIZE};
pub use errors::{TsoError, TsoErrorCode};
pub use oracle::LocalOracle;
pub use pipeline::PendingTimestamp;
pub use timestamp::Timestamp;
pub use tracker::{
    CoordinationBackend, DiscoveryTracker, LeaderLocator, LeaderRecord, MemoryCoordinator,
    StaticTracker,
};
