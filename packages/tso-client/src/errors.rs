//! TSO error types and classification.
//!
//! A single failure is broadcast to every request in a batch, so errors are
//! cheap to clone: I/O sources are shared behind an `Arc`.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced to callers waiting on a timestamp.
#[derive(Debug, Clone, Error)]
pub enum TsoError {
    /// Could not establish the TCP connection to the leader.
    #[error("failed to connect to tso server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },
    /// A write, flush or read on the leader connection failed or timed out.
    #[error("tso connection i/o failed: {0}")]
    Io(#[source] Arc<io::Error>),
    /// The response stream ended or stalled before a full response arrived.
    #[error("failed to decode tso response: {0}")]
    Decode(#[source] Arc<io::Error>),
    /// A leader change preempted the batch this request belonged to.
    #[error("tso leader changed {from} -> {to}")]
    LeaderChanged { from: String, to: String },
    /// The coordination backend could not be used to locate the leader.
    #[error("tso leader discovery failed: {0}")]
    Discovery(String),
    /// The client was built with an unusable configuration.
    #[error("invalid tso client config: {0}")]
    Config(String),
    /// The client was shut down before the request completed.
    #[error("tso client is shut down")]
    Shutdown,
}

impl From<io::Error> for TsoError {
    fn from(err: io::Error) -> Self {
        TsoError::Io(Arc::new(err))
    }
}

impl TsoError {
    /// Builds the error reported when an I/O deadline fires.
    pub fn timed_out(operation: &str) -> Self {
        TsoError::Io(Arc::new(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out", operation),
        )))
    }

    /// Returns the stable code for this error.
    pub fn code(&self) -> TsoErrorCode {
        match self {
            TsoError::Connect { .. } => TsoErrorCode::ConnectionFailed,
            TsoError::Io(err) if err.kind() == io::ErrorKind::TimedOut => TsoErrorCode::Timeout,
            TsoError::Io(_) => TsoErrorCode::IoError,
            TsoError::Decode(_) => TsoErrorCode::DecodeFailed,
            TsoError::LeaderChanged { .. } => TsoErrorCode::LeaderChanged,
            TsoError::Discovery(_) => TsoErrorCode::DiscoveryFailed,
            TsoError::Config(_) => TsoErrorCode::InvalidConfig,
            TsoError::Shutdown => TsoErrorCode::Shutdown,
        }
    }

    /// Returns whether retrying the request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// Error codes for programmatic handling and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TsoErrorCode {
    /// Failed to establish the TCP connection to the leader.
    ConnectionFailed,
    /// The connection broke during a write, flush or read.
    IoError,
    /// A connect or I/O deadline elapsed.
    Timeout,
    /// A response was truncated or the stream desynchronized.
    DecodeFailed,
    /// The leader moved while the request was queued or in flight.
    LeaderChanged,
    /// The coordination backend was unreachable or returned garbage.
    DiscoveryFailed,
    /// Client configuration was rejected.
    InvalidConfig,
    /// The client no longer accepts or serves requests.
    Shutdown,
}

impl TsoErrorCode {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TsoErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            TsoErrorCode::IoError => "IO_ERROR",
            TsoErrorCode::Timeout => "TIMEOUT",
            TsoErrorCode::DecodeFailed => "DECODE_FAILED",
            TsoErrorCode::LeaderChanged => "LEADER_CHANGED",
            TsoErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            TsoErrorCode::InvalidConfig => "INVALID_CONFIG",
            TsoErrorCode::Shutdown => "SHUTDOWN",
        }
    }

    /// Returns whether this error is retryable.
    ///
    /// Transport and failover errors are expected to clear once the worker
    /// reconnects; configuration and shutdown errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TsoErrorCode::ConnectionFailed
                | TsoErrorCode::IoError
                | TsoErrorCode::Timeout
                | TsoErrorCode::DecodeFailed
                | TsoErrorCode::LeaderChanged
        )
    }
}

impl fmt::Display for TsoErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(TsoErrorCode::ConnectionFailed.as_str(), "CONNECTION_FAILED");
        assert_eq!(TsoErrorCode::LeaderChanged.as_str(), "LEADER_CHANGED");
        assert_eq!(TsoErrorCode::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_classification() {
        let timeout = TsoError::timed_out("read");
        assert_eq!(timeout.code(), TsoErrorCode::Timeout);

        let reset: TsoError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(reset.code(), TsoErrorCode::IoError);

        let changed = TsoError::LeaderChanged {
            from: "a:1".into(),
            to: "b:2".into(),
        };
        assert_eq!(changed.code(), TsoErrorCode::LeaderChanged);
        assert_eq!(changed.to_string(), "tso leader changed a:1 -> b:2");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TsoErrorCode::ConnectionFailed.is_retryable());
        assert!(TsoErrorCode::IoError.is_retryable());
        assert!(TsoErrorCode::Timeout.is_retryable());
        assert!(TsoErrorCode::DecodeFailed.is_retryable());
        assert!(TsoErrorCode::LeaderChanged.is_retryable());
        assert!(!TsoErrorCode::DiscoveryFailed.is_retryable());
        assert!(!TsoErrorCode::InvalidConfig.is_retryable());
        assert!(!TsoErrorCode::Shutdown.is_retryable());
    }

    #[test]
    fn test_clone_shares_source() {
        let err = TsoError::Decode(Arc::new(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "early eof",
        )));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(std::error::Error::source(&copy).is_some());
    }
}
