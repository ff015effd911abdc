//! Buffered TCP connection to a TSO server.
//!
//! Writes accumulate in a large buffer and only reach the socket on
//! `flush`, so a batch of request headers costs one or a few syscalls.
//! Every read, write and flush is bounded by the same per-operation
//! deadline to avoid hanging on a half-open connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::codec;
use crate::errors::TsoError;
use crate::timestamp::Timestamp;

/// Capacity of the read and write buffers.
pub const CONN_BUFFER_SIZE: usize = 512 * 1024;

/// A connection exclusively owned by the pipeline worker.
pub struct Connection {
    addr: String,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<BufWriter<OwnedWriteHalf>>,
    io_timeout: Duration,
}

impl Connection {
    /// Connects to `addr` within `connect_timeout`.
    pub async fn open(
        addr: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, TsoError> {
        let connect_err = |source: io::Error| TsoError::Connect {
            addr: addr.to_string(),
            source: Arc::new(source),
        };

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                connect_err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", connect_timeout),
                ))
            })?
            .map_err(connect_err)?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        debug!("Opened connection to {}", addr);

        Ok(Self {
            addr: addr.to_string(),
            reader: Some(BufReader::with_capacity(CONN_BUFFER_SIZE, read_half)),
            writer: Some(BufWriter::with_capacity(CONN_BUFFER_SIZE, write_half)),
            io_timeout,
        })
    }

    /// Returns the server address this connection was opened to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Buffers `buf`; only blocks if the buffer must spill to the socket.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, TsoError> {
        let writer = self.writer.as_mut().ok_or_else(closed_error)?;
        tokio::time::timeout(self.io_timeout, writer.write(buf))
            .await
            .map_err(|_| TsoError::timed_out("write"))?
            .map_err(TsoError::from)
    }

    /// Buffers all of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), TsoError> {
        let writer = self.writer.as_mut().ok_or_else(closed_error)?;
        tokio::time::timeout(self.io_timeout, writer.write_all(buf))
            .await
            .map_err(|_| TsoError::timed_out("write"))?
            .map_err(TsoError::from)
    }

    /// Pushes all buffered output to the network.
    pub async fn flush(&mut self) -> Result<(), TsoError> {
        let writer = self.writer.as_mut().ok_or_else(closed_error)?;
        tokio::time::timeout(self.io_timeout, writer.flush())
            .await
            .map_err(|_| TsoError::timed_out("flush"))?
            .map_err(TsoError::from)
    }

    /// Reads whatever is available, up to `buf.len()` bytes.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TsoError> {
        let reader = self.reader.as_mut().ok_or_else(closed_error)?;
        tokio::time::timeout(self.io_timeout, reader.read(buf))
            .await
            .map_err(|_| TsoError::timed_out("read"))?
            .map_err(TsoError::from)
    }

    /// Reads and decodes exactly one response frame.
    pub async fn read_response(&mut self) -> Result<Timestamp, TsoError> {
        let reader = self.reader.as_mut().ok_or_else(closed_error)?;
        tokio::time::timeout(self.io_timeout, codec::read_response(reader))
            .await
            .map_err(|_| TsoError::timed_out("read"))?
    }

    /// Releases the socket. Unflushed output is discarded.
    ///
    /// Safe to call repeatedly and after errors.
    pub fn close(&mut self) {
        if self.writer.take().is_some() {
            debug!("Closed connection to {}", self.addr);
        }
        self.reader.take();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> TsoError {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed").into()
}
