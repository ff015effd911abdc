//! Wire codec for the legacy TSO protocol.
//!
//! Requests are a single marker byte each, with no payload and no request
//! id. Responses are fixed 16-byte frames: big-endian `physical` followed by
//! big-endian `logical`. Pairing is purely positional, so a short or long
//! response desynchronizes the whole connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::TsoError;
use crate::timestamp::Timestamp;

/// Marker byte sent for each timestamp request.
pub const REQUEST_HEADER: u8 = 0;

/// Size of one encoded response frame.
pub const RESPONSE_LEN: usize = 16;

/// Encodes one request header.
pub fn encode_request_header() -> [u8; 1] {
    [REQUEST_HEADER]
}

/// Encodes a timestamp as a response frame (server side).
pub fn encode_response(ts: &Timestamp) -> [u8; RESPONSE_LEN] {
    let mut frame = [0u8; RESPONSE_LEN];
    frame[..8].copy_from_slice(&ts.physical.to_be_bytes());
    frame[8..].copy_from_slice(&ts.logical.to_be_bytes());
    frame
}

/// Decodes a complete response frame.
pub fn decode_frame(frame: &[u8; RESPONSE_LEN]) -> Timestamp {
    let mut physical = [0u8; 8];
    let mut logical = [0u8; 8];
    physical.copy_from_slice(&frame[..8]);
    logical.copy_from_slice(&frame[8..]);
    Timestamp {
        physical: i64::from_be_bytes(physical),
        logical: i64::from_be_bytes(logical),
    }
}

/// Reads exactly one response frame from `reader`.
///
/// Either all 16 bytes are consumed and a timestamp is produced, or a
/// `Decode` error wrapping the underlying I/O failure is returned.
pub async fn read_response<R>(reader: &mut R) -> Result<Timestamp, TsoError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; RESPONSE_LEN];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| TsoError::Decode(Arc::new(e)))?;
    Ok(decode_frame(&frame))
}
