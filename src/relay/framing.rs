//! Wire protocol codec for the relay.
//!
//! Every unit on the wire is a length-prefixed frame:
//!
//! ```text
//! [10-byte ASCII decimal length, left-justified, space-padded] [payload]
//! ```
//!
//! For example the payload `hi` is sent as `b"2         hi"`.
//!
//! Client → relay: the first frame carries the display name, every later
//! frame is one message body. Relay → client: each forwarded chat message
//! is two frames back to back, sender name then body (see [`encode_message`]).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 10;

/// Largest payload whose length still fits in [`HEADER_LEN`] decimal digits.
pub const MAX_PAYLOAD_LEN: u64 = 9_999_999_999;

/// Initial buffer reservation when reading a payload. Larger payloads grow
/// as bytes actually arrive instead of trusting the declared length.
const READ_RESERVE: u64 = 64 * 1024;

/// Errors produced while encoding or reading frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream before a full header arrived.
    ///
    /// This is the graceful end of a connection, not a protocol violation.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The peer closed the stream in the middle of a payload.
    #[error("incomplete frame: expected {expected} payload bytes, received {received}")]
    IncompleteFrame {
        /// Payload length declared by the header.
        expected: u64,
        /// Payload bytes actually received before EOF.
        received: u64,
    },

    /// The header is not a space-padded non-negative decimal integer.
    #[error("malformed frame header: {0:?}")]
    MalformedHeader(String),

    /// The payload length exceeds what the header can express or what the
    /// reader is willing to accept.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True for a clean peer close, false for protocol or transport errors.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// True for errors caused by the peer violating the wire format.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::IncompleteFrame { .. } | Self::MalformedHeader(_) | Self::FrameTooLarge(_)
        )
    }
}

/// Encode a payload into a wire-format frame.
///
/// Returns `[10-byte header][payload]`.
///
/// # Errors
///
/// [`FrameError::FrameTooLarge`] if the payload length needs more than
/// [`HEADER_LEN`] decimal digits.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = payload.len() as u64;
    if length > MAX_PAYLOAD_LEN {
        return Err(FrameError::FrameTooLarge(length));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(format!("{:<width$}", length, width = HEADER_LEN).as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a chat message as two consecutive frames: sender name, then body.
pub fn encode_message(name: &[u8], body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut buf = encode(name)?;
    buf.extend_from_slice(&encode(body)?);
    Ok(buf)
}

/// Parse a frame header into the payload length.
///
/// Only the first [`HEADER_LEN`] bytes are considered. Surrounding
/// whitespace padding is trimmed; what remains must be ASCII digits.
///
/// # Errors
///
/// - [`FrameError::ConnectionClosed`] if `header` is empty (the read that
///   produced it hit EOF).
/// - [`FrameError::MalformedHeader`] otherwise when parsing fails.
pub fn decode_header(header: &[u8]) -> Result<u64, FrameError> {
    if header.is_empty() {
        return Err(FrameError::ConnectionClosed);
    }
    let header = &header[..header.len().min(HEADER_LEN)];
    let malformed = || FrameError::MalformedHeader(String::from_utf8_lossy(header).into_owned());

    let Ok(text) = std::str::from_utf8(header) else {
        return Err(malformed());
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    trimmed
        .parse::<u64>()
        .map_err(|e| FrameError::MalformedHeader(format!("{trimmed:?} ({e})")))
}

/// Read one complete frame and return its payload.
///
/// Accumulates partial reads until the header and the full payload have
/// arrived.
///
/// # Errors
///
/// - [`FrameError::ConnectionClosed`] if the stream ends before a full header.
/// - [`FrameError::IncompleteFrame`] if the stream ends mid-payload.
/// - [`FrameError::MalformedHeader`] for a garbage header.
/// - [`FrameError::Io`] for transport errors.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    read_frame_limited(reader, MAX_PAYLOAD_LEN).await
}

/// Like [`read_frame`], but rejects frames declaring more than `max_len`
/// payload bytes with [`FrameError::FrameTooLarge`] before reading them.
pub async fn read_frame_limited<R>(reader: &mut R, max_len: u64) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        filled += n;
    }

    let expected = decode_header(&header)?;
    if expected > max_len {
        return Err(FrameError::FrameTooLarge(expected));
    }

    let mut payload = Vec::with_capacity(expected.min(READ_RESERVE) as usize);
    let received = (&mut *reader).take(expected).read_to_end(&mut payload).await? as u64;
    if received < expected {
        return Err(FrameError::IncompleteFrame { expected, received });
    }
    Ok(payload)
}

/// Read one chat message (two frames: name, then body).
pub async fn read_message<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>), FrameError>
where
    R: AsyncRead + Unpin,
{
    let name = read_frame(reader).await?;
    let body = read_frame(reader).await?;
    Ok((name, body))
}

/// Encode `payload` and write the whole frame to `writer`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode(payload)?;
    writer.write_all(&encoded).await?;
    Ok(())
}
