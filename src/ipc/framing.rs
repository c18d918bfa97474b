//! Header + payload message framing.
//!
//! Two readers share the same wire format (see [`Header`]):
//!
//! - [`MessageReader`] is a push-driven state machine for non-blocking
//!   sockets. Bytes arrive in arbitrary chunks through
//!   [`MessageReader::feed`]; complete messages come out.
//! - [`read_message`] / [`write_message`] are the async equivalents for tokio
//!   streams, used by the server side.
//!
//! A header whose payload length exceeds the configured ceiling is fatal:
//! the stream can no longer be resynchronized.

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{Header, Message, HEADER_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Declared or actual payload length over the ceiling.
    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: u64, max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingHeader,
    AwaitingPayload(Header),
}

/// Incremental message decoder.
#[derive(Debug)]
pub struct MessageReader {
    state: ReadState,
    buf: Vec<u8>,
    max_payload: u32,
    failure: Option<FramingError>,
}

impl MessageReader {
    pub fn new(max_payload: u32) -> Self {
        Self {
            state: ReadState::AwaitingHeader,
            buf: Vec::new(),
            max_payload,
            failure: None,
        }
    }

    /// Append `bytes` and return every message now complete, in order.
    ///
    /// A header over the ceiling stops decoding for good. Messages completed
    /// earlier in the same call are still returned; [`MessageReader::failure`]
    /// then reports the error and later calls fail with it.
    ///
    /// # Errors
    ///
    /// Returns `FramingError::PayloadTooLarge` when the reader has failed and
    /// this call produced no messages.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, FramingError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut consumed = 0;

        loop {
            let available = &self.buf[consumed..];
            match self.state {
                ReadState::AwaitingHeader => {
                    let Some(raw) = available.first_chunk::<HEADER_LEN>() else {
                        break;
                    };
                    let header = Header::decode(raw);
                    if header.payload_len > self.max_payload {
                        let err = FramingError::PayloadTooLarge {
                            len: u64::from(header.payload_len),
                            max: self.max_payload,
                        };
                        self.failure = Some(err.clone());
                        self.buf.clear();
                        if out.is_empty() {
                            return Err(err);
                        }
                        return Ok(out);
                    }
                    consumed += HEADER_LEN;
                    self.state = ReadState::AwaitingPayload(header);
                }
                ReadState::AwaitingPayload(header) => {
                    let len = header.payload_len as usize;
                    if available.len() < len {
                        break;
                    }
                    out.push(Message::new(
                        header.object_id,
                        header.command_id,
                        header.cookie,
                        available[..len].to_vec(),
                    ));
                    consumed += len;
                    self.state = ReadState::AwaitingHeader;
                }
            }
        }

        self.buf.drain(..consumed);
        Ok(out)
    }

    /// Bytes held back waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether a header has been parsed and its payload is outstanding.
    pub fn mid_message(&self) -> bool {
        matches!(self.state, ReadState::AwaitingPayload(_))
    }

    /// The error that stopped decoding, if any.
    pub fn failure(&self) -> Option<&FramingError> {
        self.failure.as_ref()
    }
}

/// Read one message from an async stream.
///
/// # Errors
///
/// Returns an error if:
/// - The stream is closed before a header arrives
/// - The header declares a payload over `max_payload`
/// - The payload cannot be read completely
pub async fn read_message<R>(reader: &mut R, max_payload: u32) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(anyhow!("Connection closed by peer"));
        }
        Err(e) => return Err(e).context("Failed to read message header"),
    }

    let header = Header::decode(&raw);
    if header.payload_len > max_payload {
        return Err(FramingError::PayloadTooLarge {
            len: u64::from(header.payload_len),
            max: max_payload,
        }
        .into());
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("Failed to read message payload")?;

    Ok(Message::new(header.object_id, header.command_id, header.cookie, payload))
}

/// Write one message to an async stream and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message, max_payload: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes(max_payload)?;
    writer
        .write_all(&bytes)
        .await
        .context("Failed to write message")?;
    writer.flush().await.context("Failed to flush message")?;
    Ok(())
}
