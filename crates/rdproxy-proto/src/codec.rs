//! Codec for encoding/decoding session messages

use crate::messages::SessionMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds the handshake limit")]
    MessageTooLarge(usize),

    #[error("Stream ended in the middle of a message")]
    IncompleteMessage,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session message codec
pub struct SessionCodec;

impl SessionCodec {
    /// Maximum handshake message size (64KB)
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Encode a session message to bytes
    ///
    /// Wire format: 4-byte big-endian length, then the bincode payload
    pub fn encode(msg: &SessionMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a session message from bytes
    ///
    /// Consumes one frame from `buf` when it is complete; `None` means
    /// more bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<SessionMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: SessionMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Write one framed message to an async writer
    pub async fn write_message<W>(writer: &mut W, msg: &SessionMessage) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = Self::encode(msg)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one framed message from an async reader
    ///
    /// Reads only the bytes of that message, so whatever follows on the
    /// stream is left untouched for the byte relay. Returns `None` when the
    /// stream ends cleanly before the first byte.
    pub async fn read_message<R>(reader: &mut R) -> Result<Option<SessionMessage>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < length_bytes.len() {
            let n = reader.read(&mut length_bytes[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(CodecError::IncompleteMessage);
            }
            filled += n;
        }

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CodecError::IncompleteMessage
            } else {
                CodecError::Io(e)
            }
        })?;

        Ok(Some(bincode::deserialize(&payload)?))
    }
}
