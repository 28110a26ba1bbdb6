//! Control socket message framing.
//!
//! Wire format:
//! - 2-byte big-endian message type
//! - 4-byte big-endian payload length
//! - payload (max 2MB)

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// OK response.
pub const TYPE_OK: u16 = 0;
/// Error response, payload is a human-readable reason.
pub const TYPE_ERROR: u16 = 1;
/// VPN config update from the transport callback, payload is JSON.
pub const TYPE_CONFIG_UPDATE: u16 = 2;

/// Maximum payload size (2MB)
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// A framed control socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub typ: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn ok() -> Self {
        Self {
            typ: TYPE_OK,
            payload: Vec::new(),
        }
    }

    pub fn error(reason: &str) -> Self {
        Self {
            typ: TYPE_ERROR,
            payload: reason.as_bytes().to_vec(),
        }
    }

    pub fn config_update(payload: Vec<u8>) -> Self {
        Self {
            typ: TYPE_CONFIG_UPDATE,
            payload,
        }
    }
}

/// Read a framed message from an async reader
pub async fn read_message<R>(reader: &mut R) -> io::Result<Message>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; 6];
    reader.read_exact(&mut header).await?;

    let typ = u16::from_be_bytes([header[0], header[1]]);
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

    if len > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {})", len, MAX_PAYLOAD_SIZE),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Message { typ, payload })
}

/// Write a framed message to an async writer
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if message.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Message too large: {} bytes (max {})",
                message.payload.len(),
                MAX_PAYLOAD_SIZE
            ),
        ));
    }

    writer.write_all(&message.typ.to_be_bytes()).await?;
    writer
        .write_all(&(message.payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(&message.payload).await?;
    writer.flush().await?;

    Ok(())
}
