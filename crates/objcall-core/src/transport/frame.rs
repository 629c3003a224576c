//! Stream framing.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload. The payload is a [`Frame`], which tells the receiver whether the
//! body is a notification, a call awaiting an acknowledgment, or an
//! acknowledgment.
//!
//! ```text
//! [u32 BE: len][{"kind":"call","body":{...}}]
//! ```

use crate::config::TransportConfig;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Delivered without an acknowledgment.
    Emit { body: Value },
    /// Delivered with an acknowledgment expected.
    Call { body: Value },
    /// Acknowledgment of an earlier `Call`.
    Reply { body: Value },
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: payload.len(),
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_kind_tag() {
        let frame = Frame::Call {
            body: json!({"method": ".a", "params": [], "id": 1}),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "call");
        assert_eq!(json["body"]["method"], ".a");
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"{\"kind\":\"emit\",\"body\":null}";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, Some(payload.to_vec()));
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (TransportConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(RpcError::FrameTooLarge { .. })));
    }
}
