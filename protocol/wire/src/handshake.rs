//! Connection handshake.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ContentType, DEFAULT_CONNECT_TIMEOUT_MS, MAGIC, MAX_FRAME_LEN, WireError};

/// Connection options exchanged once, before any request.
///
/// The client writes this record as a JSON frame immediately after the
/// transport is established; the server validates the magic number and
/// adopts the content type for everything that follows. Timeouts are in
/// milliseconds; zero means "use the receiving side's default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: u32,
    pub content_type: ContentType,
    #[serde(default)]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub handle_timeout_ms: u64,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            content_type: ContentType::Bincode,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handle_timeout_ms: 0,
        }
    }
}

impl Handshake {
    pub fn with_content_type(content_type: ContentType) -> Self {
        Self {
            content_type,
            ..Self::default()
        }
    }

    /// Serialize and send this handshake as the connection's first frame.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), WireError> {
        let payload = serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))?;
        w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        w.write_all(&payload).await?;
        w.flush().await?;
        Ok(())
    }

    /// Read and validate a handshake frame.
    ///
    /// A wrong magic number or an undecodable frame is fatal to the
    /// connection; the caller is expected to drop the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, WireError> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        let handshake: Handshake =
            serde_json::from_slice(&payload).map_err(|e| WireError::Decode(e.to_string()))?;
        if handshake.magic != MAGIC {
            return Err(WireError::BadMagic(handshake.magic));
        }
        Ok(handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let sent = Handshake {
            handle_timeout_ms: 2_000,
            ..Handshake::with_content_type(ContentType::Json)
        };
        sent.write_to(&mut client).await.unwrap();
        let got = Handshake::read_from(&mut server).await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let handshake = Handshake {
            magic: 0xdeadbeef,
            ..Handshake::default()
        };
        handshake.write_to(&mut client).await.unwrap();
        let err = Handshake::read_from(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::BadMagic(0xdeadbeef)));
    }

    #[tokio::test]
    async fn non_json_garbage_is_a_decode_error() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&5u32.to_be_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let err = Handshake::read_from(&mut server).await.unwrap_err();
        assert!(matches!(err, WireError::Decode(_)));
    }
}
