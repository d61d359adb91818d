//! Length-prefixed frame reader and writer halves.

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};

use crate::{ContentType, Header, MAX_FRAME_LEN, WireError};

/// Reads `(header, body)` frame pairs from the receive half of a stream.
pub struct WireReader<R> {
    inner: BufReader<R>,
    content_type: ContentType,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R, content_type: ContentType) -> Self {
        Self {
            inner: BufReader::new(inner),
            content_type,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Read the next header frame.
    ///
    /// Returns `None` on a clean end of stream, i.e. EOF landing exactly on
    /// a frame boundary. EOF in the middle of a frame is an error.
    pub async fn read_header(&mut self) -> Result<Option<Header>, WireError> {
        let Some(payload) = read_frame(&mut self.inner).await? else {
            return Ok(None);
        };
        Ok(Some(self.content_type.decode(&payload)?))
    }

    /// Read the body frame that follows a header.
    ///
    /// Every header must be followed by exactly one body read so the stream
    /// stays aligned; a caller that does not care about the payload simply
    /// drops the returned bytes.
    pub async fn read_body(&mut self) -> Result<Bytes, WireError> {
        match read_frame(&mut self.inner).await? {
            Some(payload) => Ok(payload),
            None => Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before body frame",
            ))),
        }
    }

    /// Read a single raw frame. Used for the handshake before a content
    /// type has been agreed.
    pub async fn read_raw_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        read_frame(&mut self.inner).await
    }
}

/// Writes `(header, body)` frame pairs to the send half of a stream.
pub struct WireWriter<W> {
    inner: BufWriter<W>,
    content_type: ContentType,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W, content_type: ContentType) -> Self {
        Self {
            inner: BufWriter::new(inner),
            content_type,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Write one header and its body, then flush.
    ///
    /// `body` must already be encoded in the negotiated content type; an
    /// empty slice writes the zero-length sentinel frame.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), WireError> {
        let header_bytes = self.content_type.encode(header)?;
        write_frame(&mut self.inner, &header_bytes).await?;
        write_frame(&mut self.inner, body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write a single raw frame and flush. Used for the handshake.
    pub async fn write_raw_frame(&mut self, payload: &[u8]) -> Result<(), WireError> {
        write_frame(&mut self.inner, payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the send half.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Bytes>, WireError> {
    let mut len_buf = [0u8; 4];
    // Distinguish clean EOF (no bytes at all) from a truncated prefix.
    match r.read(&mut len_buf[..1]).await? {
        0 => return Ok(None),
        _ => r.read_exact(&mut len_buf[1..]).await?,
    };
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(payload).await?;
    Ok(())
}
