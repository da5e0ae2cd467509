//! Length-prefixed frame I/O over any duplex byte transport.

use plex_core::wire::{encode_frame, frame_len, Codec, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use plex_core::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

/// Anything a session can run over: TCP streams, Unix sockets, in-memory pipes.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Two connected in-memory transports, each end's writes readable from the other.
pub fn memory_pair(buffer: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(buffer)
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("cannot encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
}

impl TransportError {
    /// The byte stream can no longer be trusted; the session must end.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Io(_) => true,
            TransportError::Decode(e) => !e.is_malformed_body(),
            TransportError::Encode(_) => false,
        }
    }
}

/// Read one frame. `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R, codec: &dyn Codec) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(&len_buf)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(codec.decode(&body)?))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, codec: &dyn Codec, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(codec, frame)?;
    write_encoded(writer, &bytes).await
}

/// Write bytes already produced by `encode_frame` and flush.
pub async fn write_encoded<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
