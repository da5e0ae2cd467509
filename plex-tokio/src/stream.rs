//! Stream channels on the tokio side: caller proxies and the pumps that move data
//! between a local stream and the session.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{SinkExt, Stream, StreamExt};
use plex_core::{ChannelKey, Encoding, StreamSpec, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::method::{LocalStream, StreamFuture};
use crate::peer::Command;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("remote stream failed: {0}")]
    Remote(String),
    #[error("channel closed")]
    Closed,
    #[error("unexpected payload on a byte stream")]
    UnexpectedPayload,
    #[error("stream is not valid utf-8")]
    InvalidUtf8,
}

/// Item queued for the local consumer of an inbound channel.
pub(crate) type Inbound = Result<Value, StreamError>;

/// Decodes UTF-8 across chunk boundaries; a character split between two reads is held
/// back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_owned();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                let rest = self.pending.split_off(e.valid_up_to());
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = rest;
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    /// Whatever is left at end of stream (a truncated character), lossily decoded.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(out)
    }
}

/// Bytes carried by a byte-stream chunk.
fn payload_bytes(value: &Value) -> Result<&[u8], StreamError> {
    match value {
        Value::Bytes(b) => Ok(b),
        Value::Str(s) => Ok(s.as_bytes()),
        _ => Err(StreamError::UnexpectedPayload),
    }
}

/// Turn raw bytes into a chunk value for `encoding`. `None` when a UTF-8 read ended
/// mid-character and nothing complete is available yet.
fn byte_chunk(encoding: Encoding, carry: &mut Utf8Carry, bytes: &[u8]) -> Option<Value> {
    match encoding {
        Encoding::Binary => Some(Value::Bytes(bytes.to_vec())),
        Encoding::Utf8 => {
            let s = carry.push(bytes);
            (!s.is_empty()).then_some(Value::Str(s))
        }
    }
}

/// Caller-side proxy for a channel the remote writes into.
pub struct RemoteReader {
    key: ChannelKey,
    spec: StreamSpec,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
}

impl RemoteReader {
    pub(crate) fn new(
        key: ChannelKey,
        spec: StreamSpec,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            key,
            spec,
            inbox,
            commands,
            finished: false,
        }
    }

    pub fn spec(&self) -> StreamSpec {
        self.spec
    }

    /// Next chunk, or `None` once the remote ended the stream.
    pub async fn recv(&mut self) -> Option<Result<Value, StreamError>> {
        self.next().await
    }

    /// Concatenate every byte chunk until end of stream.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.extend_from_slice(payload_bytes(&item?)?);
        }
        Ok(out)
    }

    pub async fn read_to_string(self) -> Result<String, StreamError> {
        String::from_utf8(self.read_to_end().await?).map_err(|_| StreamError::InvalidUtf8)
    }

    /// Every value until end of stream (object mode).
    pub async fn collect_values(mut self) -> Result<Vec<Value>, StreamError> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl Stream for RemoteReader {
    type Item = Result<Value, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inbox.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if item.is_ok() {
                    let _ = self.commands.send(Command::Consumed(self.key, 1));
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RemoteReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .commands
                .send(Command::Fail(self.key, "reader dropped".to_string()));
        }
    }
}

/// Caller-side proxy for a channel the remote reads from. Dropping it ends the channel.
pub struct RemoteWriter {
    key: ChannelKey,
    spec: StreamSpec,
    credits: Arc<Semaphore>,
    commands: mpsc::UnboundedSender<Command>,
    chunk_size: usize,
    carry: Utf8Carry,
    ended: bool,
}

impl RemoteWriter {
    pub(crate) fn new(
        key: ChannelKey,
        spec: StreamSpec,
        credits: Arc<Semaphore>,
        commands: mpsc::UnboundedSender<Command>,
        chunk_size: usize,
    ) -> Self {
        Self {
            key,
            spec,
            credits,
            commands,
            chunk_size: chunk_size.max(1),
            carry: Utf8Carry::default(),
            ended: false,
        }
    }

    pub fn spec(&self) -> StreamSpec {
        self.spec
    }

    /// Send one chunk, waiting for credit if the remote has not drained earlier ones.
    pub async fn send(&mut self, value: Value) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::Closed);
        }
        let permit = self
            .credits
            .acquire()
            .await
            .map_err(|_| StreamError::Closed)?;
        permit.forget();
        self.commands
            .send(Command::Chunk(self.key, value))
            .map_err(|_| StreamError::Closed)
    }

    /// Write bytes in chunk-size pieces, encoded for the channel.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), StreamError> {
        for piece in data.chunks(self.chunk_size) {
            if let Some(value) = byte_chunk(self.spec.encoding, &mut self.carry, piece) {
                self.send(value).await?;
            }
        }
        Ok(())
    }

    /// Flush any held-back partial character and end the channel.
    pub async fn close(mut self) -> Result<(), StreamError> {
        if let Some(rest) = self.carry.finish() {
            self.send(Value::Str(rest)).await?;
        }
        self.end();
        Ok(())
    }

    fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            let _ = self.commands.send(Command::End(self.key));
        }
    }
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        self.end();
    }
}

/// Both halves of a duplex channel.
pub struct RemoteDuplex {
    pub reader: RemoteReader,
    pub writer: RemoteWriter,
}

impl RemoteDuplex {
    pub fn split(self) -> (RemoteReader, RemoteWriter) {
        (self.reader, self.writer)
    }
}

/// One stream member of a call result, typed by its declared direction.
pub enum RemoteStream {
    Reader(RemoteReader),
    Writer(RemoteWriter),
    Duplex(RemoteDuplex),
}

impl RemoteStream {
    pub fn into_reader(self) -> Option<RemoteReader> {
        match self {
            RemoteStream::Reader(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_writer(self) -> Option<RemoteWriter> {
        match self {
            RemoteStream::Writer(w) => Some(w),
            _ => None,
        }
    }

    pub fn into_duplex(self) -> Option<RemoteDuplex> {
        match self {
            RemoteStream::Duplex(d) => Some(d),
            _ => None,
        }
    }
}

/// Everything a callee-side pump needs for one channel.
pub(crate) struct Member {
    pub key: ChannelKey,
    pub spec: StreamSpec,
    pub commands: mpsc::UnboundedSender<Command>,
    /// Present when this side sends on the channel.
    pub credits: Option<Arc<Semaphore>>,
    /// Present when this side receives on the channel.
    pub inbox: Option<mpsc::UnboundedReceiver<Inbound>>,
    pub chunk_size: usize,
}

/// Fields the pumps of one channel share.
struct Pump {
    key: ChannelKey,
    encoding: Encoding,
    commands: mpsc::UnboundedSender<Command>,
    chunk_size: usize,
}

/// Open one produced stream, announce it ready, and move its data until it ends.
pub(crate) async fn serve_member(stream: StreamFuture, member: Member) {
    let Member {
        key,
        spec,
        commands,
        credits,
        inbox,
        chunk_size,
    } = member;
    let stream = match stream.await {
        Ok(s) if s.fits(spec.direction) => s,
        Ok(_) => {
            warn!(channel = %key, "stream kind does not match its declared direction");
            let _ = commands.send(Command::Fail(key, "stream kind mismatch".to_string()));
            return;
        }
        Err(e) => {
            debug!(channel = %key, error = %e, "stream failed to open");
            let _ = commands.send(Command::Fail(key, e.to_string()));
            return;
        }
    };
    let _ = commands.send(Command::Ready(key));

    let pump = Pump {
        key,
        encoding: spec.encoding,
        commands,
        chunk_size,
    };
    let result = match (stream, credits, inbox) {
        (LocalStream::Reader(r), Some(credits), _) => pump_reader(r, &pump, credits).await,
        (LocalStream::Objects(s), Some(credits), _) => pump_objects(s, &pump, credits).await,
        (LocalStream::Writer(w), _, Some(inbox)) => drain_into_writer(w, &pump, inbox).await,
        (LocalStream::ObjectSink(s), _, Some(inbox)) => drain_into_sink(s, &pump, inbox).await,
        (LocalStream::Duplex(r, w), Some(credits), Some(inbox)) => {
            let (read, write) = tokio::join!(
                pump_reader(r, &pump, credits),
                drain_into_writer(w, &pump, inbox)
            );
            read.and(write)
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "channel has no data path")),
    };
    if let Err(e) = result {
        warn!(channel = %key, error = %e, "stream failed");
        let _ = pump.commands.send(Command::Fail(key, e.to_string()));
    }
}

async fn pump_reader(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    pump: &Pump,
    credits: Arc<Semaphore>,
) -> io::Result<()> {
    let mut buf = vec![0u8; pump.chunk_size.max(1)];
    let mut carry = Utf8Carry::default();
    loop {
        // Halted channels close their semaphore.
        let Ok(permit) = credits.acquire().await else {
            return Ok(());
        };
        let n = reader.read(&mut buf).await?;
        let value = if n == 0 {
            carry.finish().map(Value::Str)
        } else {
            byte_chunk(pump.encoding, &mut carry, &buf[..n])
        };
        if let Some(value) = value {
            permit.forget();
            if pump.commands.send(Command::Chunk(pump.key, value)).is_err() {
                return Ok(());
            }
        }
        if n == 0 {
            let _ = pump.commands.send(Command::End(pump.key));
            return Ok(());
        }
    }
}

async fn pump_objects(
    mut values: futures::stream::BoxStream<'static, Value>,
    pump: &Pump,
    credits: Arc<Semaphore>,
) -> io::Result<()> {
    loop {
        let Ok(permit) = credits.acquire().await else {
            return Ok(());
        };
        let Some(value) = values.next().await else {
            let _ = pump.commands.send(Command::End(pump.key));
            return Ok(());
        };
        permit.forget();
        if pump.commands.send(Command::Chunk(pump.key, value)).is_err() {
            return Ok(());
        }
    }
}

async fn drain_into_writer(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    pump: &Pump,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
) -> io::Result<()> {
    while let Some(item) = inbox.recv().await {
        match item {
            Ok(value) => {
                match payload_bytes(&value) {
                    Ok(bytes) => writer.write_all(bytes).await?,
                    Err(e) => warn!(channel = %pump.key, error = %e, "chunk skipped"),
                }
                let _ = pump.commands.send(Command::Consumed(pump.key, 1));
            }
            Err(e) => {
                debug!(channel = %pump.key, error = %e, "writer input failed");
                break;
            }
        }
    }
    writer.shutdown().await
}

async fn drain_into_sink(
    mut sink: Pin<Box<dyn futures::Sink<Value, Error = io::Error> + Send>>,
    pump: &Pump,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
) -> io::Result<()> {
    while let Some(item) = inbox.recv().await {
        match item {
            Ok(value) => {
                sink.send(value).await?;
                let _ = pump.commands.send(Command::Consumed(pump.key, 1));
            }
            Err(_) => break,
        }
    }
    sink.close().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_character_split_across_reads_is_held_back() {
        let text = "añb€";
        let bytes = text.as_bytes();
        let mut carry = Utf8Carry::default();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&carry.push(std::slice::from_ref(b)));
        }
        assert_eq!(out, text);
        assert_eq!(carry.finish(), None);
    }

    #[test]
    fn truncated_character_is_flushed_lossily() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(carry.finish().as_deref(), Some("\u{fffd}"));
    }

    #[test]
    fn binary_chunks_are_bytes() {
        let mut carry = Utf8Carry::default();
        assert_eq!(
            byte_chunk(Encoding::Binary, &mut carry, &[0xff, 0]),
            Some(Value::Bytes(vec![0xff, 0]))
        );
        assert_eq!(byte_chunk(Encoding::Utf8, &mut carry, &[0xe2]), None);
    }

    #[tokio::test]
    async fn writer_waits_for_credit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let credits = Arc::new(Semaphore::new(1));
        let mut w = RemoteWriter::new(
            ChannelKey::Remote(0),
            StreamSpec::write(Encoding::Binary),
            credits.clone(),
            tx,
            4,
        );
        w.send(Value::Int(1)).await.unwrap();
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), w.send(Value::Int(2))).await;
        assert!(blocked.is_err());
        credits.add_permits(1);
        w.send(Value::Int(3)).await.unwrap();
        drop(w);
        let mut seen = Vec::new();
        while let Some(cmd) = rx.recv().await {
            seen.push(match cmd {
                Command::Chunk(_, v) => v,
                Command::End(_) => Value::Null,
                _ => panic!("unexpected command"),
            });
        }
        assert_eq!(seen, vec![Value::Int(1), Value::Int(3), Value::Null]);
    }

    #[tokio::test]
    async fn halted_writer_reports_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let credits = Arc::new(Semaphore::new(0));
        let mut w = RemoteWriter::new(
            ChannelKey::Remote(0),
            StreamSpec::write(Encoding::Binary),
            credits.clone(),
            tx,
            4,
        );
        credits.close();
        assert_eq!(w.write_all(b"data").await, Err(StreamError::Closed));
    }
}
