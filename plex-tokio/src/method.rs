//! Local method implementations and the table a session exposes.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Sink};
use plex_core::{
    CallId, Direction, Encoding, MethodDescriptor, ProtocolError, Registry, RemoteError,
    ResultShape, StreamSpec, Value,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::warn;

use crate::peer::Command;

/// Server side of one stream member, as produced by a stream factory.
pub enum LocalStream {
    /// Bytes the caller reads.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// Bytes the caller writes.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    Duplex(Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>),
    /// Values the caller reads (object mode).
    Objects(BoxStream<'static, Value>),
    /// Values the caller writes (object mode).
    ObjectSink(Pin<Box<dyn Sink<Value, Error = io::Error> + Send>>),
}

impl LocalStream {
    pub fn reader(r: impl AsyncRead + Send + Unpin + 'static) -> Self {
        LocalStream::Reader(Box::new(r))
    }

    pub fn writer(w: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        LocalStream::Writer(Box::new(w))
    }

    pub fn duplex(r: impl AsyncRead + Send + Unpin + 'static, w: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        LocalStream::Duplex(Box::new(r), Box::new(w))
    }

    /// Whether this stream can serve a channel declared with `direction`.
    pub(crate) fn fits(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (LocalStream::Reader(_) | LocalStream::Objects(_), Direction::Read)
                | (LocalStream::Writer(_) | LocalStream::ObjectSink(_), Direction::Write)
                | (LocalStream::Duplex(..), Direction::Duplex)
        )
    }
}

/// A stream member that may still be opening (e.g. a file).
pub type StreamFuture = BoxFuture<'static, io::Result<LocalStream>>;

type CallbackFn = dyn Fn(Vec<Value>, Completion) + Send + Sync;
type StreamFactory = dyn Fn(Vec<Value>) -> Vec<StreamFuture> + Send + Sync;

/// Reports the result of one inbound call. Consumed on use, so a call completes at most
/// once; dropping it unused fails the call.
pub struct Completion {
    call: CallId,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl Completion {
    pub(crate) fn new(call: CallId, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            call,
            commands: Some(commands),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call
    }

    pub fn complete(mut self, result: Result<Vec<Value>, RemoteError>) {
        self.send(result);
    }

    pub fn ok(self, values: Vec<Value>) {
        self.complete(Ok(values));
    }

    pub fn err(self, message: impl Into<String>) {
        self.complete(Err(RemoteError::failed(message)));
    }

    fn send(&mut self, result: Result<Vec<Value>, RemoteError>) {
        if let Some(commands) = self.commands.take() {
            // Session gone: nobody is waiting for the answer.
            let _ = commands.send(Command::Complete {
                call: self.call,
                result,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.commands.is_some() {
            warn!(call = self.call, "implementation dropped its completion");
            self.send(Err(RemoteError::failed("implementation did not complete the call")));
        }
    }
}

#[derive(Clone)]
pub(crate) enum Implementation {
    Callback(Arc<CallbackFn>),
    Streams(Arc<StreamFactory>),
}

/// A named method: its advertised descriptor plus the local implementation.
#[derive(Clone)]
pub struct Method {
    descriptor: MethodDescriptor,
    implementation: Implementation,
}

impl Method {
    /// Completion-style implementation: call `done` exactly once, possibly later.
    pub fn callback<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Completion) + Send + Sync + 'static,
    {
        Self {
            descriptor: MethodDescriptor::new(name, ResultShape::Callback),
            implementation: Implementation::Callback(Arc::new(f)),
        }
    }

    /// Async implementation; the returned future runs on its own task.
    pub fn handler<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, RemoteError>> + Send + 'static,
    {
        Self::callback(name, move |args, done| {
            let fut = f(args);
            tokio::spawn(async move { done.complete(fut.await) });
        })
    }

    /// One stream the caller reads.
    pub fn read_stream<F, Fut>(name: impl Into<String>, encoding: Encoding, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<LocalStream>> + Send + 'static,
    {
        Self::single(name, StreamSpec::read(encoding), f)
    }

    /// One stream the caller writes.
    pub fn write_stream<F, Fut>(name: impl Into<String>, encoding: Encoding, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<LocalStream>> + Send + 'static,
    {
        Self::single(name, StreamSpec::write(encoding), f)
    }

    pub fn duplex_stream<F, Fut>(name: impl Into<String>, encoding: Encoding, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<LocalStream>> + Send + 'static,
    {
        Self::single(name, StreamSpec::duplex(encoding), f)
    }

    /// One object-mode stream in `direction`.
    pub fn object_stream<F, Fut>(name: impl Into<String>, direction: Direction, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<LocalStream>> + Send + 'static,
    {
        Self::single(name, StreamSpec::objects(direction), f)
    }

    fn single<F, Fut>(name: impl Into<String>, spec: StreamSpec, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<LocalStream>> + Send + 'static,
    {
        Self {
            descriptor: MethodDescriptor::new(name, ResultShape::Stream(spec)),
            implementation: Implementation::Streams(Arc::new(move |args| vec![f(args).boxed()])),
        }
    }

    /// `count` read streams delivered to the caller together once all are open.
    pub fn sync_read_streams<F>(name: impl Into<String>, encoding: Encoding, count: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Vec<StreamFuture> + Send + Sync + 'static,
    {
        Self::sync_streams(name, vec![StreamSpec::read(encoding); count], f)
    }

    /// Streams of mixed direction, delivered together once all are open.
    pub fn sync_streams<F>(name: impl Into<String>, specs: Vec<StreamSpec>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Vec<StreamFuture> + Send + Sync + 'static,
    {
        Self {
            descriptor: MethodDescriptor::new(name, ResultShape::SyncStreams(specs)),
            implementation: Implementation::Streams(Arc::new(f)),
        }
    }

    /// Reject calls that do not supply exactly `arity` arguments.
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.descriptor = self.descriptor.with_arity(arity);
        self
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// The methods a session exposes. Fixed once the session starts.
#[derive(Clone, Default)]
pub struct MethodTable {
    registry: Registry,
    implementations: HashMap<String, Implementation>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: Method) -> Result<(), ProtocolError> {
        self.registry.register(method.descriptor.clone())?;
        self.implementations
            .insert(method.descriptor.name, method.implementation);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, method: Method) -> Result<Self, ProtocolError> {
        self.register(method)?;
        Ok(self)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub(crate) fn implementation(&self, name: &str) -> Option<&Implementation> {
        self.implementations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_advertises_shapes() {
        let table = MethodTable::new()
            .with(Method::handler("echo", |args| async move { Ok::<_, RemoteError>(args) }).with_arity(1))
            .unwrap()
            .with(Method::read_stream("cat", Encoding::Utf8, |_| async {
                Ok(LocalStream::reader(tokio::io::empty()))
            }))
            .unwrap()
            .with(Method::sync_read_streams("pair", Encoding::Binary, 2, |_| Vec::new()))
            .unwrap();
        let reg = table.registry();
        assert_eq!(reg.get("echo").unwrap().arity, Some(1));
        assert_eq!(
            reg.shape("cat"),
            Some(&ResultShape::Stream(StreamSpec::read(Encoding::Utf8)))
        );
        assert_eq!(reg.shape("pair").unwrap().stream_specs().len(), 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut table = MethodTable::new();
        table
            .register(Method::callback("x", |_, done| done.ok(vec![])))
            .unwrap();
        assert!(table
            .register(Method::callback("x", |_, done| done.ok(vec![])))
            .is_err());
    }

    #[tokio::test]
    async fn completion_sends_once_and_drop_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        Completion::new(1, tx.clone()).ok(vec![Value::Int(1)]);
        drop(Completion::new(2, tx));
        match rx.recv().await {
            Some(Command::Complete { call: 1, result }) => {
                assert_eq!(result, Ok(vec![Value::Int(1)]))
            }
            _ => panic!("expected completion for call 1"),
        }
        match rx.recv().await {
            Some(Command::Complete { call: 2, result }) => assert!(result.is_err()),
            _ => panic!("expected failure for call 2"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn stream_kinds_fit_directions() {
        assert!(LocalStream::reader(tokio::io::empty()).fits(Direction::Read));
        assert!(!LocalStream::reader(tokio::io::empty()).fits(Direction::Write));
        assert!(LocalStream::writer(tokio::io::sink()).fits(Direction::Write));
    }
}
