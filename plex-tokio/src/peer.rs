//! Session host: one event loop per connection drives the engine, a reader task feeds it
//! frames and a writer task drains its outbound queue onto the transport.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plex_core::session::{Action, Resolution, Session};
use plex_core::wire::{encode_frame, Codec};
use plex_core::{
    CallError, CallId, ChannelKey, Direction, Frame, MethodDescriptor, RemoteError, ResultShape,
    StreamSpec, Value,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::method::{Completion, Implementation, MethodTable};
use crate::stream::{
    serve_member, Inbound, Member, RemoteDuplex, RemoteReader, RemoteStream, RemoteWriter,
    StreamError,
};
use crate::transport::{read_frame, write_encoded, Transport};

/// Requests into a session's event loop, from API handles, completions, proxies and pumps.
pub(crate) enum Command {
    Call {
        method: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Resolved, CallError>>,
    },
    Complete {
        call: CallId,
        result: Result<Vec<Value>, RemoteError>,
    },
    Ready(ChannelKey),
    Chunk(ChannelKey, Value),
    End(ChannelKey),
    Fail(ChannelKey, String),
    Consumed(ChannelKey, u32),
    PlayDead(oneshot::Sender<bool>),
    StaticIn(Vec<Value>),
    StaticOut(Vec<Value>),
    Close,
}

/// Successful outcome of an outbound call before it is narrowed to the caller's shape.
pub(crate) enum Resolved {
    Values(Vec<Value>),
    Streams(Vec<RemoteStream>),
}

/// Session notifications.
#[derive(Debug, Clone)]
pub enum Event {
    /// The peer's method stubs are available.
    Methods(RemoteMethods),
    /// A probe was answered.
    Heartbeat {
        round_trip: Duration,
        /// Milliseconds since session start when the answer arrived.
        at_ms: u64,
    },
    /// The peer stopped answering probes. Sent once; the transport stays open.
    Death,
    Closed,
}

pub type Events = mpsc::UnboundedReceiver<Event>;

/// Configures and starts a session over one transport.
pub struct SessionBuilder {
    methods: MethodTable,
    config: SessionConfig,
    static_in: Vec<Value>,
    static_out: Vec<Value>,
}

impl SessionBuilder {
    pub fn new(methods: MethodTable) -> Self {
        Self {
            methods,
            config: SessionConfig::default(),
            static_in: Vec::new(),
            static_out: Vec::new(),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Values prefixed to the arguments of every call this session serves.
    pub fn static_in_args(mut self, values: Vec<Value>) -> Self {
        self.static_in = values;
        self
    }

    /// Values appended to the result of every plain call this session makes.
    pub fn static_out_args(mut self, values: Vec<Value>) -> Self {
        self.static_out = values;
        self
    }

    /// Start the session. Must be called inside a tokio runtime.
    pub fn connect<T: Transport>(self, transport: T) -> (Peer, Events) {
        let id = Uuid::new_v4();
        let span = info_span!("plex_session", session = %id);
        let config = self.config;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (methods_tx, methods_rx) = watch::channel(None);
        let (closed_tx, closed_rx) = watch::channel(false);
        let dead = Arc::new(AtomicBool::new(false));
        let playing_dead = Arc::new(AtomicBool::new(false));

        let codec: Arc<dyn Codec> = Arc::from(config.codec.codec());
        let (read_half, write_half) = tokio::io::split(transport);
        tokio::spawn(read_loop(read_half, codec.clone(), frames_tx).instrument(span.clone()));
        tokio::spawn(write_loop(write_half, outbound_rx).instrument(span.clone()));

        let mut engine = Session::new(self.methods.registry().clone(), config.core());
        engine.set_static_in_args(self.static_in);
        engine.set_static_out_args(self.static_out);

        let driver = Driver {
            engine,
            methods: self.methods,
            config,
            codec,
            commands: commands_tx.clone(),
            outbound: Some(outbound_tx),
            events: events_tx,
            methods_tx,
            closed_tx,
            dead: dead.clone(),
            playing_dead: playing_dead.clone(),
            started: Instant::now(),
            replies: HashMap::new(),
            announced: HashMap::new(),
            inboxes: HashMap::new(),
            credits: HashMap::new(),
        };
        tokio::spawn(driver.run(commands_rx, frames_rx).instrument(span));

        let peer = Peer {
            id,
            commands: commands_tx,
            methods: methods_rx,
            closed: closed_rx,
            dead,
            playing_dead,
        };
        (peer, events_rx)
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    methods: watch::Receiver<Option<RemoteMethods>>,
    closed: watch::Receiver<bool>,
    dead: Arc<AtomicBool>,
    playing_dead: Arc<AtomicBool>,
}

impl Peer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the peer's method stubs.
    pub async fn remote_methods(&self) -> Result<RemoteMethods, CallError> {
        let mut rx = self.methods.clone();
        let methods = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CallError::ConnectionClosed)?;
        (*methods).clone().ok_or(CallError::NotReady)
    }

    /// The stubs if they have arrived already.
    pub fn remote_methods_now(&self) -> Option<RemoteMethods> {
        self.methods.borrow().clone()
    }

    /// Call a plain remote method by name. Fails with `NotReady` before the registry arrives.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        match request(&self.commands, method, args).await? {
            Resolved::Values(values) => Ok(values),
            Resolved::Streams(_) => Err(CallError::ShapeMismatch(method.to_string())),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Toggle not answering the peer's heartbeat probes. Returns the new state.
    pub async fn play_dead(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PlayDead(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn is_playing_dead(&self) -> bool {
        self.playing_dead.load(Ordering::SeqCst)
    }

    pub fn set_static_in_args(&self, values: Vec<Value>) {
        let _ = self.commands.send(Command::StaticIn(values));
    }

    pub fn set_static_out_args(&self, values: Vec<Value>) {
        let _ = self.commands.send(Command::StaticOut(values));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fail outstanding calls, close every channel and shut the transport. Idempotent.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close);
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

/// Stubs for the methods a peer advertised.
#[derive(Clone)]
pub struct RemoteMethods {
    methods: Arc<BTreeMap<String, MethodDescriptor>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl RemoteMethods {
    fn new(descriptors: Vec<MethodDescriptor>, commands: mpsc::UnboundedSender<Command>) -> Self {
        let methods = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self {
            methods: Arc::new(methods),
            commands,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<RemoteMethod> {
        self.methods.get(name).map(|d| RemoteMethod {
            descriptor: d.clone(),
            commands: self.commands.clone(),
        })
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        self.get(name)
            .ok_or_else(|| CallError::NoSuchMethod(name.to_string()))?
            .call(args)
            .await
    }
}

impl fmt::Debug for RemoteMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods.keys()).finish()
    }
}

/// Stub for one remote method.
#[derive(Clone)]
pub struct RemoteMethod {
    descriptor: MethodDescriptor,
    commands: mpsc::UnboundedSender<Command>,
}

impl RemoteMethod {
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn mismatch(&self) -> CallError {
        CallError::ShapeMismatch(self.descriptor.name.clone())
    }

    /// Invoke a plain method and wait for its result values.
    pub async fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        if self.descriptor.shape != ResultShape::Callback {
            return Err(self.mismatch());
        }
        match request(&self.commands, &self.descriptor.name, args).await? {
            Resolved::Values(values) => Ok(values),
            Resolved::Streams(_) => Err(self.mismatch()),
        }
    }

    /// Invoke a single-stream method; the proxy is available as soon as the channel is announced.
    pub async fn open_stream(&self, args: Vec<Value>) -> Result<RemoteStream, CallError> {
        if !matches!(self.descriptor.shape, ResultShape::Stream(_)) {
            return Err(self.mismatch());
        }
        match request(&self.commands, &self.descriptor.name, args).await? {
            Resolved::Streams(mut streams) if streams.len() == 1 => {
                streams.pop().ok_or_else(|| self.mismatch())
            }
            _ => Err(self.mismatch()),
        }
    }

    /// Invoke a synchronized multi-stream method; resolves once every member is ready.
    pub async fn open_sync_streams(&self, args: Vec<Value>) -> Result<Vec<RemoteStream>, CallError> {
        let ResultShape::SyncStreams(specs) = &self.descriptor.shape else {
            return Err(self.mismatch());
        };
        match request(&self.commands, &self.descriptor.name, args).await? {
            Resolved::Streams(streams) if streams.len() == specs.len() => Ok(streams),
            _ => Err(self.mismatch()),
        }
    }
}

impl fmt::Debug for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMethod")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

async fn request(
    commands: &mpsc::UnboundedSender<Command>,
    method: &str,
    args: Vec<Value>,
) -> Result<Resolved, CallError> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(Command::Call {
            method: method.to_string(),
            args,
            reply,
        })
        .map_err(|_| CallError::ConnectionClosed)?;
    rx.await.map_err(|_| CallError::ConnectionClosed)?
}

async fn read_loop<R>(mut reader: R, codec: Arc<dyn Codec>, frames: mpsc::UnboundedSender<Frame>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader, codec.as_ref()).await {
            Ok(Some(frame)) => {
                if frames.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("transport closed by peer");
                break;
            }
            Err(e) if !e.is_fatal() => warn!(error = %e, "malformed frame dropped"),
            Err(e) => {
                warn!(error = %e, "transport read failed");
                break;
            }
        }
    }
}

/// Frames arrive already encoded; the driver deals with frames that cannot be.
async fn write_loop<W>(mut writer: W, mut frames: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = frames.recv().await {
        if let Err(e) = write_encoded(&mut writer, &bytes).await {
            warn!(error = %e, "transport write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Event loop state. The only owner of the engine.
struct Driver {
    engine: Session,
    methods: MethodTable,
    config: SessionConfig,
    codec: Arc<dyn Codec>,
    commands: mpsc::UnboundedSender<Command>,
    /// Encoded frames for the writer. `None` once the writer is gone or the session closed.
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    events: mpsc::UnboundedSender<Event>,
    methods_tx: watch::Sender<Option<RemoteMethods>>,
    closed_tx: watch::Sender<bool>,
    dead: Arc<AtomicBool>,
    playing_dead: Arc<AtomicBool>,
    started: Instant,
    replies: HashMap<CallId, oneshot::Sender<Result<Resolved, CallError>>>,
    /// Caller proxies built on announcement, handed out when their call resolves.
    announced: HashMap<ChannelKey, RemoteStream>,
    inboxes: HashMap<ChannelKey, mpsc::UnboundedSender<Inbound>>,
    credits: HashMap<ChannelKey, Arc<Semaphore>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        info!(methods = self.methods.len(), "session started");
        let actions = self.engine.start();
        self.dispatch(actions).await;

        let mut ticker = self.config.heartbeat_interval().map(|period| {
            let mut t = tokio::time::interval_at(Instant::now() + period, period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        while !self.engine.is_closed() {
            tokio::select! {
                Some(command) = commands.recv() => self.on_command(command).await,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        debug!(kind = frame.kind(), "frame received");
                        let actions = self.engine.on_frame(frame, self.now_ms());
                        self.dispatch(actions).await;
                    }
                    None => {
                        debug!("transport ended");
                        let actions = self.engine.close();
                        self.dispatch(actions).await;
                    }
                },
                _ = next_tick(&mut ticker) => {
                    let actions = self.engine.tick(self.now_ms());
                    self.dispatch(actions).await;
                    if self.engine.is_dead() {
                        ticker = None;
                    }
                }
            }
            if self.outbound.is_none() && !self.engine.is_closed() {
                let actions = self.engine.close();
                self.dispatch(actions).await;
            }
        }

        // Dropping the queue lets the writer flush and shut the transport down.
        self.outbound = None;
        let _ = self.closed_tx.send(true);
        info!("session closed");
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn on_command(&mut self, command: Command) {
        let actions = match command {
            Command::Call {
                method,
                args,
                reply,
            } => match self.engine.call(&method, args) {
                Ok((id, actions)) => {
                    self.replies.insert(id, reply);
                    actions
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            },
            Command::Complete { call, result } => self.engine.complete(call, result),
            Command::Ready(key) => self.engine.stream_ready(key),
            Command::Chunk(key, value) => match self.engine.send_chunk(key, value) {
                Ok(actions) => actions,
                Err(e) => {
                    debug!(channel = %key, error = %e, "chunk for finished channel dropped");
                    return;
                }
            },
            Command::End(key) => {
                self.credits.remove(&key);
                self.engine.end_channel(key)
            }
            Command::Fail(key, reason) => self.engine.fail_channel(key, reason),
            Command::Consumed(key, n) => self.engine.consumed(key, n),
            Command::PlayDead(reply) => {
                let playing = self.engine.play_dead();
                self.playing_dead.store(playing, Ordering::SeqCst);
                info!(playing_dead = playing, "heartbeat answers toggled");
                let _ = reply.send(playing);
                return;
            }
            Command::StaticIn(values) => {
                self.engine.set_static_in_args(values);
                return;
            }
            Command::StaticOut(values) => {
                self.engine.set_static_out_args(values);
                return;
            }
            Command::Close => self.engine.close(),
        };
        self.dispatch(actions).await;
    }

    async fn dispatch(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            // Fallout from an unsendable frame runs before the rest of the batch.
            for follow in self.perform(action).await.into_iter().rev() {
                queue.push_front(follow);
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::Send(frame) => return self.send(frame).await,
            Action::MethodsReady(descriptors) => {
                let remote = RemoteMethods::new(descriptors, self.commands.clone());
                info!(methods = remote.len(), "remote methods ready");
                self.methods_tx.send_replace(Some(remote.clone()));
                let _ = self.events.send(Event::Methods(remote));
            }
            Action::Invoke { call, method, args } => self.invoke(call, &method, args),
            Action::Produce {
                call,
                method,
                args,
                channels,
            } => self.produce(call, &method, args, channels),
            Action::Announce { channel, spec } => {
                let proxy = self.open_proxy(channel, spec);
                self.announced.insert(channel, proxy);
            }
            Action::Resolve { call, resolution } => self.resolve(call, resolution),
            Action::Deliver { channel, payload } => {
                if let Some(inbox) = self.inboxes.get(&channel) {
                    if inbox.send(Ok(payload)).is_err() {
                        debug!(channel = %channel, "consumer gone, chunk discarded");
                    }
                }
            }
            Action::Credit { channel, grant } => {
                if let Some(credits) = self.credits.get(&channel) {
                    credits.add_permits(grant as usize);
                }
            }
            Action::Finish { channel, error } => {
                if let Some(inbox) = self.inboxes.remove(&channel) {
                    if let Some(e) = error {
                        let _ = inbox.send(Err(StreamError::Remote(e)));
                    }
                }
            }
            Action::Halt { channel } => {
                if let Some(credits) = self.credits.remove(&channel) {
                    credits.close();
                }
                self.announced.remove(&channel);
            }
            Action::Heartbeat(beat) => {
                let _ = self.events.send(Event::Heartbeat {
                    round_trip: Duration::from_millis(beat.round_trip_ms()),
                    at_ms: beat.received_at_ms,
                });
            }
            Action::Death => {
                warn!("peer declared dead");
                self.dead.store(true, Ordering::SeqCst);
                let _ = self.events.send(Event::Death);
            }
            Action::Closed => {
                for reply in self.replies.drain() {
                    let _ = reply.1.send(Err(CallError::ConnectionClosed));
                }
                let _ = self.events.send(Event::Closed);
            }
        }
        Vec::new()
    }

    /// Encode and queue one frame. A frame that cannot be encoded goes back to the engine.
    async fn send(&mut self, frame: Frame) -> Vec<Action> {
        let Some(outbound) = &self.outbound else {
            return Vec::new();
        };
        let bytes = match encode_frame(self.codec.as_ref(), &frame) {
            Ok(bytes) => bytes,
            Err(e) => return self.engine.send_failed(frame, e.to_string()),
        };
        debug!(kind = frame.kind(), len = bytes.len(), "frame sent");
        if outbound.send(bytes).await.is_err() {
            warn!("transport writer gone");
            self.outbound = None;
        }
        Vec::new()
    }

    fn invoke(&mut self, call: CallId, method: &str, args: Vec<Value>) {
        match self.methods.implementation(method) {
            Some(Implementation::Callback(f)) => {
                let f = f.clone();
                f(args, Completion::new(call, self.commands.clone()));
            }
            _ => {
                warn!(call, method, "no callback behind advertised method");
                let _ = self.commands.send(Command::Complete {
                    call,
                    result: Err(RemoteError::NoSuchMethod(method.to_string())),
                });
            }
        }
    }

    fn produce(
        &mut self,
        call: CallId,
        method: &str,
        args: Vec<Value>,
        channels: Vec<(ChannelKey, StreamSpec)>,
    ) {
        let factory = match self.methods.implementation(method) {
            Some(Implementation::Streams(f)) => f.clone(),
            _ => {
                warn!(call, method, "no stream factory behind advertised method");
                for (key, _) in channels {
                    let _ = self
                        .commands
                        .send(Command::Fail(key, "no stream factory".to_string()));
                }
                return;
            }
        };
        if channels.iter().any(|(key, _)| !self.engine.has_channel(*key)) {
            debug!(call, method, "stream result withdrawn before production");
            return;
        }
        let mut produced = factory(args).into_iter();
        for (key, spec) in channels {
            let Some(stream) = produced.next() else {
                warn!(call, channel = %key, "factory produced fewer streams than declared");
                let _ = self
                    .commands
                    .send(Command::Fail(key, "stream not produced".to_string()));
                continue;
            };
            let credits = spec.direction.caller_reads().then(|| self.credits_for(key));
            let inbox = spec.direction.caller_writes().then(|| self.inbox_for(key));
            let member = Member {
                key,
                spec,
                commands: self.commands.clone(),
                credits,
                inbox,
                chunk_size: self.config.chunk_size,
            };
            tokio::spawn(serve_member(stream, member).in_current_span());
        }
        if produced.next().is_some() {
            warn!(call, method, "factory produced more streams than declared");
        }
    }

    /// Outbound credit for a channel we send on, seeded with the peer's window.
    fn credits_for(&mut self, key: ChannelKey) -> Arc<Semaphore> {
        let credits = Arc::new(Semaphore::new(self.engine.peer_window() as usize));
        self.credits.insert(key, credits.clone());
        credits
    }

    fn inbox_for(&mut self, key: ChannelKey) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(key, tx);
        rx
    }

    fn open_proxy(&mut self, key: ChannelKey, spec: StreamSpec) -> RemoteStream {
        let chunk_size = self.config.chunk_size;
        match spec.direction {
            Direction::Read => {
                let inbox = self.inbox_for(key);
                RemoteStream::Reader(RemoteReader::new(key, spec, inbox, self.commands.clone()))
            }
            Direction::Write => {
                let credits = self.credits_for(key);
                RemoteStream::Writer(RemoteWriter::new(
                    key,
                    spec,
                    credits,
                    self.commands.clone(),
                    chunk_size,
                ))
            }
            Direction::Duplex => {
                let inbox = self.inbox_for(key);
                let credits = self.credits_for(key);
                RemoteStream::Duplex(RemoteDuplex {
                    reader: RemoteReader::new(key, spec, inbox, self.commands.clone()),
                    writer: RemoteWriter::new(key, spec, credits, self.commands.clone(), chunk_size),
                })
            }
        }
    }

    fn resolve(&mut self, call: CallId, resolution: Resolution) {
        let Some(reply) = self.replies.remove(&call) else {
            debug!(call, "resolution for abandoned call");
            return;
        };
        let result = match resolution {
            Resolution::Values(values) => Ok(Resolved::Values(values)),
            Resolution::Streams(keys) => {
                let streams = keys
                    .into_iter()
                    .filter_map(|key| self.announced.remove(&key))
                    .collect();
                Ok(Resolved::Streams(streams))
            }
            Resolution::Failed(e) => Err(e),
        };
        // A caller that stopped waiting drops the proxies, which ends their channels.
        let _ = reply.send(result);
    }
}
