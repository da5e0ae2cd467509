//! Host-driven session engine: the host passes frames, ticks and API commands in,
//! and performs the returned actions (send frames, run implementations, deliver data).

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::channel::{ChannelError, ChannelKey, ChannelTable, DEFAULT_WINDOW};
use crate::error::{CallError, RemoteError};
use crate::heartbeat::{Beat, HeartbeatConfig, HeartbeatMonitor, TickOutcome};
use crate::inject::StaticArgs;
use crate::protocol::{
    CallId, ChannelDescriptor, Frame, MethodDescriptor, Outcome, ResultShape, StreamSpec, Value,
    PROTOCOL_VERSION,
};
use crate::registry::Registry;

/// Engine settings that affect the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreConfig {
    /// Chunks accepted per inbound channel before credit must be granted.
    pub window: u32,
    pub heartbeat: HeartbeatConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// How a call this peer made ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Plain result values, static out args already appended.
    Values(Vec<Value>),
    /// Stream channels in production order; each was announced before.
    Streams(Vec<ChannelKey>),
    Failed(CallError),
}

/// Action for the host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Frame),
    /// Peer's registry arrived; build stubs.
    MethodsReady(Vec<MethodDescriptor>),
    /// Run a plain local implementation and report back via `Session::complete`.
    Invoke {
        call: CallId,
        method: String,
        args: Vec<Value>,
    },
    /// Run a local stream factory; bind its streams to `channels` in order.
    Produce {
        call: CallId,
        method: String,
        args: Vec<Value>,
        channels: Vec<(ChannelKey, StreamSpec)>,
    },
    /// Peer announced a channel for one of our calls; prepare its local proxy.
    Announce { channel: ChannelKey, spec: StreamSpec },
    Resolve { call: CallId, resolution: Resolution },
    /// Inbound chunk for the local consumer of a channel.
    Deliver { channel: ChannelKey, payload: Value },
    /// Peer allows `grant` more outbound chunks on a channel.
    Credit { channel: ChannelKey, grant: u32 },
    /// No more inbound data on a channel.
    Finish {
        channel: ChannelKey,
        error: Option<String>,
    },
    /// Channel no longer exists: stop producing and drop any proxy held for it.
    Halt { channel: ChannelKey },
    Heartbeat(Beat),
    /// Liveness lost. Emitted once; the transport stays open.
    Death,
    Closed,
}

/// Outbound call awaiting its result (and, for sync results, member readiness).
struct PendingCall {
    method: String,
    shape: ResultShape,
    members: Vec<ChannelKey>,
    waiting: BTreeSet<ChannelKey>,
}

/// One end of a connected pair.
pub struct Session {
    local: Registry,
    remote: Option<Registry>,
    window: u32,
    peer_window: u32,
    started: bool,
    closed: bool,
    next_call: CallId,
    pending: HashMap<CallId, PendingCall>,
    /// Inbound plain calls whose completion has not been reported yet.
    serving: HashSet<CallId>,
    /// Sync member channel -> call still waiting for it.
    sync_waiters: HashMap<ChannelKey, CallId>,
    channels: ChannelTable,
    heartbeat: HeartbeatMonitor,
    args: StaticArgs,
}

impl Session {
    pub fn new(local: Registry, config: CoreConfig) -> Self {
        Self {
            local,
            remote: None,
            window: config.window.max(1),
            peer_window: DEFAULT_WINDOW,
            started: false,
            closed: false,
            next_call: 0,
            pending: HashMap::new(),
            serving: HashSet::new(),
            sync_waiters: HashMap::new(),
            channels: ChannelTable::new(config.window),
            heartbeat: HeartbeatMonitor::new(config.heartbeat),
            args: StaticArgs::new(),
        }
    }

    pub fn local_methods(&self) -> &Registry {
        &self.local
    }

    /// Peer's table, once its registry frame has arrived.
    pub fn remote_methods(&self) -> Option<&Registry> {
        self.remote.as_ref()
    }

    /// Credit window the peer grants for channels it receives on.
    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_dead(&self) -> bool {
        self.heartbeat.is_dead()
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn has_channel(&self, key: ChannelKey) -> bool {
        self.channels.get(key).is_some()
    }

    pub fn static_args(&self) -> &StaticArgs {
        &self.args
    }

    pub fn set_static_in_args(&mut self, values: Vec<Value>) {
        self.args.set_in(values);
    }

    pub fn set_static_out_args(&mut self, values: Vec<Value>) {
        self.args.set_out(values);
    }

    /// Toggle the non-responsive heartbeat mode. Returns the new state.
    pub fn play_dead(&mut self) -> bool {
        self.heartbeat.toggle_play_dead()
    }

    /// Send our registry (always the first frame) and begin probing if configured.
    pub fn start(&mut self) -> Vec<Action> {
        if self.started || self.closed {
            return Vec::new();
        }
        self.started = true;
        self.heartbeat.start();
        vec![Action::Send(Frame::Registry {
            version: PROTOCOL_VERSION,
            window: self.window,
            methods: self.local.descriptors(),
        })]
    }

    /// Begin a call to a remote method.
    pub fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(CallId, Vec<Action>), CallError> {
        if self.closed {
            return Err(CallError::ConnectionClosed);
        }
        let remote = self.remote.as_ref().ok_or(CallError::NotReady)?;
        let descriptor = remote
            .get(method)
            .ok_or_else(|| CallError::NoSuchMethod(method.to_string()))?;
        if let Some(expected) = descriptor.arity {
            if expected != args.len() {
                return Err(CallError::ArgumentMismatch {
                    method: method.to_string(),
                    expected,
                    got: args.len(),
                });
            }
        }
        let id = self.next_call;
        self.next_call += 1;
        self.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                shape: descriptor.shape.clone(),
                members: Vec::new(),
                waiting: BTreeSet::new(),
            },
        );
        debug!(call = id, method, "call");
        let frame = Frame::Call {
            id,
            method: method.to_string(),
            args,
        };
        Ok((id, vec![Action::Send(frame)]))
    }

    /// Report the completion of an inbound plain call. A second completion is ignored.
    pub fn complete(&mut self, call: CallId, result: Result<Vec<Value>, RemoteError>) -> Vec<Action> {
        if !self.serving.remove(&call) {
            warn!(call, "completion for unknown or already completed call ignored");
            return Vec::new();
        }
        if self.closed {
            return Vec::new();
        }
        let outcome = match result {
            Ok(values) => Outcome::Values(values),
            Err(e) => Outcome::Error(e),
        };
        vec![Action::Send(Frame::Result { id: call, outcome })]
    }

    /// Our side of a callee-minted channel is open.
    pub fn stream_ready(&mut self, key: ChannelKey) -> Vec<Action> {
        match self.channels.mark_ready(key) {
            Ok(true) => vec![Action::Send(Frame::Ready {
                channel: key.to_wire(),
            })],
            Ok(false) => Vec::new(),
            Err(e) => {
                debug!(channel = %key, error = %e, "ready on missing channel");
                Vec::new()
            }
        }
    }

    /// Frame one outbound chunk. The host is responsible for respecting credit.
    pub fn send_chunk(&mut self, key: ChannelKey, payload: Value) -> Result<Vec<Action>, ChannelError> {
        let seq = self.channels.next_send_seq(key)?;
        Ok(vec![Action::Send(Frame::Chunk {
            channel: key.to_wire(),
            seq,
            payload,
        })])
    }

    /// Local producer finished. Ending twice is harmless.
    pub fn end_channel(&mut self, key: ChannelKey) -> Vec<Action> {
        match self.channels.finish_send(key) {
            Ok(_) => vec![Action::Send(Frame::End {
                channel: key.to_wire(),
                error: None,
            })],
            Err(e) => {
                debug!(channel = %key, error = %e, "end on finished channel");
                Vec::new()
            }
        }
    }

    /// Local stream behind a channel failed or never opened: tell the peer and drop it.
    pub fn fail_channel(&mut self, key: ChannelKey, error: String) -> Vec<Action> {
        if self.channels.remove(key).is_none() {
            return Vec::new();
        }
        vec![
            Action::Send(Frame::End {
                channel: key.to_wire(),
                error: Some(error.clone()),
            }),
            Action::Halt { channel: key },
            Action::Finish {
                channel: key,
                error: Some(error),
            },
        ]
    }

    /// Local consumer drained `n` chunks; may grant credit back to the peer.
    pub fn consumed(&mut self, key: ChannelKey, n: u32) -> Vec<Action> {
        match self.channels.drained(key, n) {
            Some(grant) if !self.closed => vec![Action::Send(Frame::Credit {
                channel: key.to_wire(),
                grant,
            })],
            _ => Vec::new(),
        }
    }

    /// The host could not encode a frame this engine asked it to send. Whatever waits on
    /// that frame fails; the session stays up.
    pub fn send_failed(&mut self, frame: Frame, reason: String) -> Vec<Action> {
        if self.closed {
            return Vec::new();
        }
        warn!(kind = frame.kind(), error = %reason, "frame could not be encoded");
        match frame {
            Frame::Call { id, .. } => {
                if self.pending.remove(&id).is_none() {
                    return Vec::new();
                }
                vec![Action::Resolve {
                    call: id,
                    resolution: Resolution::Failed(CallError::Unsendable(reason)),
                }]
            }
            // Nothing smaller to fall back to.
            Frame::Result {
                outcome: Outcome::Error(_),
                ..
            } => Vec::new(),
            Frame::Result { id, outcome } => {
                let mut actions = Vec::new();
                if let Outcome::Streams(descriptors) = outcome {
                    for d in descriptors {
                        let key = ChannelKey::Local(d.id);
                        if self.channels.remove(key).is_some() {
                            actions.push(Action::Halt { channel: key });
                        }
                    }
                }
                actions.push(Action::Send(Frame::Result {
                    id,
                    outcome: Outcome::Error(RemoteError::failed(format!(
                        "result could not be sent: {reason}"
                    ))),
                }));
                actions
            }
            Frame::Chunk { channel, .. } => self.fail_channel(ChannelKey::from_sent(channel), reason),
            _ => Vec::new(),
        }
    }

    /// Heartbeat timer expired.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Action> {
        if self.closed {
            return Vec::new();
        }
        match self.heartbeat.on_tick(now_ms) {
            TickOutcome::Nothing => Vec::new(),
            TickOutcome::SendProbe { sent_at_ms } => {
                vec![Action::Send(Frame::Probe { sent_at_ms })]
            }
            TickOutcome::Died => {
                warn!(
                    missed = self.heartbeat.config().max_missed_beats,
                    "peer stopped answering heartbeats"
                );
                vec![Action::Death]
            }
        }
    }

    /// Transport ended. Fails every pending call and closes every channel. Idempotent.
    pub fn close(&mut self) -> Vec<Action> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut actions = Vec::new();
        let mut calls: Vec<CallId> = self.pending.keys().copied().collect();
        calls.sort_unstable();
        for call in calls {
            self.pending.remove(&call);
            actions.push(Action::Resolve {
                call,
                resolution: Resolution::Failed(CallError::ConnectionClosed),
            });
        }
        self.serving.clear();
        self.sync_waiters.clear();
        for key in self.channels.close_all() {
            actions.push(Action::Halt { channel: key });
            actions.push(Action::Finish {
                channel: key,
                error: Some("connection closed".to_string()),
            });
        }
        actions.push(Action::Closed);
        actions
    }

    /// Process one inbound frame.
    pub fn on_frame(&mut self, frame: Frame, now_ms: u64) -> Vec<Action> {
        if self.closed {
            debug!(kind = frame.kind(), "frame after close dropped");
            return Vec::new();
        }
        match frame {
            Frame::Registry {
                version,
                window,
                methods,
            } => self.on_registry(version, window, methods),
            Frame::Call { id, method, args } => self.on_call(id, method, args),
            Frame::Result { id, outcome } => self.on_result(id, outcome),
            Frame::Ready { channel } => self.on_ready(ChannelKey::from_wire(channel)),
            Frame::Chunk {
                channel,
                seq,
                payload,
            } => {
                let key = ChannelKey::from_wire(channel);
                match self.channels.accept_chunk(key, seq) {
                    Ok(()) => vec![Action::Deliver {
                        channel: key,
                        payload,
                    }],
                    Err(e) => {
                        warn!(channel = %key, seq, error = %e, "stale chunk dropped");
                        Vec::new()
                    }
                }
            }
            Frame::End { channel, error } => self.on_end(ChannelKey::from_wire(channel), error),
            Frame::Credit { channel, grant } => {
                let key = ChannelKey::from_wire(channel);
                if self.channels.can_send(key) {
                    vec![Action::Credit {
                        channel: key,
                        grant,
                    }]
                } else {
                    debug!(channel = %key, grant, "credit for idle channel ignored");
                    Vec::new()
                }
            }
            Frame::Probe { sent_at_ms } => match self.heartbeat.on_probe(sent_at_ms) {
                Some(sent_at_ms) => vec![Action::Send(Frame::Ack { sent_at_ms })],
                None => Vec::new(),
            },
            Frame::Ack { sent_at_ms } => match self.heartbeat.on_ack(sent_at_ms, now_ms) {
                Some(beat) => vec![Action::Heartbeat(beat)],
                None => {
                    debug!(sent_at_ms, "unmatched heartbeat ack");
                    Vec::new()
                }
            },
        }
    }

    fn on_registry(
        &mut self,
        version: u8,
        window: u32,
        methods: Vec<MethodDescriptor>,
    ) -> Vec<Action> {
        if self.remote.is_some() {
            warn!("second registry frame ignored");
            return Vec::new();
        }
        if version != PROTOCOL_VERSION {
            warn!(version, ours = PROTOCOL_VERSION, "peer speaks a different protocol version");
        }
        self.peer_window = window.max(1);
        debug!(methods = methods.len(), window, "remote registry received");
        self.remote = Some(Registry::from_descriptors(methods.clone()));
        vec![Action::MethodsReady(methods)]
    }

    fn on_call(&mut self, id: CallId, method: String, args: Vec<Value>) -> Vec<Action> {
        if self.remote.is_none() {
            debug!(call = id, "call arrived before the peer's registry");
        }
        if self.serving.contains(&id) {
            warn!(call = id, "duplicate call id dropped");
            return Vec::new();
        }
        let shape = match self.local.check_call(&method, args.len()) {
            Ok(descriptor) => descriptor.shape.clone(),
            Err(e) => {
                debug!(call = id, method = %method, error = %e, "call rejected");
                return vec![Action::Send(Frame::Result {
                    id,
                    outcome: Outcome::Error(e),
                })];
            }
        };
        match shape {
            ResultShape::Callback => {
                self.serving.insert(id);
                vec![Action::Invoke {
                    call: id,
                    method,
                    args: self.args.apply_in(args),
                }]
            }
            ResultShape::Stream(_) | ResultShape::SyncStreams(_) => {
                let channels: Vec<(ChannelKey, StreamSpec)> = shape
                    .stream_specs()
                    .into_iter()
                    .map(|spec| (self.channels.open_local(spec), spec))
                    .collect();
                let descriptors = channels
                    .iter()
                    .map(|(key, spec)| ChannelDescriptor {
                        id: key.id(),
                        spec: *spec,
                    })
                    .collect();
                vec![
                    Action::Send(Frame::Result {
                        id,
                        outcome: Outcome::Streams(descriptors),
                    }),
                    // Static args only shape plain calls.
                    Action::Produce {
                        call: id,
                        method,
                        args,
                        channels,
                    },
                ]
            }
        }
    }

    fn on_result(&mut self, id: CallId, outcome: Outcome) -> Vec<Action> {
        let Some(mut pending) = self.pending.remove(&id) else {
            warn!(call = id, "result for unknown call dropped");
            return Vec::new();
        };
        let failed = |e: CallError| {
            vec![Action::Resolve {
                call: id,
                resolution: Resolution::Failed(e),
            }]
        };
        let descriptors = match (&pending.shape, outcome) {
            (_, Outcome::Error(e)) => return failed(e.into()),
            (ResultShape::Callback, Outcome::Values(values)) => {
                return vec![Action::Resolve {
                    call: id,
                    resolution: Resolution::Values(self.args.apply_out(values)),
                }];
            }
            (ResultShape::Stream(_), Outcome::Streams(d)) if d.len() == 1 => d,
            (ResultShape::SyncStreams(specs), Outcome::Streams(d)) if d.len() == specs.len() => d,
            _ => {
                warn!(call = id, method = %pending.method, "result shape differs from registry");
                return failed(CallError::ShapeMismatch(pending.method));
            }
        };

        let mut actions = Vec::new();
        for d in &descriptors {
            match self.channels.open_remote(d.id, d.spec) {
                Ok(key) => {
                    pending.members.push(key);
                    actions.push(Action::Announce {
                        channel: key,
                        spec: d.spec,
                    });
                }
                Err(e) => {
                    warn!(call = id, error = %e, "bad channel announcement");
                    for key in pending.members.drain(..) {
                        self.channels.remove(key);
                        actions.push(Action::Halt { channel: key });
                        actions.push(Action::Finish {
                            channel: key,
                            error: Some(e.to_string()),
                        });
                    }
                    actions.push(Action::Resolve {
                        call: id,
                        resolution: Resolution::Failed(CallError::StreamFailed(e.to_string())),
                    });
                    return actions;
                }
            }
        }

        if matches!(pending.shape, ResultShape::SyncStreams(_)) && !pending.members.is_empty() {
            // Members whose Ready already arrived cannot exist yet: Ready follows Result on the wire.
            pending.waiting = pending.members.iter().copied().collect();
            for key in &pending.members {
                self.sync_waiters.insert(*key, id);
            }
            self.pending.insert(id, pending);
            return actions;
        }
        actions.push(Action::Resolve {
            call: id,
            resolution: Resolution::Streams(pending.members),
        });
        actions
    }

    fn on_ready(&mut self, key: ChannelKey) -> Vec<Action> {
        if key.is_local() {
            warn!(channel = %key, "peer sent ready for a channel it does not own");
            return Vec::new();
        }
        if let Err(e) = self.channels.mark_ready(key) {
            warn!(channel = %key, error = %e, "stale ready dropped");
            return Vec::new();
        }
        let Some(call) = self.sync_waiters.remove(&key) else {
            return Vec::new();
        };
        let Some(pending) = self.pending.get_mut(&call) else {
            return Vec::new();
        };
        pending.waiting.remove(&key);
        if !pending.waiting.is_empty() {
            return Vec::new();
        }
        let Some(pending) = self.pending.remove(&call) else {
            return Vec::new();
        };
        debug!(call, members = pending.members.len(), "sync streams ready");
        vec![Action::Resolve {
            call,
            resolution: Resolution::Streams(pending.members),
        }]
    }

    fn on_end(&mut self, key: ChannelKey, error: Option<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.channels.finish_recv(key) {
            Ok(_) => {}
            Err(ChannelError::WrongDirection(_)) => {
                // Peer consumes on this channel and gave up: stop producing.
                self.channels.remove(key);
                actions.push(Action::Halt { channel: key });
            }
            Err(e) => {
                warn!(channel = %key, error = %e, "stale end dropped");
                return actions;
            }
        }
        if let Some(call) = self.sync_waiters.remove(&key) {
            let reason = error
                .clone()
                .unwrap_or_else(|| "stream ended before it was ready".to_string());
            actions.extend(self.abandon_sync_call(call, key, reason));
        }
        actions.push(Action::Finish {
            channel: key,
            error,
        });
        actions
    }

    /// A sync member failed before the set was delivered: fail the call, drop the rest.
    fn abandon_sync_call(&mut self, call: CallId, failed: ChannelKey, reason: String) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(pending) = self.pending.remove(&call) else {
            return actions;
        };
        for key in pending.members.into_iter().filter(|k| *k != failed) {
            self.sync_waiters.remove(&key);
            if self.channels.remove(key).is_some() {
                actions.push(Action::Send(Frame::End {
                    channel: key.to_wire(),
                    error: Some("call abandoned".to_string()),
                }));
            }
            actions.push(Action::Halt { channel: key });
            actions.push(Action::Finish {
                channel: key,
                error: Some(reason.clone()),
            });
        }
        actions.push(Action::Halt { channel: failed });
        actions.push(Action::Resolve {
            call,
            resolution: Resolution::Failed(CallError::StreamFailed(reason)),
        });
        actions
    }
}
