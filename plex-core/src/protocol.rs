//! Plex wire protocol: frame types, values, method descriptors and version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Current protocol version. Sent in the registry frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Correlates a `Call` frame with its `Result`. Minted by the caller.
pub type CallId = u64;

/// Dynamically typed argument / result / chunk value.
///
/// Every codec must round-trip each variant exactly; an `Int` never comes back
/// as a `Float` and `Bytes` never come back as a `List`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// False if any float inside is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            Value::List(items) => items.iter().all(Value::is_finite),
            Value::Map(map) => map.values().all(Value::is_finite),
            _ => true,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

/// Data flow of a stream channel, seen from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Callee produces, caller reads.
    Read,
    /// Caller produces, callee consumes.
    Write,
    Duplex,
}

impl Direction {
    pub fn caller_reads(self) -> bool {
        matches!(self, Direction::Read | Direction::Duplex)
    }

    pub fn caller_writes(self) -> bool {
        matches!(self, Direction::Write | Direction::Duplex)
    }
}

/// How byte chunks are presented to the reading side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Chunks travel as `Value::Bytes`.
    Binary,
    /// Chunks travel as `Value::Str`; multi-byte characters are never split.
    Utf8,
}

/// Declared shape of one stream member of a method result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub direction: Direction,
    pub encoding: Encoding,
    /// Chunks are arbitrary values rather than byte runs.
    pub object_mode: bool,
}

impl StreamSpec {
    pub fn read(encoding: Encoding) -> Self {
        Self {
            direction: Direction::Read,
            encoding,
            object_mode: false,
        }
    }

    pub fn write(encoding: Encoding) -> Self {
        Self {
            direction: Direction::Write,
            encoding,
            object_mode: false,
        }
    }

    pub fn duplex(encoding: Encoding) -> Self {
        Self {
            direction: Direction::Duplex,
            encoding,
            object_mode: false,
        }
    }

    pub fn objects(direction: Direction) -> Self {
        Self {
            direction,
            encoding: Encoding::Binary,
            object_mode: true,
        }
    }
}

/// Declared result shape of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultShape {
    /// Result values travel inline in the `Result` frame.
    Callback,
    /// One stream, handed to the caller as soon as it is announced.
    Stream(StreamSpec),
    /// Several streams, handed to the caller together once all are ready.
    SyncStreams(Vec<StreamSpec>),
}

impl ResultShape {
    /// Stream members in declaration order (empty for `Callback`).
    pub fn stream_specs(&self) -> Vec<StreamSpec> {
        match self {
            ResultShape::Callback => Vec::new(),
            ResultShape::Stream(spec) => vec![*spec],
            ResultShape::SyncStreams(specs) => specs.clone(),
        }
    }
}

/// What a peer advertises about one of its methods. Implementations never travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    /// Caller-supplied argument count, enforced by the callee when set.
    pub arity: Option<usize>,
    pub shape: ResultShape,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, shape: ResultShape) -> Self {
        Self {
            name: name.into(),
            arity: None,
            shape,
        }
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }
}

/// Which peer minted a channel id, relative to the sender of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    Sender,
    Receiver,
}

/// Channel reference as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: u64,
    pub owner: Owner,
}

/// Channel announced in a stream-shaped `Result`, in production order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: u64,
    pub spec: StreamSpec,
}

/// Body of a `Result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Values(Vec<Value>),
    Error(RemoteError),
    Streams(Vec<ChannelDescriptor>),
}

/// All wire frames. Encoding is pluggable; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Method table of the sender plus the per-channel credit window it grants. Sent once, first.
    Registry {
        version: u8,
        window: u32,
        methods: Vec<MethodDescriptor>,
    },
    Call {
        id: CallId,
        method: String,
        args: Vec<Value>,
    },
    Result {
        id: CallId,
        outcome: Outcome,
    },
    /// The producer-side stream behind this channel is open.
    Ready {
        channel: ChannelRef,
    },
    Chunk {
        channel: ChannelRef,
        seq: u64,
        payload: Value,
    },
    /// No more chunks from the sender on this channel.
    End {
        channel: ChannelRef,
        error: Option<String>,
    },
    /// Sender of this frame accepts `grant` more chunks on the channel.
    Credit {
        channel: ChannelRef,
        grant: u32,
    },
    Probe {
        sent_at_ms: u64,
    },
    Ack {
        sent_at_ms: u64,
    },
}

impl Frame {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Registry { .. } => "registry",
            Frame::Call { .. } => "call",
            Frame::Result { .. } => "result",
            Frame::Ready { .. } => "ready",
            Frame::Chunk { .. } => "chunk",
            Frame::End { .. } => "end",
            Frame::Credit { .. } => "credit",
            Frame::Probe { .. } => "heartbeat-probe",
            Frame::Ack { .. } => "heartbeat-ack",
        }
    }
}
