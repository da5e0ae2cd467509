//! Plex duplex RPC protocol engine.
//! Host-driven: no I/O; host passes frames, ticks and calls in and performs the returned actions.

pub mod channel;
pub mod error;
pub mod heartbeat;
pub mod inject;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod wire;

pub use channel::{ChannelError, ChannelKey, DEFAULT_WINDOW};
pub use error::{CallError, ProtocolError, RemoteError};
pub use heartbeat::{Beat, HeartbeatConfig, DEFAULT_MAX_MISSED_BEATS};
pub use protocol::{
    CallId, Direction, Encoding, Frame, MethodDescriptor, ResultShape, StreamSpec, Value,
    PROTOCOL_VERSION,
};
pub use registry::Registry;
pub use session::{Action, CoreConfig, Resolution, Session};
pub use wire::{
    decode_frame, encode_frame, Codec, CodecKind, FrameDecodeError, FrameEncodeError,
    MAX_FRAME_LEN,
};
