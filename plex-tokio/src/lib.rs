//! Tokio host for the plex engine: sessions over any duplex byte transport, method tables,
//! remote stream proxies and heartbeat events.

pub mod config;
pub mod method;
pub mod peer;
pub mod stream;
pub mod transport;

pub use config::SessionConfig;
pub use method::{Completion, LocalStream, Method, MethodTable, StreamFuture};
pub use peer::{Event, Events, Peer, RemoteMethod, RemoteMethods, SessionBuilder};
pub use stream::{RemoteDuplex, RemoteReader, RemoteStream, RemoteWriter, StreamError};
pub use transport::{memory_pair, Transport, TransportError};

pub use plex_core::{CallError, CodecKind, Direction, Encoding, RemoteError, StreamSpec, Value};
