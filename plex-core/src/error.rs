//! Error kinds shared by the engine and its hosts.

use serde::{Deserialize, Serialize};

/// Error carried inside a `Result` frame. Method-level errors travel unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteError {
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    #[error("argument mismatch calling {method}: expected {expected}, got {got}")]
    ArgumentMismatch {
        method: String,
        expected: usize,
        got: usize,
    },
    #[error("{0}")]
    Failed(String),
    #[error("stream failed: {0}")]
    Stream(String),
}

impl RemoteError {
    pub fn failed(msg: impl Into<String>) -> Self {
        RemoteError::Failed(msg.into())
    }
}

/// What a caller sees when a remote call does not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The peer's registry frame has not arrived yet.
    #[error("remote methods are not available yet")]
    NotReady,
    #[error("no such method: {0}")]
    NoSuchMethod(String),
    #[error("argument mismatch calling {method}: expected {expected}, got {got}")]
    ArgumentMismatch {
        method: String,
        expected: usize,
        got: usize,
    },
    /// The transport ended before the result was delivered.
    #[error("connection closed")]
    ConnectionClosed,
    /// The remote implementation reported an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// A member stream of the result failed before it became ready.
    #[error("stream failed: {0}")]
    StreamFailed(String),
    /// Result shape differs from what the caller asked for or what was advertised.
    #[error("result shape mismatch for {0}")]
    ShapeMismatch(String),
    /// The call frame could not be encoded (too large, or not representable in the codec).
    #[error("call could not be sent: {0}")]
    Unsendable(String),
}

impl From<RemoteError> for CallError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NoSuchMethod(m) => CallError::NoSuchMethod(m),
            RemoteError::ArgumentMismatch {
                method,
                expected,
                got,
            } => CallError::ArgumentMismatch {
                method,
                expected,
                got,
            },
            RemoteError::Failed(msg) => CallError::Remote(msg),
            RemoteError::Stream(msg) => CallError::StreamFailed(msg),
        }
    }
}

/// Local method table misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("duplicate method registration: {0}")]
    DuplicateMethod(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_map_to_call_errors() {
        assert_eq!(
            CallError::from(RemoteError::NoSuchMethod("x".into())),
            CallError::NoSuchMethod("x".into())
        );
        assert_eq!(
            CallError::from(RemoteError::failed("boom")),
            CallError::Remote("boom".into())
        );
        assert_eq!(
            CallError::from(RemoteError::Stream("eof".into())),
            CallError::StreamFailed("eof".into())
        );
    }
}
