//! Error taxonomy for Junction operations.
//!
//! Generic over `V`, the decoded wire value type, so this crate stays
//! serialization-agnostic; the facade crate instantiates `V = rmpv::Value`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Junction operations.
#[derive(Error, Debug, Clone)]
pub enum JunctionError<V> {
    /// No target matched at send time, or `target_count` resolved to 0.
    #[error("no target matches this routing predicate")]
    Unroutable,

    /// A `wait`/`wait_any` exceeded its deadline. The future remains pending.
    #[error("wait timed out after {0:?}")]
    WaitTimeout(Duration),

    /// A response was expected but the responder's connection went down.
    #[error("lost connection to responder")]
    LostConnection,

    /// Handshake malformed or version mismatched.
    #[error("bad handshake: {0}")]
    BadHandshake(String),

    /// Frame truncated at EOF.
    #[error("message cut off")]
    MessageCutOff,

    /// Handler raised a registered user error; reconstructed remotely with
    /// `(peer_addr, *args)`.
    #[error("handled error {code} from {peer_addr}")]
    HandledError {
        code: i32,
        peer_addr: String,
        args: Vec<V>,
    },

    /// Handler raised an unregistered exception.
    #[error("remote exception from {peer_addr}")]
    RemoteException { peer_addr: String, traceback: String },

    /// Target had a service match but no method match.
    #[error("target has no handler for this method")]
    UnsupportedRemoteMethod,

    /// Response carried an unknown result code.
    #[error("unrecognized remote response code {0}")]
    UnrecognizedRemoteProblem(i32),
}

impl<V> JunctionError<V> {
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::LostConnection | Self::BadHandshake(_))
    }
}

pub type Result<T, V> = std::result::Result<T, JunctionError<V>>;
