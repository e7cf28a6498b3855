//! Junction Proto
//!
//! Sans-IO wire protocol for Junction: length-prefixed framing (`codec`),
//! the tagged wire value (`value`), the ten message types (`message`), and
//! the handshake payload (`handshake`). No sockets — the facade crate drives
//! actual I/O against these pure encode/decode functions.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod value;

pub mod prelude {
    pub use crate::codec::{encode_frame, FrameDecoder, FrameError};
    pub use crate::handshake::{Handshake, HandshakeError, SubscriptionSnapshot};
    pub use crate::message::{rc, Message, MessageError, MsgType};
    pub use crate::value::Value;
}
