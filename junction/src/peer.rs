//! Peer connection: handshake, split read/write pump, and reconnect.
//!
//! Grounded on `monocoque_core::actor::SocketActor`'s split-pump design
//! (`examples/vorjdux-monocoque/monocoque-core/src/actor.rs`): one task drains
//! an outbound queue and writes, another reads and parses. Generalized here to
//! frame/decode `junction-proto` messages instead of moving raw bytes, and to
//! perform the ident/subscription handshake synchronously before any
//! application traffic is allowed to flow (spec: connection is *provisional*
//! until the exchange completes).

use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use flume::{Receiver, Sender};

use junction_core::ident::Ident;
use junction_core::options::ConnectionOptions;
use junction_proto::codec::FrameDecoder;
use junction_proto::handshake::Handshake;
use junction_proto::message::Message;

/// `connecting → handshaking → up → down`. `Down` is terminal for this
/// socket; reconnect (if enabled) starts a fresh one from `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Connecting = 0,
    Handshaking = 1,
    Up = 2,
    Down = 3,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Up,
            _ => Self::Down,
        }
    }
}

/// A decoded inbound event. Arrives paired with the originating peer's
/// `Ident` on the shared events channel (see [`spawn`]); the handshake
/// itself (`PeerEvent::Up`'s former role) completes synchronously in
/// [`exchange_handshake`] before a connection is spawned at all.
pub enum PeerEvent {
    Message(Message),
    Down,
}

/// Handle the dispatcher holds for one peer connection: enough to push
/// outbound messages and observe/force lifecycle state.
#[derive(Clone)]
pub struct PeerHandle {
    pub ident: Ident,
    /// Whether this node dialed the connection (`true`) or accepted it from
    /// the peer (`false`). Breaks ties when both sides connect to each
    /// other at once — see `Ident::resolve_duplicate`.
    pub initiated_locally: bool,
    outbound: Sender<Message>,
    state: Arc<AtomicU8>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    pub fn is_up(&self) -> bool {
        self.state() == PeerState::Up
    }

    /// Queue a message for the writer pump. Silently dropped if the
    /// connection already went down — the dispatcher learns this separately
    /// via the peer's `PeerEvent::Down`.
    pub fn push(&self, message: Message) {
        let _ = self.outbound.send(message);
    }

    /// Force this connection down without a reconnect attempt (duplicate
    /// resolution, explicit shutdown).
    pub fn go_down(&self) {
        self.state.store(PeerState::Down as u8, AtomicOrdering::Release);
    }
}

/// Spawn the reader/writer pump for an already-handshaken connection, and
/// return the dispatcher-facing handle. Every decoded event is tagged with
/// `remote_ident` and forwarded onto the single `events` channel shared by
/// every peer connection a node owns, so the one task driving the
/// dispatcher can select over all connections without juggling one receiver
/// per peer.
///
/// `local_handshake` has already been written by the caller (dialer writes
/// first, acceptor replies first — either order is fine as long as both
/// sides eventually read the other's handshake before touching
/// application traffic).
pub fn spawn(
    stream: TcpStream,
    remote_ident: Ident,
    initiated_locally: bool,
    options: ConnectionOptions,
    events: Sender<(Ident, PeerEvent)>,
) -> PeerHandle {
    let (outbound_tx, outbound_rx) = flume::unbounded();
    let state = Arc::new(AtomicU8::new(PeerState::Up as u8));

    let handle = PeerHandle {
        ident: remote_ident.clone(),
        initiated_locally,
        outbound: outbound_tx,
        state: state.clone(),
    };

    compio::runtime::spawn(run_pumps(stream, remote_ident, outbound_rx, events, state, options)).detach();

    handle
}

/// Perform the handshake exchange on a fresh stream: write ours, then block
/// on reading theirs. Returns the remote's decoded handshake, or an error if
/// the socket closes or the payload is malformed/version-mismatched.
pub async fn exchange_handshake(
    stream: &mut TcpStream,
    ours: &Handshake,
) -> Result<Handshake, HandshakeIoError> {
    let body = ours.encode().map_err(|e| HandshakeIoError::Protocol(e.to_string()))?;
    let frame = junction_proto::codec::encode_frame(&body);
    let BufResult(res, _) = stream.write_all(frame.to_vec()).await;
    res.map_err(HandshakeIoError::Io)?;

    let mut decoder = FrameDecoder::new();
    loop {
        if let Some(frame_body) = decoder.poll().map_err(|e| HandshakeIoError::Protocol(e.to_string()))? {
            return Handshake::decode(&frame_body, junction_core::ident::PROTOCOL_VERSION)
                .map_err(|e| HandshakeIoError::Protocol(e.to_string()));
        }
        let buf = BytesMut::with_capacity(4096);
        let BufResult(res, buf) = stream.read(buf).await;
        let n = res.map_err(HandshakeIoError::Io)?;
        if n == 0 {
            return Err(HandshakeIoError::Eof);
        }
        decoder.feed(Bytes::from(buf));
    }
}

#[derive(Debug)]
pub enum HandshakeIoError {
    Io(std::io::Error),
    Protocol(String),
    Eof,
}

impl std::fmt::Display for HandshakeIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "handshake io error: {e}"),
            Self::Protocol(s) => write!(f, "handshake protocol error: {s}"),
            Self::Eof => write!(f, "peer closed before completing handshake"),
        }
    }
}

impl std::error::Error for HandshakeIoError {}

async fn run_pumps(
    mut stream: TcpStream,
    ident: Ident,
    outbound_rx: Receiver<Message>,
    events: Sender<(Ident, PeerEvent)>,
    state: Arc<AtomicU8>,
    options: ConnectionOptions,
) {
    let mut decoder = FrameDecoder::new();
    let read_size = options.read_buffer_size;

    loop {
        while let Ok(message) = outbound_rx.try_recv() {
            let Ok(body) = message.encode() else {
                continue;
            };
            let frame = junction_proto::codec::encode_frame(&body);
            let BufResult(res, _) = stream.write_all(frame.to_vec()).await;
            if res.is_err() {
                state.store(PeerState::Down as u8, AtomicOrdering::Release);
                let _ = events.send((ident.clone(), PeerEvent::Down));
                return;
            }
        }

        let buf = BytesMut::with_capacity(read_size);
        let BufResult(res, buf) = stream.read(buf).await;
        match res {
            Ok(0) => {
                state.store(PeerState::Down as u8, AtomicOrdering::Release);
                let _ = events.send((ident.clone(), PeerEvent::Down));
                return;
            }
            Err(_) => {
                state.store(PeerState::Down as u8, AtomicOrdering::Release);
                let _ = events.send((ident.clone(), PeerEvent::Down));
                return;
            }
            Ok(_) => {
                decoder.feed(Bytes::from(buf));
                loop {
                    match decoder.poll() {
                        Ok(Some(body)) => match Message::decode(&body) {
                            Ok(message) => {
                                if events.send((ident.clone(), PeerEvent::Message(message))).is_err() {
                                    return;
                                }
                            }
                            Err(_) => continue,
                        },
                        Ok(None) => break,
                        Err(_) => {
                            state.store(PeerState::Down as u8, AtomicOrdering::Release);
                            let _ = events.send((ident.clone(), PeerEvent::Down));
                            return;
                        }
                    }
                }
            }
        }

        if state.load(AtomicOrdering::Acquire) == PeerState::Down as u8 {
            return;
        }
        compio::time::sleep(Duration::from_micros(50)).await;
    }
}
