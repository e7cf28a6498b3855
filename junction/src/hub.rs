//! The full-mesh node.
//!
//! A `Hub` listens for and dials other hubs, forming a fully-connected mesh
//! where every member sees every other member's subscriptions. Grounded on
//! `monocoque_core::pubsub::hub::PubSubHub`: one task owns all routing state
//! and is driven exclusively by `futures::select!` over two channels — peer
//! events and user commands — with no locks on the hot path. `accept()` is
//! likewise modeled on `XPubSocket::accept`, generalized to perform the
//! ident/subscription handshake before a connection counts as up.

use std::sync::Arc;
use std::time::Duration;

use compio::net::TcpListener;
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use tracing::{info, warn};

use junction_core::error::JunctionError;
use junction_core::future::{RpcFuture, Wait};
use junction_core::ident::Ident;
use junction_core::options::ConnectionOptions;
use junction_core::reconnect::ReconnectState;
use junction_core::subscription::SubscriptionError;
use junction_proto::handshake::{Handshake, SubscriptionSnapshot};
use junction_proto::value::Value;

use crate::dispatcher::{Dispatcher, HandlerError, LocalHandler, PublishHandler, Role, RpcHandler};
use crate::hooks::{ConnectionLost, DefaultSelectPeer, NoopConnectionLost, SelectPeer};
use crate::peer::{self, PeerEvent, PeerHandle};

/// One arriving event a hub's dispatcher task reacts to: a peer connection
/// finished its handshake, or forwarded a decoded message, or went down.
enum HubEvent {
    Connected { handle: PeerHandle, subscriptions: Vec<SubscriptionSnapshot> },
    FromPeer(Ident, PeerEvent),
}

/// A request from the public `Hub` handle into the owning dispatcher task.
enum Command {
    Publish {
        service: Value,
        routing_id: u64,
        method: String,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
        singular: bool,
        reply: Sender<bool>,
    },
    Rpc {
        service: Value,
        routing_id: u64,
        method: String,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
        singular: bool,
        reply: Sender<RpcFuture<Value>>,
    },
    AcceptPublish {
        service: Value,
        mask: u64,
        value: u64,
        method: String,
        handler: PublishHandler,
        schedule: bool,
        reply: Sender<Result<(), SubscriptionError>>,
    },
    AcceptRpc {
        service: Value,
        mask: u64,
        value: u64,
        method: String,
        handler: RpcHandler,
        schedule: bool,
        reply: Sender<Result<(), SubscriptionError>>,
    },
    PublishChunks {
        service: Value,
        routing_id: u64,
        method: String,
        kwargs: Vec<(Value, Value)>,
        chunks: Vec<Value>,
        reply: Sender<bool>,
    },
    PublishReceiverCount {
        service: Value,
        routing_id: u64,
        reply: Sender<usize>,
    },
    RpcReceiverCount {
        service: Value,
        routing_id: u64,
        method: String,
        reply: Sender<usize>,
    },
    Shutdown,
}

/// Handle to a running hub. Cloning shares the same background dispatcher
/// task; dropping every clone does not stop it — call [`Hub::shutdown`].
#[derive(Clone)]
pub struct Hub {
    ident: Ident,
    cmd_tx: Sender<Command>,
    event_tx: Sender<HubEvent>,
}

impl Hub {
    /// Bind a listener at `addr` and start the dispatcher task with default
    /// hooks and connection options.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, HubError> {
        Self::bind_with(addr, ConnectionOptions::default(), Arc::new(DefaultSelectPeer), Arc::new(NoopConnectionLost)).await
    }

    /// Bind with explicit options and hooks.
    pub async fn bind_with(
        addr: impl AsRef<str>,
        options: ConnectionOptions,
        select_peer: Arc<dyn SelectPeer>,
        connection_lost: Arc<dyn ConnectionLost>,
    ) -> Result<Self, HubError> {
        let listener = TcpListener::bind(addr.as_ref()).await.map_err(HubError::Io)?;
        let local_addr = listener.local_addr().map_err(HubError::Io)?;
        let ident = Ident::new(local_addr.ip().to_string(), local_addr.port());

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();

        compio::runtime::spawn(accept_loop(listener, ident.clone(), options.clone(), event_tx.clone())).detach();
        compio::runtime::spawn(run(Dispatcher::new(Role::Hub, ident.clone(), select_peer, connection_lost), cmd_rx, event_rx)).detach();

        info!(ident = %ident, "hub listening");
        Ok(Self { ident, cmd_tx, event_tx })
    }

    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    /// Dial another hub. Retries with exponential backoff per `options`
    /// until a handshake succeeds; keeps redialing if the connection later
    /// drops. Runs until the dispatcher task itself is gone.
    pub fn connect(&self, addr: impl Into<String>, options: ConnectionOptions) {
        let addr = addr.into();
        let ident = self.ident.clone();
        let event_tx = self.event_tx.clone();
        compio::runtime::spawn(dial_loop(addr, ident, options, event_tx)).detach();
    }

    pub async fn publish(&self, service: Value, routing_id: u64, method: impl Into<String>, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> bool {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::Publish {
            service,
            routing_id,
            method: method.into(),
            args,
            kwargs,
            singular,
            reply,
        });
        rx.recv_async().await.unwrap_or(false)
    }

    pub async fn send_rpc(&self, service: Value, routing_id: u64, method: impl Into<String>, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> RpcFuture<Value> {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::Rpc {
            service,
            routing_id,
            method: method.into(),
            args,
            kwargs,
            singular,
            reply,
        });
        rx.recv_async().await.unwrap_or_else(|_| RpcFuture::new(0, 0))
    }

    /// Send an RPC and wait for it to complete, honoring `timeout`.
    pub async fn rpc(
        &self,
        service: Value,
        routing_id: u64,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
        singular: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<Result<Value, JunctionError<Value>>>, JunctionError<Value>> {
        let future = self.send_rpc(service, routing_id, method, args, kwargs, singular).await;
        future.wait(timeout).await
    }

    /// Block until any of `futures` completes.
    pub async fn wait_any(futures: &[RpcFuture<Value>], timeout: Option<Duration>) {
        let wait = Wait::new();
        for f in futures {
            wait.attach(f);
        }
        wait.wait(timeout).await;
    }

    pub async fn accept_publish(
        &self,
        service: Value,
        mask: u64,
        value: u64,
        method: impl Into<String>,
        handler: impl Fn(Vec<Value>, Vec<(Value, Value)>) + Send + Sync + 'static,
    ) -> Result<(), SubscriptionError> {
        self.accept_publish_scheduled(service, mask, value, method, handler, false).await
    }

    pub async fn accept_publish_scheduled(
        &self,
        service: Value,
        mask: u64,
        value: u64,
        method: impl Into<String>,
        handler: impl Fn(Vec<Value>, Vec<(Value, Value)>) + Send + Sync + 'static,
        schedule: bool,
    ) -> Result<(), SubscriptionError> {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::AcceptPublish {
            service,
            mask,
            value,
            method: method.into(),
            handler: Arc::new(handler),
            schedule,
            reply,
        });
        rx.recv_async().await.unwrap_or(Ok(()))
    }

    pub async fn accept_rpc(
        &self,
        service: Value,
        mask: u64,
        value: u64,
        method: impl Into<String>,
        handler: impl Fn(Vec<Value>, Vec<(Value, Value)>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    ) -> Result<(), SubscriptionError> {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::AcceptRpc {
            service,
            mask,
            value,
            method: method.into(),
            handler: Arc::new(handler),
            schedule: false,
            reply,
        });
        rx.recv_async().await.unwrap_or(Ok(()))
    }

    /// Stream `chunks` as a `PUBLISH_IS_CHUNKED`/`_CHUNK`/`_END` sequence
    /// instead of a single `publish`. Returns `false` if nothing subscribes.
    pub async fn publish_chunks(
        &self,
        service: Value,
        routing_id: u64,
        method: impl Into<String>,
        kwargs: Vec<(Value, Value)>,
        chunks: impl IntoIterator<Item = Value>,
    ) -> bool {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::PublishChunks {
            service,
            routing_id,
            method: method.into(),
            kwargs,
            chunks: chunks.into_iter().collect(),
            reply,
        });
        rx.recv_async().await.unwrap_or(false)
    }

    pub async fn publish_receiver_count(&self, service: Value, routing_id: u64) -> usize {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::PublishReceiverCount { service, routing_id, reply });
        rx.recv_async().await.unwrap_or(0)
    }

    pub async fn rpc_receiver_count(&self, service: Value, routing_id: u64, method: impl Into<String>) -> usize {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::RpcReceiverCount {
            service,
            routing_id,
            method: method.into(),
            reply,
        });
        rx.recv_async().await.unwrap_or(0)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

#[derive(Debug)]
pub enum HubError {
    Io(std::io::Error),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "hub bind failed: {e}"),
        }
    }
}
impl std::error::Error for HubError {}

async fn accept_loop(listener: TcpListener, local_ident: Ident, options: ConnectionOptions, events: Sender<HubEvent>) {
    let ours = Handshake::new(local_ident, Vec::new());
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "hub accept failed");
                continue;
            }
        };
        let ours = ours.clone();
        let options = options.clone();
        let events = events.clone();
        compio::runtime::spawn(async move {
            match peer::exchange_handshake(&mut stream, &ours).await {
                Ok(remote) => {
                    let peer_events: Sender<(Ident, PeerEvent)> = {
                        let (tx, rx) = flume::unbounded();
                        compio::runtime::spawn(forward_peer_events(rx, events.clone())).detach();
                        tx
                    };
                    let handle = peer::spawn(stream, remote.ident, false, options, peer_events);
                    let _ = events.send(HubEvent::Connected { handle, subscriptions: remote.subscriptions });
                }
                Err(e) => warn!(peer = %addr, error = %e, "inbound handshake failed"),
            }
        })
        .detach();
    }
}

/// Dial a single address, retrying with backoff until a handshake succeeds,
/// then keep redialing every time that connection later drops. Runs until
/// the dispatcher task itself is gone (its event receiver dropped).
async fn dial_loop(addr: String, local_ident: Ident, options: ConnectionOptions, events: Sender<HubEvent>) {
    let mut backoff = ReconnectState::new(&options);
    loop {
        let ours = Handshake::new(local_ident.clone(), Vec::new());
        match compio::net::TcpStream::connect(&addr).await {
            Ok(mut stream) => match peer::exchange_handshake(&mut stream, &ours).await {
                Ok(remote) => {
                    backoff.reset();
                    let peer_events: Sender<(Ident, PeerEvent)> = {
                        let (tx, rx) = flume::unbounded();
                        compio::runtime::spawn(forward_peer_events(rx, events.clone())).detach();
                        tx
                    };
                    let handle = peer::spawn(stream, remote.ident, true, options.clone(), peer_events);
                    if events
                        .send(HubEvent::Connected { handle: handle.clone(), subscriptions: remote.subscriptions })
                        .is_err()
                    {
                        return;
                    }
                    while handle.is_up() {
                        compio::time::sleep(Duration::from_millis(200)).await;
                    }
                    continue;
                }
                Err(e) => warn!(addr = %addr, error = %e, "outbound handshake failed, retrying"),
            },
            Err(e) => warn!(addr = %addr, error = %e, "dial failed, retrying"),
        }
        compio::time::sleep(backoff.next_delay()).await;
    }
}

async fn forward_peer_events(rx: Receiver<(Ident, PeerEvent)>, events: Sender<HubEvent>) {
    while let Ok((ident, event)) = rx.recv_async().await {
        if events.send(HubEvent::FromPeer(ident, event)).is_err() {
            return;
        }
    }
}

async fn run(mut dispatcher: Dispatcher, cmd_rx: Receiver<Command>, event_rx: Receiver<HubEvent>) {
    loop {
        select! {
            event = event_rx.recv_async().fuse() => {
                match event {
                    Ok(HubEvent::Connected { handle, subscriptions }) => {
                        let subs: Vec<(u8, Value, u64, u64)> = subscriptions
                            .into_iter()
                            .map(|s| (s.msg_type, s.service, s.mask, s.value))
                            .collect();
                        dispatcher.register_peer(handle, &subs);
                    }
                    Ok(HubEvent::FromPeer(ident, PeerEvent::Message(message))) => {
                        dispatcher.incoming(&ident, message);
                    }
                    Ok(HubEvent::FromPeer(ident, PeerEvent::Down)) => {
                        dispatcher.drop_peer(&ident);
                    }
                    Err(_) => break,
                }
            }
            cmd = cmd_rx.recv_async().fuse() => {
                match cmd {
                    Ok(Command::Publish { service, routing_id, method, args, kwargs, singular, reply }) => {
                        let delivered = dispatcher.publish(service, routing_id, &method, args, kwargs, singular);
                        let _ = reply.send(delivered);
                    }
                    Ok(Command::Rpc { service, routing_id, method, args, kwargs, singular, reply }) => {
                        let future = dispatcher.rpc(service, routing_id, &method, args, kwargs, singular);
                        let _ = reply.send(future);
                    }
                    Ok(Command::AcceptPublish { service, mask, value, method, handler, schedule, reply }) => {
                        let result = dispatcher.add_local(
                            junction_proto::message::MsgType::Publish,
                            service,
                            mask,
                            value,
                            method,
                            LocalHandler::Publish { handler, schedule },
                        );
                        let _ = reply.send(result);
                    }
                    Ok(Command::AcceptRpc { service, mask, value, method, handler, schedule, reply }) => {
                        let result = dispatcher.add_local(
                            junction_proto::message::MsgType::RpcRequest,
                            service,
                            mask,
                            value,
                            method,
                            LocalHandler::Rpc { handler, schedule },
                        );
                        let _ = reply.send(result);
                    }
                    Ok(Command::PublishChunks { service, routing_id, method, kwargs, chunks, reply }) => {
                        let delivered = dispatcher.publish_chunks(service, routing_id, &method, kwargs, chunks);
                        let _ = reply.send(delivered);
                    }
                    Ok(Command::PublishReceiverCount { service, routing_id, reply }) => {
                        let _ = reply.send(dispatcher.publish_receiver_count(&service, routing_id));
                    }
                    Ok(Command::RpcReceiverCount { service, routing_id, method, reply }) => {
                        let _ = reply.send(dispatcher.rpc_receiver_count(&service, routing_id, &method));
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                }
            }
        }
    }
}
