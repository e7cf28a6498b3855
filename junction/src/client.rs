//! The single-upstream node.
//!
//! A `Client` holds exactly one connection to a hub and proxies every
//! publish/RPC through it (`Dispatcher` with `Role::Client` routes outbound
//! traffic through `send_proxied_publish`/`send_proxied_rpc` instead of the
//! hub's direct fan-out). Structurally this is `hub.rs`'s dispatcher task cut
//! down to one connection and no listener: same two-channel `select!` loop,
//! grounded on the same `monocoque_core::pubsub::hub::PubSubHub` pattern.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use tracing::{info, warn};

use junction_core::error::JunctionError;
use junction_core::future::{RpcFuture, Wait};
use junction_core::ident::Ident;
use junction_core::options::ConnectionOptions;
use junction_core::reconnect::ReconnectState;
use junction_core::subscription::SubscriptionError;
use junction_proto::handshake::Handshake;
use junction_proto::value::Value;

use crate::dispatcher::{Dispatcher, HandlerError, LocalHandler, PublishHandler, Role, RpcHandler};
use crate::hooks::{ConnectionLost, DefaultSelectPeer, NoopConnectionLost, SelectPeer};
use crate::peer::{self, PeerEvent, PeerHandle};

enum ClientEvent {
    Connected { handle: PeerHandle },
    FromUpstream(PeerEvent),
}

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
    RpcReceiverCount {
        service: Value,
        routing_id: u64,
        method: String,
        reply: Sender<usize>,
    },
    WaitConnected {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Handle to a running client. Cloning shares the background dispatcher
/// task; dropping every clone does not stop it — call [`Client::shutdown`].
#[derive(Clone)]
pub struct Client {
    cmd_tx: Sender<Command>,
}

impl Client {
    /// Dial `addr` and start the dispatcher task with default hooks and
    /// connection options. Does not block for the handshake to complete —
    /// use [`Client::wait_connected`] if the caller needs that.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::connect_with(addr, ConnectionOptions::default(), Arc::new(DefaultSelectPeer), Arc::new(NoopConnectionLost))
    }

    /// Dial with explicit options and hooks.
    pub fn connect_with(
        addr: impl Into<String>,
        options: ConnectionOptions,
        select_peer: Arc<dyn SelectPeer>,
        connection_lost: Arc<dyn ConnectionLost>,
    ) -> Self {
        let addr = addr.into();
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();

        // A client's own ident only matters for duplicate-connection
        // resolution, which never arises here: a client dials a single
        // upstream sequentially and never accepts inbound connections.
        let local_ident = Ident::new("0.0.0.0", 0);

        compio::runtime::spawn(dial_loop(addr, options, event_tx)).detach();
        compio::runtime::spawn(run(Dispatcher::new(Role::Client, local_ident, select_peer, connection_lost), cmd_rx, event_rx)).detach();

        Self { cmd_tx }
    }

    /// Block until the upstream connection has completed its handshake at
    /// least once.
    pub async fn wait_connected(&self) {
        let (reply, rx) = flume::bounded(1);
        let _ = self.cmd_tx.send(Command::WaitConnected { reply });
        let _ = rx.recv_async().await;
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

    /// Ask the upstream hub how many targets would answer this RPC right
    /// now. A client has no view of the mesh's subscriptions itself, so this
    /// round-trips through `PROXY_QUERY_COUNT`.
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

async fn dial_loop(addr: String, options: ConnectionOptions, events: Sender<ClientEvent>) {
    let mut backoff = ReconnectState::new(&options);
    // A client's own ident only matters if it ever accepts inbound
    // connections, which it never does — port 0 marks "not listening".
    let local_ident = Ident::new("0.0.0.0", 0);
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
                    if events.send(ClientEvent::Connected { handle: handle.clone() }).is_err() {
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

async fn forward_peer_events(rx: Receiver<(Ident, PeerEvent)>, events: Sender<ClientEvent>) {
    while let Ok((_ident, event)) = rx.recv_async().await {
        if events.send(ClientEvent::FromUpstream(event)).is_err() {
            return;
        }
    }
}

async fn run(mut dispatcher: Dispatcher, cmd_rx: Receiver<Command>, event_rx: Receiver<ClientEvent>) {
    let mut upstream_ident: Option<Ident> = None;
    let mut connect_waiters: Vec<Sender<()>> = Vec::new();

    loop {
        select! {
            event = event_rx.recv_async().fuse() => {
                match event {
                    Ok(ClientEvent::Connected { handle }) => {
                        upstream_ident = Some(handle.ident.clone());
                        dispatcher.register_peer(handle, &[]);
                        for waiter in connect_waiters.drain(..) {
                            let _ = waiter.send(());
                        }
                        info!("client connected to upstream");
                    }
                    Ok(ClientEvent::FromUpstream(PeerEvent::Message(message))) => {
                        if let Some(ident) = &upstream_ident {
                            dispatcher.incoming(ident, message);
                        }
                    }
                    Ok(ClientEvent::FromUpstream(PeerEvent::Down)) => {
                        if let Some(ident) = upstream_ident.take() {
                            dispatcher.drop_peer(&ident);
                        }
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
                    Ok(Command::RpcReceiverCount { service, routing_id, method, reply }) => {
                        dispatcher.query_rpc_receiver_count(service, routing_id, &method, reply);
                    }
                    Ok(Command::WaitConnected { reply }) => {
                        if upstream_ident.is_some() {
                            let _ = reply.send(());
                        } else {
                            connect_waiters.push(reply);
                        }
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                }
            }
        }
    }
}
