//! The message-type state machine.
//!
//! Grounded directly on `junction/core/dispatch.py` from the original
//! distribution: one `Dispatcher` per node (hub or client) owns the local and
//! peer subscription tables, the in-flight RPC/proxy bookkeeping, and the
//! ten-wire-type handler table. It is driven exclusively by the single task
//! that owns a `Hub`/`Client` (see `hub.rs`/`client.rs`) — no locking is
//! needed here, matching the teacher's `PubSubHub`/`RouterHub` pattern of one
//! task owning all routing state and talking to connections only over
//! channels.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use hashbrown::HashMap;
use tracing::{debug, warn};

use junction_core::error::JunctionError;
use junction_core::errors::ErrorRegistry;
use junction_core::future::{RpcFuture, TargetOutcome};
use junction_core::ident::Ident;
use junction_core::registry::{ProxiedClientCounter, ProxyRegistry, RpcRegistry};
use junction_core::subscription::{LocalTable, PeerTable, SubscriptionError};
use junction_proto::message::{rc, Message, MsgType};
use junction_proto::value::Value;

use crate::hooks::{Candidate, ConnectionLost, SelectPeer};
use crate::peer::PeerHandle;

/// A service name is an arbitrary tagged value; wrap it so it can key a
/// `HashMap` (`rmpv::Value` carries floats and isn't `Eq`/`Hash` on its own).
#[derive(Debug, Clone)]
pub struct ServiceKey(pub Value);

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Two equal `Value`s encode identically under `rmpv`'s canonical
        // encoder, so hashing the encoded bytes is consistent with `Eq`.
        match junction_proto::value::encode(&self.0) {
            Ok(bytes) => bytes.hash(state),
            Err(_) => 0u8.hash(state),
        }
    }
}

type TableKey = (MsgType, ServiceKey);

/// Error raised by a user RPC handler, distinguishing a deliberately
/// registered error kind from an unexpected one.
#[derive(Debug, Clone)]
pub enum HandlerError {
    Handled { code: i32, args: Vec<Value> },
    Unknown(String),
}

pub type PublishHandler = std::sync::Arc<dyn Fn(Vec<Value>, Vec<(Value, Value)>) + Send + Sync>;
pub type RpcHandler =
    std::sync::Arc<dyn Fn(Vec<Value>, Vec<(Value, Value)>) -> Result<Value, HandlerError> + Send + Sync>;

#[derive(Clone)]
pub enum LocalHandler {
    Publish { handler: PublishHandler, schedule: bool },
    Rpc { handler: RpcHandler, schedule: bool },
}

/// One proxied RPC a client has in flight with its single upstream hub,
/// keyed by the client-allocated counter it tagged the `PROXY_REQUEST` with.
struct ProxiedClientRpc {
    counter: ProxiedClientCounter,
    future: RpcFuture<Value>,
}

/// An inbound chunked publish stream that has been opened but not yet
/// closed, keyed by `(sender, counter)` since `PUBLISH_CHUNK`/`_END` carry
/// only the counter, not the routing triple.
struct OpenStream {
    service: Value,
    routing_id: u64,
    method: String,
    kwargs: Vec<(Value, Value)>,
}

/// Whether this dispatcher backs a `Hub` (full mesh participant) or a
/// `Client` (single upstream, everything proxied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hub,
    Client,
}

pub struct Dispatcher {
    role: Role,
    local_ident: Ident,
    local: LocalTable<TableKey, LocalHandler>,
    peer_subs: PeerTable<TableKey, Ident>,
    peers: HashMap<Ident, PeerHandle>,
    rpc_registry: RpcRegistry<Candidate, Value>,
    proxy_registry: ProxyRegistry<Ident>,
    proxied_client_rpcs: HashMap<u64, ProxiedClientRpc>,
    next_client_counter: u64,
    open_streams: HashMap<(Ident, u64), OpenStream>,
    /// Pending `rpc_receiver_count` queries this client sent upstream.
    /// `PROXY_QUERY_COUNT` carries no counter of its own, so replies (always
    /// tagged `client_counter: 0`) are matched up FIFO against the order
    /// queries were sent — fine since a client only ever has one upstream
    /// connection to answer them in order.
    query_count_waiters: VecDeque<flume::Sender<usize>>,
    select_peer: std::sync::Arc<dyn SelectPeer>,
    connection_lost: std::sync::Arc<dyn ConnectionLost>,
    pub error_registry: ErrorRegistry,
}

impl Dispatcher {
    pub fn new(
        role: Role,
        local_ident: Ident,
        select_peer: std::sync::Arc<dyn SelectPeer>,
        connection_lost: std::sync::Arc<dyn ConnectionLost>,
    ) -> Self {
        Self {
            role,
            local_ident,
            local: LocalTable::new(),
            peer_subs: PeerTable::new(),
            peers: HashMap::new(),
            rpc_registry: RpcRegistry::new(),
            proxy_registry: ProxyRegistry::new(),
            proxied_client_rpcs: HashMap::new(),
            next_client_counter: 0,
            open_streams: HashMap::new(),
            query_count_waiters: VecDeque::new(),
            select_peer,
            connection_lost,
            error_registry: ErrorRegistry::default(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn upstream(&self) -> Option<&PeerHandle> {
        self.peers.values().next()
    }

    // ---- subscription registration -------------------------------------

    pub fn add_local(
        &mut self,
        msg_type: MsgType,
        service: Value,
        mask: u64,
        value: u64,
        method: impl Into<String>,
        handler: LocalHandler,
    ) -> Result<(), SubscriptionError> {
        let key = (msg_type, ServiceKey(service.clone()));
        let method = method.into();
        let is_new = self.local.add(key, mask, value, method, handler)?;
        if is_new {
            for peer in self.peers.values() {
                if peer.is_up() {
                    peer.push(Message::Announce {
                        target_type: msg_type as u8,
                        service: service.clone(),
                        mask,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn remove_local(&mut self, msg_type: MsgType, service: Value, mask: u64, value: u64) -> bool {
        let key = (msg_type, ServiceKey(service.clone()));
        let removed = self.local.remove(&key, mask, value);
        if removed {
            for peer in self.peers.values() {
                if peer.is_up() {
                    peer.push(Message::Unsubscribe {
                        target_type: msg_type as u8,
                        service: service.clone(),
                        mask,
                        value,
                    });
                }
            }
        }
        removed
    }

    fn find_local(&self, msg_type: MsgType, service: &Value, routing_id: u64, method: &str) -> Option<&LocalHandler> {
        let key = (msg_type, ServiceKey(service.clone()));
        self.local.find(&key, routing_id, method)
    }

    fn locally_handles(&self, msg_type: MsgType, service: &Value, routing_id: u64) -> bool {
        let key = (msg_type, ServiceKey(service.clone()));
        self.local.locally_handles(&key, routing_id)
    }

    fn has_predicate_match_without_method(&self, msg_type: MsgType, service: &Value, routing_id: u64, method: &str) -> bool {
        let key = (msg_type, ServiceKey(service.clone()));
        self.local.has_predicate_match_without_method(&key, routing_id, method)
    }

    fn find_peer_routes(&self, msg_type: MsgType, service: &Value, routing_id: u64) -> Vec<Ident> {
        let key = (msg_type, ServiceKey(service.clone()));
        self.peer_subs
            .find_peers(&key, routing_id)
            .filter(|ident| self.peers.get(ident).is_some_and(PeerHandle::is_up))
            .cloned()
            .collect()
    }

    // ---- peer lifecycle --------------------------------------------------

    /// A handshake completed for `handle`. Resolves a duplicate-ident
    /// collision deterministically, then records the peer's subscription
    /// snapshot. Returns `false` if this connection lost the duplicate race
    /// and was told to go down instead.
    pub fn register_peer(&mut self, handle: PeerHandle, subscriptions: &[(u8, Value, u64, u64)]) -> bool {
        if let Some(existing) = self.peers.get(&handle.ident) {
            let outcome = Ident::resolve_duplicate(&self.local_ident, &handle.ident);
            let keep_existing = match outcome {
                junction_core::ident::DuplicateOutcome::KeepLocallyInitiated => existing.initiated_locally,
                junction_core::ident::DuplicateOutcome::KeepRemotelyInitiated => !existing.initiated_locally,
            };
            if keep_existing {
                handle.go_down();
                return false;
            } else {
                existing.go_down();
                self.drop_peer_internal(&handle.ident.clone(), false);
            }
        }

        let ident = handle.ident.clone();
        self.peers.insert(ident.clone(), handle);
        for (msg_type, service, mask, value) in subscriptions {
            let Some(msg_type) = MsgType::from_u8(*msg_type) else {
                continue;
            };
            let key = (msg_type, ServiceKey(service.clone()));
            if self.peer_subs.add(key, *mask, *value, ident.clone()).is_err() {
                warn!(peer = %ident, "peer announced an impossible subscription at handshake");
            }
        }

        // The handshake only carries the snapshot captured when the dial/
        // accept started; anything registered since (or registered before
        // either side had a peer to announce to at all) still needs telling.
        let announces: Vec<Message> = self
            .local
            .iter_predicates()
            .map(|((msg_type, service_key), mask, value)| Message::Announce {
                target_type: *msg_type as u8,
                service: service_key.0.clone(),
                mask,
                value,
            })
            .collect();
        if let Some(peer) = self.peers.get(&ident) {
            for announce in announces {
                peer.push(announce);
            }
        }
        true
    }

    /// A connection went down. Synthesizes `LostConnection` for everything
    /// still awaited through it and notifies the `connection_lost` hook.
    pub fn drop_peer(&mut self, ident: &Ident) {
        self.drop_peer_internal(ident, true);
    }

    fn drop_peer_internal(&mut self, ident: &Ident, notify: bool) {
        self.peers.remove(ident);

        let stale: Vec<(Ident, u64)> = self
            .open_streams
            .keys()
            .filter(|(peer, _)| peer == ident)
            .cloned()
            .collect();
        for key in stale {
            if let Some(stream) = self.open_streams.remove(&key) {
                self.deliver_chunk(&stream, junction_proto::value::lost_connection());
            }
        }

        // `PeerTable` has no reverse index by peer, so the `connection_lost`
        // hook is told which peer went down but not its exact subscription
        // set. `send_publish`/`send_rpc` re-derive live routes from the table
        // on every call, so routing itself needs no snapshot here.
        let lost_subs: Vec<(u8, Value, u64, u64)> = Vec::new();
        self.peer_subs.remove_peer_everywhere(ident);

        for counter in self.rpc_registry.on_peer_lost(&Candidate::Peer(ident.clone())) {
            debug!(counter, peer = %ident, "synthesized LostConnection for in-flight rpc");
        }

        for (client_counter, client_peer, _last) in self.proxy_registry.on_peer_lost(ident) {
            if let Some(client) = self.peers.get(&client_peer) {
                client.push(Message::ProxyResponse {
                    client_counter,
                    rc: rc::LOST_CONN,
                    result: Value::Nil,
                });
            }
        }

        if notify {
            self.connection_lost.lost(ident, &lost_subs);
        }
    }

    // ---- outbound: publish -----------------------------------------------

    pub fn publish(&mut self, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> bool {
        if self.role == Role::Client {
            return self.send_proxied_publish(service, routing_id, method, args, kwargs, singular);
        }
        self.send_publish(service, routing_id, method, args, kwargs, singular)
    }

    fn send_publish(&mut self, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> bool {
        let peers = self.find_peer_routes(MsgType::Publish, &service, routing_id);
        let local = self.find_local(MsgType::Publish, &service, routing_id, method).cloned();

        let mut targets: Vec<Candidate> = peers.iter().cloned().map(Candidate::Peer).collect();
        if local.is_some() {
            targets.push(Candidate::Local);
        }
        if targets.is_empty() {
            return false;
        }

        let chosen = if singular && targets.len() > 1 {
            vec![self.select_peer.select(&targets, &service, routing_id, method)]
        } else {
            targets
        };

        let handled_locally = chosen.contains(&Candidate::Local);
        let message = Message::Publish {
            service,
            routing_id,
            method: method.to_string(),
            args: args.clone(),
            kwargs: kwargs.clone(),
        };
        for target in &chosen {
            match target {
                Candidate::Local => {
                    if let Some(LocalHandler::Publish { handler, schedule }) = &local {
                        Self::run_publish_handler(handler.clone(), *schedule, args.clone(), kwargs.clone());
                    }
                }
                Candidate::Peer(ident) => {
                    if let Some(peer) = self.peers.get(ident) {
                        peer.push(message.clone());
                    }
                }
            }
        }
        handled_locally || !peers.is_empty()
    }

    fn send_proxied_publish(&mut self, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> bool {
        let Some(upstream) = self.upstream() else {
            return false;
        };
        upstream.push(Message::ProxyPublish {
            service,
            routing_id,
            method: method.to_string(),
            singular,
            args,
            kwargs,
        });
        true
    }

    /// Stream a sequence of chunks as `PUBLISH_IS_CHUNKED` / `_CHUNK` / `_END`.
    /// The Rust analogue of the Python path's duck-typed "unsized iterable"
    /// detection: callers explicitly choose this entry point instead.
    ///
    /// Routes directly like [`Self::send_publish`]; there is no
    /// `ProxyPublishChunked` wire message, so `Client` does not expose this —
    /// only a `Hub`, which always routes directly, can stream chunks.
    pub fn publish_chunks(
        &mut self,
        service: Value,
        routing_id: u64,
        method: &str,
        kwargs: Vec<(Value, Value)>,
        chunks: impl IntoIterator<Item = Value>,
    ) -> bool {
        let peers = self.find_peer_routes(MsgType::Publish, &service, routing_id);
        let local = self.find_local(MsgType::Publish, &service, routing_id, method).cloned();
        if peers.is_empty() && local.is_none() {
            return false;
        }

        let counter = self.rpc_registry.allocate_counter();
        let open = Message::PublishIsChunked {
            service,
            routing_id,
            method: method.to_string(),
            counter,
            kwargs: kwargs.clone(),
        };
        for ident in &peers {
            if let Some(peer) = self.peers.get(ident) {
                peer.push(open.clone());
            }
        }
        for chunk in chunks {
            if let Some(LocalHandler::Publish { handler, schedule }) = &local {
                Self::run_publish_handler(handler.clone(), *schedule, vec![chunk.clone()], kwargs.clone());
            }
            let msg = Message::PublishChunk { counter, item: chunk };
            for ident in &peers {
                if let Some(peer) = self.peers.get(ident) {
                    peer.push(msg.clone());
                }
            }
        }
        let end = Message::PublishEnd { counter };
        for ident in &peers {
            if let Some(peer) = self.peers.get(ident) {
                peer.push(end.clone());
            }
        }
        true
    }

    fn run_publish_handler(handler: PublishHandler, schedule: bool, args: Vec<Value>, kwargs: Vec<(Value, Value)>) {
        if schedule {
            compio::runtime::spawn(async move {
                handler(args, kwargs);
            })
            .detach();
        } else {
            handler(args, kwargs);
        }
    }

    // ---- outbound: rpc -----------------------------------------------

    pub fn rpc(&mut self, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> RpcFuture<Value> {
        if self.role == Role::Client {
            return self.send_proxied_rpc(service, routing_id, method, args, kwargs, singular);
        }
        self.send_rpc(service, routing_id, method, args, kwargs, singular)
    }

    fn send_rpc(&mut self, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> RpcFuture<Value> {
        let peers = self.find_peer_routes(MsgType::RpcRequest, &service, routing_id);
        let local = self.find_local(MsgType::RpcRequest, &service, routing_id, method).cloned();

        let mut targets: Vec<Candidate> = peers.iter().cloned().map(Candidate::Peer).collect();
        if local.is_some() {
            targets.push(Candidate::Local);
        }

        let targets = if singular && targets.len() > 1 {
            vec![self.select_peer.select(&targets, &service, routing_id, method)]
        } else {
            targets
        };

        let (counter, future) = self.rpc_registry.start(targets.clone());

        for target in &targets {
            match target {
                Candidate::Local => {
                    if let Some(LocalHandler::Rpc { handler, .. }) = &local {
                        let outcome = Self::call_rpc_handler(handler, args.clone(), kwargs.clone());
                        self.rpc_registry.on_response(counter, &Candidate::Local, outcome);
                    }
                }
                Candidate::Peer(ident) => {
                    if let Some(peer) = self.peers.get(ident) {
                        peer.push(Message::RpcRequest {
                            counter,
                            service: service.clone(),
                            routing_id,
                            method: method.to_string(),
                            args: args.clone(),
                            kwargs: kwargs.clone(),
                        });
                    }
                }
            }
        }
        future
    }

    fn send_proxied_rpc(&mut self, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>, singular: bool) -> RpcFuture<Value> {
        let future = RpcFuture::pending(self.next_client_counter);
        let client_counter = self.next_client_counter;
        self.next_client_counter += 1;

        let Some(upstream) = self.upstream() else {
            future.declare_target_count(0);
            return future;
        };
        upstream.push(Message::ProxyRequest {
            client_counter,
            service,
            routing_id,
            method: method.to_string(),
            singular,
            args,
            kwargs,
        });
        self.proxied_client_rpcs.insert(
            client_counter,
            ProxiedClientRpc {
                counter: ProxiedClientCounter::new(),
                future: future.clone(),
            },
        );
        future
    }

    fn call_rpc_handler(handler: &RpcHandler, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> TargetOutcome<Value> {
        match handler(args, kwargs) {
            Ok(value) => Ok(value),
            Err(HandlerError::Handled { code, args }) => Err(JunctionError::HandledError {
                code,
                peer_addr: "local".to_string(),
                args,
            }),
            Err(HandlerError::Unknown(text)) => Err(JunctionError::RemoteException {
                peer_addr: "local".to_string(),
                traceback: text,
            }),
        }
    }

    // ---- inbound: dispatch table ------------------------------------------

    pub fn incoming(&mut self, from: &Ident, message: Message) {
        match message {
            Message::Announce { target_type, service, mask, value } => self.incoming_announce(from, target_type, service, mask, value),
            Message::Unsubscribe { target_type, service, mask, value } => self.incoming_unsubscribe(from, target_type, service, mask, value),
            Message::Publish { service, routing_id, method, args, kwargs } => self.incoming_publish(from, service, routing_id, &method, args, kwargs),
            Message::PublishIsChunked { service, routing_id, method, counter, kwargs } => {
                self.open_streams.insert(
                    (from.clone(), counter),
                    OpenStream { service, routing_id, method, kwargs },
                );
            }
            Message::PublishChunk { counter, item } => self.incoming_publish_chunk(from, counter, item),
            Message::PublishEnd { counter } => {
                self.open_streams.remove(&(from.clone(), counter));
            }
            Message::RpcRequest { counter, service, routing_id, method, args, kwargs } => {
                self.incoming_rpc_request(from, counter, service, routing_id, &method, args, kwargs);
            }
            Message::RpcResponse { counter, rc, result } => self.incoming_rpc_response(from, counter, rc, result),
            Message::ProxyPublish { service, routing_id, method, singular, args, kwargs } => {
                self.send_publish(service, routing_id, &method, args, kwargs, singular);
            }
            Message::ProxyRequest { client_counter, service, routing_id, method, singular, args, kwargs } => {
                self.incoming_proxy_request(from, client_counter, service, routing_id, &method, singular, args, kwargs);
            }
            Message::ProxyResponseCount { client_counter, total } => self.incoming_proxy_response_count(client_counter, total),
            Message::ProxyResponse { client_counter, rc, result } => self.incoming_proxy_response(client_counter, rc, result),
            Message::ProxyQueryCount { service, routing_id, method } => self.incoming_proxy_query_count(from, service, routing_id, &method),
        }
    }

    fn incoming_announce(&mut self, from: &Ident, target_type: u8, service: Value, mask: u64, value: u64) {
        let Some(msg_type) = MsgType::from_u8(target_type) else {
            warn!(peer = %from, target_type, "announce named an unknown msg_type");
            return;
        };
        let key = (msg_type, ServiceKey(service));
        if self.peer_subs.add(key, mask, value, from.clone()).is_err() {
            warn!(peer = %from, "announce described an impossible subscription");
        }
    }

    fn incoming_unsubscribe(&mut self, from: &Ident, target_type: u8, service: Value, mask: u64, value: u64) {
        let Some(msg_type) = MsgType::from_u8(target_type) else {
            return;
        };
        let key = (msg_type, ServiceKey(service));
        self.peer_subs.remove(&key, mask, value, from);
    }

    fn incoming_publish(&mut self, from: &Ident, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>) {
        let Some(LocalHandler::Publish { handler, schedule }) = self.find_local(MsgType::Publish, &service, routing_id, method).cloned() else {
            warn!(peer = %from, method, "received mis-delivered publish");
            return;
        };
        Self::run_publish_handler(handler, schedule, args, kwargs);
    }

    /// Deliver one item of an open chunked stream — a plain chunk or the
    /// `lost_connection` sentinel — to the handler registered for the
    /// stream's `(service, routing_id, method)`, re-resolved per chunk so a
    /// handler registered after the stream opened is still picked up.
    fn deliver_chunk(&self, stream: &OpenStream, item: Value) {
        let Some(LocalHandler::Publish { handler, schedule }) =
            self.find_local(MsgType::Publish, &stream.service, stream.routing_id, &stream.method).cloned()
        else {
            return;
        };
        Self::run_publish_handler(handler, schedule, vec![item], stream.kwargs.clone());
    }

    fn incoming_publish_chunk(&mut self, from: &Ident, counter: u64, item: Value) {
        let Some(stream) = self.open_streams.get(&(from.clone(), counter)) else {
            warn!(peer = %from, counter, "publish chunk for unknown stream");
            return;
        };
        self.deliver_chunk(stream, item);
    }

    fn incoming_rpc_request(&mut self, from: &Ident, counter: u64, service: Value, routing_id: u64, method: &str, args: Vec<Value>, kwargs: Vec<(Value, Value)>) {
        let Some(LocalHandler::Rpc { handler, .. }) = self.find_local(MsgType::RpcRequest, &service, routing_id, method).cloned() else {
            let rc = if self.locally_handles(MsgType::RpcRequest, &service, routing_id) {
                rc::NOMETHOD
            } else {
                rc::NOHANDLER
            };
            if let Some(peer) = self.peers.get(from) {
                peer.push(Message::RpcResponse { counter, rc, result: Value::Nil });
            }
            return;
        };

        let outcome = Self::call_rpc_handler(&handler, args, kwargs);
        let (rc, result) = Self::encode_outcome(outcome);
        if let Some(peer) = self.peers.get(from) {
            peer.push(Message::RpcResponse { counter, rc, result });
        }
    }

    fn encode_outcome(outcome: TargetOutcome<Value>) -> (i32, Value) {
        match outcome {
            Ok(value) => (rc::OK, value),
            Err(JunctionError::HandledError { code, args, .. }) => (rc::KNOWN, Value::Array(vec![Value::from(code), Value::Array(args)])),
            Err(JunctionError::RemoteException { traceback, .. }) => (rc::UNKNOWN, Value::from(traceback)),
            Err(_) => (rc::UNKNOWN, Value::Nil),
        }
    }

    /// An `RPC_RESPONSE` arrived from `from`. It belongs either to a proxy
    /// record this hub is carrying on a client's behalf, or to an RPC this
    /// node originated directly — never both, since the counter spaces are
    /// shared but a given counter was allocated for exactly one purpose.
    fn incoming_rpc_response(&mut self, from: &Ident, counter: u64, rc: i32, result: Value) {
        let outcome = Self::decode_outcome(rc, result, &from.to_string());

        if let Some((client_counter, client_peer, _last)) = self.proxy_registry.on_response(counter, from) {
            if let Some(client) = self.peers.get(&client_peer) {
                let (rc, result) = match outcome {
                    Ok(value) => (rc::OK, value),
                    Err(err) => Self::reencode_error(err),
                };
                client.push(Message::ProxyResponse { client_counter, rc, result });
            }
            return;
        }

        self.rpc_registry.on_response(counter, &Candidate::Peer(from.clone()), outcome);
    }

    /// Re-derive a wire `(rc, result)` pair from a decoded error, for
    /// forwarding a proxy-internal response onward as a `PROXY_RESPONSE`
    /// without re-deriving the original bytes.
    fn reencode_error(err: JunctionError<Value>) -> (i32, Value) {
        match err {
            JunctionError::Unroutable => (rc::NOHANDLER, Value::Nil),
            JunctionError::UnsupportedRemoteMethod => (rc::NOMETHOD, Value::Nil),
            JunctionError::HandledError { code, args, .. } => (rc::KNOWN, Value::Array(vec![Value::from(code), Value::Array(args)])),
            JunctionError::RemoteException { traceback, .. } => (rc::UNKNOWN, Value::from(traceback)),
            JunctionError::LostConnection => (rc::LOST_CONN, Value::Nil),
            JunctionError::UnrecognizedRemoteProblem(code) => (code, Value::Nil),
            JunctionError::BadHandshake(_) | JunctionError::WaitTimeout(_) | JunctionError::MessageCutOff => (rc::UNKNOWN, Value::Nil),
        }
    }

    fn incoming_proxy_request(
        &mut self,
        from: &Ident,
        client_counter: u64,
        service: Value,
        routing_id: u64,
        method: &str,
        singular: bool,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    ) {
        let local = self.find_local(MsgType::RpcRequest, &service, routing_id, method).cloned();
        let mut peer_targets = self.find_peer_routes(MsgType::RpcRequest, &service, routing_id);

        let mut target_count = peer_targets.len() + usize::from(local.is_some());
        let mut serve_local = local.clone();

        if target_count > 1 && singular {
            let mut candidates: Vec<Candidate> = peer_targets.iter().cloned().map(Candidate::Peer).collect();
            if local.is_some() {
                candidates.push(Candidate::Local);
            }
            let chosen = self.select_peer.select(&candidates, &service, routing_id, method);
            target_count = 1;
            match chosen {
                Candidate::Local => peer_targets.clear(),
                Candidate::Peer(ident) => {
                    serve_local = None;
                    peer_targets = vec![ident];
                }
            }
        }

        if let (Some(LocalHandler::Rpc { handler, .. }), Some(from_peer)) = (&serve_local, self.peers.get(from).cloned()) {
            let outcome = Self::call_rpc_handler(handler, args.clone(), kwargs.clone());
            let (rc, result) = Self::encode_outcome(outcome);
            from_peer.push(Message::ProxyResponse { client_counter, rc, result });
        }

        if !peer_targets.is_empty() {
            let internal_counter = self.rpc_registry.allocate_counter();
            for ident in &peer_targets {
                if let Some(peer) = self.peers.get(ident) {
                    peer.push(Message::RpcRequest {
                        counter: internal_counter,
                        service: service.clone(),
                        routing_id,
                        method: method.to_string(),
                        args: args.clone(),
                        kwargs: kwargs.clone(),
                    });
                }
            }
            self.proxy_registry.start(internal_counter, client_counter, from.clone(), &peer_targets);
        }

        let mut send_nomethod = false;
        if serve_local.is_none() && peer_targets.is_empty() && self.has_predicate_match_without_method(MsgType::RpcRequest, &service, routing_id, method) {
            target_count += 1;
            send_nomethod = true;
        }

        if let Some(from_peer) = self.peers.get(from) {
            from_peer.push(Message::ProxyResponseCount { client_counter, total: target_count as i64 });
            if send_nomethod {
                from_peer.push(Message::ProxyResponse { client_counter, rc: rc::NOMETHOD, result: Value::Nil });
            }
        }
    }

    fn incoming_proxy_response_count(&mut self, client_counter: u64, total: i64) {
        if let Some(entry) = self.proxied_client_rpcs.get_mut(&client_counter) {
            entry.counter.expect(total.max(0) as usize);
            entry.future.declare_target_count(total.max(0) as usize);
            if entry.counter.is_complete() {
                self.proxied_client_rpcs.remove(&client_counter);
            }
        }
    }

    fn incoming_proxy_response(&mut self, client_counter: u64, rc: i32, result: Value) {
        if client_counter == 0 {
            if let Some(waiter) = self.query_count_waiters.pop_front() {
                let count = if rc == rc::OK { result.as_u64().unwrap_or(0) as usize } else { 0 };
                let _ = waiter.send(count);
                return;
            }
        }
        let outcome = Self::decode_outcome(rc, result, "upstream");
        if let Some(entry) = self.proxied_client_rpcs.get_mut(&client_counter) {
            entry.future.push_result(outcome);
            if entry.counter.on_response() {
                self.proxied_client_rpcs.remove(&client_counter);
            }
        }
    }

    fn decode_outcome(rc: i32, result: Value, peer_addr: &str) -> TargetOutcome<Value> {
        match rc {
            rc::OK => Ok(result),
            rc::NOHANDLER => Err(JunctionError::Unroutable),
            rc::NOMETHOD => Err(JunctionError::UnsupportedRemoteMethod),
            rc::KNOWN => {
                if let Value::Array(mut fields) = result {
                    if fields.len() == 2 {
                        let args = match fields.pop() {
                            Some(Value::Array(a)) => a,
                            _ => Vec::new(),
                        };
                        let code = fields.pop().and_then(|v| v.as_i64()).unwrap_or_default() as i32;
                        return Err(JunctionError::HandledError { code, peer_addr: peer_addr.to_string(), args });
                    }
                }
                Err(JunctionError::UnrecognizedRemoteProblem(rc))
            }
            rc::UNKNOWN => Err(JunctionError::RemoteException {
                peer_addr: peer_addr.to_string(),
                traceback: result.as_str().unwrap_or_default().to_string(),
            }),
            rc::UNSER_RESP => Err(JunctionError::RemoteException {
                peer_addr: peer_addr.to_string(),
                traceback: "remote handler returned an unserializable value".to_string(),
            }),
            rc::LOST_CONN => Err(JunctionError::LostConnection),
            other => Err(JunctionError::UnrecognizedRemoteProblem(other)),
        }
    }

    /// Count of distinct targets (local + peer) that would receive a publish
    /// on `(service, routing_id)` right now, independent of method.
    pub fn publish_receiver_count(&self, service: &Value, routing_id: u64) -> usize {
        usize::from(self.locally_handles(MsgType::Publish, service, routing_id)) + self.find_peer_routes(MsgType::Publish, service, routing_id).len()
    }

    /// Count of distinct targets that would receive an RPC on
    /// `(service, routing_id, method)` right now.
    pub fn rpc_receiver_count(&self, service: &Value, routing_id: u64, method: &str) -> usize {
        usize::from(self.find_local(MsgType::RpcRequest, service, routing_id, method).is_some()) + self.find_peer_routes(MsgType::RpcRequest, service, routing_id).len()
    }

    /// `rpc_receiver_count`, generalized for a `Client`: a hub can answer
    /// from its own tables immediately, but a client has no view of the
    /// mesh's subscriptions and must ask its upstream via
    /// `PROXY_QUERY_COUNT`.
    pub fn query_rpc_receiver_count(&mut self, service: Value, routing_id: u64, method: &str, reply: flume::Sender<usize>) {
        if self.role == Role::Hub {
            let _ = reply.send(self.rpc_receiver_count(&service, routing_id, method));
            return;
        }
        let Some(upstream) = self.upstream() else {
            let _ = reply.send(0);
            return;
        };
        upstream.push(Message::ProxyQueryCount { service, routing_id, method: method.to_string() });
        self.query_count_waiters.push_back(reply);
    }

    fn incoming_proxy_query_count(&mut self, from: &Ident, service: Value, routing_id: u64, method: &str) {
        let has_local = self.find_local(MsgType::RpcRequest, &service, routing_id, method).is_some();
        let total = usize::from(has_local) + self.find_peer_routes(MsgType::RpcRequest, &service, routing_id).len();
        if let Some(peer) = self.peers.get(from) {
            peer.push(Message::ProxyResponse { client_counter: 0, rc: rc::OK, result: Value::from(total as u64) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{DefaultSelectPeer, NoopConnectionLost};
    use std::sync::{Arc, Mutex};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Role::Hub, Ident::new("127.0.0.1", 9000), Arc::new(DefaultSelectPeer), Arc::new(NoopConnectionLost))
    }

    #[test]
    fn chunked_stream_delivers_items_in_order() {
        let mut d = dispatcher();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        d.add_local(
            MsgType::Publish,
            Value::from("s"),
            0,
            0,
            "m",
            LocalHandler::Publish {
                handler: Arc::new(move |args, _kwargs| seen_clone.lock().unwrap().push(args[0].clone())),
                schedule: false,
            },
        )
        .unwrap();

        let from = Ident::new("peer", 1);
        d.incoming(
            &from,
            Message::PublishIsChunked { service: Value::from("s"), routing_id: 0, method: "m".into(), counter: 1, kwargs: Vec::new() },
        );
        d.incoming(&from, Message::PublishChunk { counter: 1, item: Value::from(1) });
        d.incoming(&from, Message::PublishChunk { counter: 1, item: Value::from(2) });
        d.incoming(&from, Message::PublishEnd { counter: 1 });

        let got = seen.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_i64(), Some(1));
        assert_eq!(got[1].as_i64(), Some(2));
    }

    #[test]
    fn dropped_peer_mid_stream_yields_lost_connection_sentinel() {
        let mut d = dispatcher();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        d.add_local(
            MsgType::Publish,
            Value::from("s"),
            0,
            0,
            "m",
            LocalHandler::Publish {
                handler: Arc::new(move |args, _kwargs| seen_clone.lock().unwrap().push(args[0].clone())),
                schedule: false,
            },
        )
        .unwrap();

        let from = Ident::new("peer", 1);
        d.incoming(
            &from,
            Message::PublishIsChunked { service: Value::from("s"), routing_id: 0, method: "m".into(), counter: 7, kwargs: Vec::new() },
        );
        d.incoming(&from, Message::PublishChunk { counter: 7, item: Value::from(1) });
        d.incoming(&from, Message::PublishChunk { counter: 7, item: Value::from(2) });
        // Connection drops before `PublishEnd` arrives.
        d.drop_peer(&from);

        let got = seen.lock().unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_i64(), Some(1));
        assert_eq!(got[1].as_i64(), Some(2));
        assert!(junction_proto::value::is_lost_connection(&got[2]));
    }
}
