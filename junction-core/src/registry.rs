//! In-flight RPC and proxy-RPC bookkeeping.
//!
//! Grounded on `RPCClient`/`ProxiedClient` from the original dispatcher: a
//! monotonic per-originator counter identifies each outstanding RPC, and two
//! reverse indices keep the bookkeeping symmetric — by counter (to resolve an
//! arriving response) and by peer (so a dropped connection can synthesize
//! `LostConnection` for everything it was still owed).

use hashbrown::{HashMap, HashSet};
use std::hash::Hash;

use crate::future::{RpcFuture, WeakRpcFuture};

/// One in-flight RPC this node originated.
struct InFlight<I, V> {
    awaiting: HashSet<I>,
    future: WeakRpcFuture<V>,
}

/// Tracks RPCs this node originated directly (`Hub::rpc`, `Client::rpc`).
pub struct RpcRegistry<I, V> {
    next_counter: u64,
    inflight: HashMap<u64, InFlight<I, V>>,
    by_peer: HashMap<I, HashSet<u64>>,
}

impl<I, V> Default for RpcRegistry<I, V>
where
    I: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            next_counter: 0,
            inflight: HashMap::new(),
            by_peer: HashMap::new(),
        }
    }
}

impl<I, V> RpcRegistry<I, V>
where
    I: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next counter in this node's shared RPC counter space
    /// without recording any awaiting state. Used to hand a proxy-internal
    /// RPC the same counter namespace as directly-originated ones, since a
    /// peer echoes counters back on its one connection regardless of why the
    /// request was sent.
    pub fn allocate_counter(&mut self) -> u64 {
        let counter = self.next_counter;
        self.next_counter += 1;
        counter
    }

    /// Allocate a counter and record the RPC's target set. Returns the
    /// counter and the `RpcFuture` the caller owns.
    pub fn start(&mut self, targets: impl IntoIterator<Item = I>) -> (u64, RpcFuture<V>) {
        let counter = self.allocate_counter();

        let awaiting: HashSet<I> = targets.into_iter().collect();
        let future = RpcFuture::new(counter, awaiting.len());

        for ident in &awaiting {
            self.by_peer
                .entry(ident.clone())
                .or_default()
                .insert(counter);
        }

        self.inflight.insert(
            counter,
            InFlight {
                awaiting,
                future: future.downgrade(),
            },
        );
        (counter, future)
    }

    /// Apply an arriving response from `responder`. Drops silently if the
    /// future was garbage-collected or the counter is unknown.
    pub fn on_response(&mut self, counter: u64, responder: &I, outcome: crate::future::TargetOutcome<V>) {
        let Some(entry) = self.inflight.get_mut(&counter) else {
            return;
        };
        if !entry.awaiting.remove(responder) {
            return;
        }
        if let Some(peer_set) = self.by_peer.get_mut(responder) {
            peer_set.remove(&counter);
        }

        if let Some(future) = entry.future.upgrade() {
            future.push_result(outcome);
        }

        if entry.awaiting.is_empty() {
            self.inflight.remove(&counter);
        }
    }

    /// A peer's connection went down: synthesize `LostConnection` for every
    /// counter still awaiting a response from it.
    pub fn on_peer_lost(&mut self, peer: &I) -> Vec<u64> {
        let Some(counters) = self.by_peer.remove(peer) else {
            return Vec::new();
        };
        let mut affected = Vec::new();
        for counter in counters {
            if let Some(entry) = self.inflight.get_mut(&counter) {
                entry.awaiting.remove(peer);
                if let Some(future) = entry.future.upgrade() {
                    future.push_result(Err(crate::error::JunctionError::LostConnection));
                }
                affected.push(counter);
                if entry.awaiting.is_empty() {
                    self.inflight.remove(&counter);
                }
            }
        }
        affected
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// One proxy-RPC record on a hub acting for a connected client: the hub's
/// own internal counter maps back to the client's counter and connection.
struct ProxyRecord<I> {
    client_counter: u64,
    client_peer: I,
    awaiting: usize,
}

/// Tracks RPCs a hub is carrying out on behalf of a proxying client
/// (`PROXY_REQUEST` → internal `RPC_REQUEST`s → `PROXY_RESPONSE`s).
///
/// The internal counter is allocated by the caller (from the same
/// `RpcRegistry::allocate_counter` space used for directly-originated RPCs)
/// rather than by this registry, since a peer connection echoes counters
/// back on one shared namespace regardless of why the hub sent the request.
pub struct ProxyRegistry<I> {
    records: HashMap<u64, ProxyRecord<I>>,
    by_peer: HashMap<I, HashSet<u64>>,
}

impl<I> Default for ProxyRegistry<I>
where
    I: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            by_peer: HashMap::new(),
        }
    }
}

impl<I> ProxyRegistry<I>
where
    I: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh internal RPC, tagged with a caller-allocated
    /// `internal_counter`, issued to `peer_targets` on behalf of
    /// `client_peer`'s `client_counter`.
    pub fn start(
        &mut self,
        internal_counter: u64,
        client_counter: u64,
        client_peer: I,
        peer_targets: &[I],
    ) {
        for target in peer_targets {
            self.by_peer
                .entry(target.clone())
                .or_default()
                .insert(internal_counter);
        }

        self.records.insert(
            internal_counter,
            ProxyRecord {
                client_counter,
                client_peer,
                awaiting: peer_targets.len(),
            },
        );
    }

    /// An `RPC_RESPONSE` arrived for `internal_counter`. Returns the
    /// `(client_counter, client_peer)` to forward a `PROXY_RESPONSE` to, and
    /// whether this was the last expected response for that proxy record.
    pub fn on_response(&mut self, internal_counter: u64, responder: &I) -> Option<(u64, I, bool)> {
        let record = self.records.get_mut(&internal_counter)?;
        let client_counter = record.client_counter;
        let client_peer = record.client_peer.clone();

        record.awaiting = record.awaiting.saturating_sub(1);
        let last = record.awaiting == 0;

        if let Some(set) = self.by_peer.get_mut(responder) {
            set.remove(&internal_counter);
        }
        if last {
            self.records.remove(&internal_counter);
        }
        Some((client_counter, client_peer, last))
    }

    /// A peer's connection went down: every proxy record still awaiting a
    /// response from it must forward one synthesized `PROXY_RESPONSE` with
    /// `RPC_ERR_LOST_CONN`, and mark one fewer still awaited.
    pub fn on_peer_lost(&mut self, peer: &I) -> Vec<(u64, I, bool)> {
        let Some(counters) = self.by_peer.remove(peer) else {
            return Vec::new();
        };
        let mut forwarded = Vec::new();
        for internal in counters {
            if let Some(record) = self.records.get_mut(&internal) {
                record.awaiting = record.awaiting.saturating_sub(1);
                let last = record.awaiting == 0;
                forwarded.push((record.client_counter, record.client_peer.clone(), last));
                if last {
                    self.records.remove(&internal);
                }
            }
        }
        forwarded
    }
}

/// Client-side accounting for a proxied RPC: tracks expected arrivals as a
/// signed counter, incremented once by `PROXY_RESPONSE_COUNT` and decremented
/// by each `PROXY_RESPONSE`. `expect` must be called exactly once per
/// request before any response is processed — a `PROXY_RESPONSE_COUNT(0)`
/// would otherwise be indistinguishable from "no count received yet".
pub struct ProxiedClientCounter {
    remaining: Option<i64>,
}

impl Default for ProxiedClientCounter {
    fn default() -> Self {
        Self { remaining: None }
    }
}

impl ProxiedClientCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the pre-declared total from `PROXY_RESPONSE_COUNT`. Panics if
    /// called twice for the same request — callers must enforce the
    /// exactly-once precondition before this is reachable from untrusted
    /// wire input (a malformed peer must not be able to double-`expect` and
    /// crash the process; see the dispatcher's validation of this message).
    pub fn expect(&mut self, total: usize) {
        assert!(self.remaining.is_none(), "expect() called twice for one request");
        self.remaining = Some(total as i64);
    }

    /// Returns `true` once the counter has both been told a total and has
    /// reached zero (complete).
    pub fn on_response(&mut self) -> bool {
        match &mut self.remaining {
            Some(n) => {
                *n -= 1;
                *n <= 0
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.remaining, Some(n) if n <= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct V(i32);

    #[test]
    fn rpc_registry_completes_and_cleans_up() {
        let mut reg: RpcRegistry<&str, V> = RpcRegistry::new();
        let (counter, future) = reg.start(["a", "b"]);
        assert_eq!(reg.len(), 1);

        reg.on_response(counter, &"a", Ok(V(1)));
        assert!(!future.is_complete());
        reg.on_response(counter, &"b", Ok(V(2)));
        assert!(future.is_complete());
        assert!(reg.is_empty());
    }

    #[test]
    fn peer_loss_synthesizes_lost_connection() {
        let mut reg: RpcRegistry<&str, V> = RpcRegistry::new();
        let (_, future) = reg.start(["a", "b"]);
        reg.on_peer_lost(&"a");
        assert!(!future.is_complete());
        reg.on_peer_lost(&"b");
        assert!(future.is_complete());
    }

    #[test]
    fn proxy_registry_forwards_last_flag() {
        let mut reg: ProxyRegistry<&str> = ProxyRegistry::new();
        let internal = 42;
        reg.start(internal, 7, "client", &["p1", "p2"]);
        let (cc, cp, last) = reg.on_response(internal, &"p1").unwrap();
        assert_eq!((cc, cp, last), (7, "client", false));
        let (_, _, last2) = reg.on_response(internal, &"p2").unwrap();
        assert!(last2);
    }

    #[test]
    fn proxied_client_counter_zero_completes_immediately() {
        let mut c = ProxiedClientCounter::new();
        c.expect(0);
        assert!(c.is_complete());
    }

    #[test]
    #[should_panic]
    fn expect_twice_panics() {
        let mut c = ProxiedClientCounter::new();
        c.expect(1);
        c.expect(1);
    }
}
