//! Caller-supplied hooks: `select_peer` and `connection_lost`.
//!
//! Stored as trait objects on the dispatcher, looked up per call — matching
//! the teacher's pattern of keeping a monitor/event-sender handle on a socket
//! struct (`DealerSocket::monitor`) rather than hard-wiring one behavior.

use junction_core::ident::Ident;
use junction_proto::value::Value;

/// One routing target as seen by a hook: either a connected peer, or this
/// node's own local handler (the `None` ident in the original Python).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Candidate {
    Local,
    Peer(Ident),
}

/// Reduces a multi-target send down to one, for `singular` publish/RPC.
pub trait SelectPeer: Send + Sync {
    fn select(&self, candidates: &[Candidate], service: &Value, routing_id: u64, method: &str) -> Candidate;
}

/// Notified when a peer connection goes down, with the subscriptions it had
/// contributed to the peer table.
pub trait ConnectionLost: Send + Sync {
    fn lost(&self, peer: &Ident, subscriptions: &[(u8, Value, u64, u64)]);
}

/// Deterministic default: picks the minimum candidate, `Local` sorting before
/// any `Peer(ident)` (mirrors picking `None` first in the Python tuple sort,
/// since `None < any ident` there is undefined — here we make `Local` the
/// first citizen explicitly).
pub struct DefaultSelectPeer;

impl SelectPeer for DefaultSelectPeer {
    fn select(&self, candidates: &[Candidate], _service: &Value, _routing_id: u64, _method: &str) -> Candidate {
        candidates
            .iter()
            .min_by(|a, b| match (a, b) {
                (Candidate::Local, Candidate::Local) => std::cmp::Ordering::Equal,
                (Candidate::Local, Candidate::Peer(_)) => std::cmp::Ordering::Less,
                (Candidate::Peer(_), Candidate::Local) => std::cmp::Ordering::Greater,
                (Candidate::Peer(a), Candidate::Peer(b)) => a.cmp(b),
            })
            .cloned()
            .expect("select_peer called with an empty candidate set")
    }
}

pub struct NoopConnectionLost;

impl ConnectionLost for NoopConnectionLost {
    fn lost(&self, _peer: &Ident, _subscriptions: &[(u8, Value, u64, u64)]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_select_peer_prefers_local() {
        let hook = DefaultSelectPeer;
        let candidates = vec![Candidate::Peer(Ident::new("a", 1)), Candidate::Local];
        assert_eq!(
            hook.select(&candidates, &Value::from("s"), 0, "m"),
            Candidate::Local
        );
    }

    #[test]
    fn default_select_peer_picks_lexicographic_minimum_among_peers() {
        let hook = DefaultSelectPeer;
        let a = Ident::new("10.0.0.1", 9000);
        let b = Ident::new("10.0.0.2", 9000);
        let candidates = vec![Candidate::Peer(b.clone()), Candidate::Peer(a.clone())];
        assert_eq!(
            hook.select(&candidates, &Value::from("s"), 0, "m"),
            Candidate::Peer(a)
        );
    }
}
