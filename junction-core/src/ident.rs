//! Peer identifiers.
//!
//! An `Ident` is the stable `(host, port, version, reserved)` tuple exchanged
//! during handshake. Connections are indexed by `Ident`, never by socket
//! address, so a peer can be recognized across reconnects.

use std::cmp::Ordering;
use std::fmt;

/// Protocol version carried in the handshake. A mismatch is `BadHandshake`.
pub const PROTOCOL_VERSION: u16 = 1;

/// A peer's stable identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident {
    pub host: String,
    pub port: u16,
    pub version: u16,
    pub reserved: u32,
}

impl Ident {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            version: PROTOCOL_VERSION,
            reserved: 0,
        }
    }

    /// Deterministic winner when two connections to the same remote peer
    /// exist at once (both sides dialed each other concurrently). Compares
    /// this node's own ident against the remote's: every node sees the same
    /// two idents in the pair, one as `own` and one as `remote`, and the
    /// comparison flips consistently between the two sides, so both always
    /// agree on which single physical connection survives — the one
    /// initiated by whichever ident sorts lower.
    pub fn resolve_duplicate(own: &Ident, remote: &Ident) -> DuplicateOutcome {
        match own.cmp(remote) {
            Ordering::Less => DuplicateOutcome::KeepLocallyInitiated,
            Ordering::Greater => DuplicateOutcome::KeepRemotelyInitiated,
            Ordering::Equal => unreachable!("a node cannot have a duplicate connection to itself"),
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Which connection of a duplicate pair survives, from one node's point of
/// view: the one it dialed itself, or the one it accepted from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOutcome {
    KeepLocallyInitiated,
    KeepRemotelyInitiated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_resolution_agrees_from_both_sides() {
        let a = Ident::new("10.0.0.1", 9000);
        let b = Ident::new("10.0.0.2", 9000);
        // From a's perspective (own=a, remote=b): a < b, keep what a dialed.
        assert_eq!(Ident::resolve_duplicate(&a, &b), DuplicateOutcome::KeepLocallyInitiated);
        // From b's perspective (own=b, remote=a): b > a, keep what a dialed
        // too — the connection b *accepted* from a, not the one b dialed.
        assert_eq!(Ident::resolve_duplicate(&b, &a), DuplicateOutcome::KeepRemotelyInitiated);
    }

    #[test]
    fn display_is_host_port() {
        assert_eq!(Ident::new("h", 1).to_string(), "h:1");
    }
}
