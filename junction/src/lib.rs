//! # Junction
//!
//! A peer-to-peer messaging fabric providing fire-and-forget publish and
//! request/response RPC, routed by a `(service, routing-id, method)`
//! predicate rather than a fixed topology.
//!
//! ## Architecture
//!
//! - **`junction-core`**: subscription tables, RPC/proxy bookkeeping, idents,
//!   reconnect backoff — transport- and serialization-agnostic.
//! - **`junction-proto`**: the wire codec (length-prefixed MessagePack frames)
//!   and the ten message types.
//! - **`junction`**: this crate. The `Hub`/`Client` public API, the peer
//!   connection actor, and the dispatcher that ties them together.
//!
//! ## Roles
//!
//! A [`Hub`](hub::Hub) listens for and dials other hubs, forming a
//! fully-connected mesh; every hub sees every other hub's subscriptions. A
//! [`Client`](client::Client) holds a single upstream connection and proxies
//! all publish/RPC traffic through it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use junction::hub::Hub;
//!
//! let hub = Hub::bind("127.0.0.1:9000").await?;
//! hub.accept_publish(junction::Value::from("ticks"), 0, 0, "price", |_args, _kwargs| {}).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(missing_docs)]

/// This crate's version, mirroring `junction.__version__` from the original
/// distribution.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns [`VERSION`].
pub fn version() -> &'static str {
    VERSION
}

pub use bytes::Bytes;
pub use junction_core::error::JunctionError;
pub use junction_core::ident::Ident;
pub use junction_core::options::ConnectionOptions;
pub use junction_core::reconnect::{ReconnectError, ReconnectState};
pub use junction_proto::value::{is_lost_connection, lost_connection, Value};

/// Caller-supplied hooks: `select_peer` and `connection_lost`.
pub mod hooks;

/// Peer connection actor: handshake, split read/write pump, reconnect.
pub mod peer;

/// The message-type state machine shared by `Hub` and `Client`.
pub mod dispatcher;

/// The full-mesh node: listens, dials, and routes for every connected peer.
pub mod hub;

/// The single-upstream node: proxies all publish/RPC traffic through a hub.
pub mod client;

/// Development helpers (benches/tests).
pub mod dev_tracing;
