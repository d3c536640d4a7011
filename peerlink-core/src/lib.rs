//! Peerlink, a peer session controller for overlay networks.
//!
//! A session establishes a peer identity on an overlay network, discovers a
//! publicly dialable address for itself through a relay, tracks the peers it
//! is directly connected to, and exchanges byte streams with remote peers over
//! a named application protocol. A replicated append-only log can be layered
//! on top of the same connection.
//!
//! # Organization
//! - [`Network`] is the contract of the underlying peer-network handle, and
//!   [`networks::Overlay`] is an in-process overlay that implements it
//! - [`PeerMembership`] records which peers are connected
//! - [`AddressResolver`] finds a relay-circuit address for the local peer
//! - [`StreamChannel`] registers inbound handlers and drives outbound streams
//! - [`SessionController`] ties the pieces together around one network handle
//! - [`log_store`] holds the replicated log contract and an in-memory store
//!
//! # Session structure
//!
//! A [`SessionController`] owns at most one live session at a time. Starting
//! it builds a fresh network handle from a [`NetworkFactory`], subscribes the
//! membership tracker to the handle's connect and disconnect events, and hands
//! out a [`PeerId`]. Every other operation borrows the live handle. Stopping
//! the session ends all in-flight work and the handle is never reused; a
//! restart always builds a new one.

use std::hash::BuildHasherDefault;

pub mod address;
pub mod log_store;
pub mod logging;

pub mod network;
pub use network::{Network, NetworkFactory, SharedNetwork};

pub mod networks;

pub mod membership;
pub use membership::PeerMembership;

pub mod resolver;
pub use resolver::AddressResolver;

pub mod stream;
pub use stream::StreamChannel;

pub mod session;
pub use session::SessionController;

pub mod shutdown;
pub use shutdown::Shutdown;

pub use libp2p_identity::PeerId;
pub use multiaddr::Multiaddr;

pub(crate) type FxDashMap<K, V> =
    dashmap::DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
