//! Structured logging helpers.
//!
//! Each function emits one kind of event under its own target so a subscriber
//! can filter them (see the `peerlink` binary, which writes them out as JSON).
//! These are meant to be called from inside the core whenever a peer, stream,
//! or address changes.

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tracing::{event, Level};

/// Logs a connection or disconnection between two peers.
pub fn peer_event(local: PeerId, remote: PeerId, connected: bool) {
    event!(
        target: "PEER",
        Level::INFO,
        local = %local,
        remote = %remote,
        connected,
    );
}

/// Logs a stream being opened, received, or closed.
pub fn stream_event(local: PeerId, remote: PeerId, protocol: &str, action: &str) {
    event!(
        target: "STREAM",
        Level::INFO,
        local = %local,
        remote = %remote,
        protocol,
        action,
    );
}

/// Logs an address being published for the local peer.
pub fn address_event(local: PeerId, address: &Multiaddr) {
    event!(
        target: "ADDRESS",
        Level::INFO,
        local = %local,
        address = %address,
    );
}
