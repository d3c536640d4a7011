//! Helpers for the [`Multiaddr`] shapes used by sessions.
//!
//! Addresses follow the usual self-describing `/proto/value/...` form. A relay
//! is reached at something like `/memory/7/p2p/<relay>`, and once the relay
//! holds a reservation for a peer that peer becomes reachable at
//!
//! ```text
//! /memory/7/p2p/<relay>/p2p-circuit/webrtc/p2p/<peer>
//! ```
//!
//! which is the relay-circuit-capable shape that address discovery looks for.

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};

/// Whether `address` can be dialed by other peers through a relay circuit.
///
/// The address must name the relay with a `p2p` component, then carry
/// `p2p-circuit` followed by `webrtc`, optionally ending with the peer's own
/// `p2p` component. A bare circuit address without `webrtc` does not count.
pub fn is_circuit_dialable(address: &Multiaddr) -> bool {
    let protocols: Vec<Protocol<'_>> = address.iter().collect();
    let Some(circuit) = protocols
        .iter()
        .position(|p| matches!(p, Protocol::P2pCircuit))
    else {
        return false;
    };
    let names_relay = protocols[..circuit]
        .iter()
        .any(|p| matches!(p, Protocol::P2p(_)));
    let tail_matches = matches!(
        &protocols[circuit + 1..],
        [Protocol::WebRTC] | [Protocol::WebRTC, Protocol::P2p(_)]
    );
    names_relay && tail_matches
}

/// The peer named by the last `p2p` component of `address`, if any.
pub fn peer_id_of(address: &Multiaddr) -> Option<PeerId> {
    address
        .iter()
        .filter_map(|p| match p {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        })
        .last()
}

/// The address of a plain in-process listener.
pub fn memory_address(port: u64, peer: PeerId) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::Memory(port))
        .with(Protocol::P2p(peer))
}

/// An address naming a peer without any transport, only usable when a
/// connection to that peer already exists.
pub fn peer_address(peer: PeerId) -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2p(peer))
}

/// Builds the address at which `local` can be reached through `relay`.
///
/// `relay` must already end in the relay's `p2p` component.
pub fn circuit_address(relay: &Multiaddr, local: PeerId) -> Multiaddr {
    relay
        .clone()
        .with(Protocol::P2pCircuit)
        .with(Protocol::WebRTC)
        .with(Protocol::P2p(local))
}

/// A relay circuit address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    /// The address of the relay, ending with the relay's `p2p` component.
    pub relay: Multiaddr,
    /// The relay's peer ID.
    pub relay_peer: PeerId,
    /// The peer on the far side of the circuit.
    pub target: Option<PeerId>,
    /// Whether the circuit upgrades to a direct connection (`webrtc`) instead
    /// of staying relayed.
    pub direct: bool,
}

/// Splits `address` at its `p2p-circuit` component. Returns `None` for
/// addresses that are not relay circuits or do not name their relay.
pub fn split_circuit(address: &Multiaddr) -> Option<Circuit> {
    let mut relay = Multiaddr::empty();
    let mut protocols = address.iter();
    while let Some(protocol) = protocols.next() {
        if matches!(protocol, Protocol::P2pCircuit) {
            let relay_peer = peer_id_of(&relay)?;
            let mut direct = false;
            let mut target = None;
            for protocol in protocols.by_ref() {
                match protocol {
                    Protocol::WebRTC => direct = true,
                    Protocol::P2p(peer) => target = Some(peer),
                    _ => return None,
                }
            }
            return Some(Circuit {
                relay,
                relay_peer,
                target,
                direct,
            });
        }
        relay.push(protocol);
    }
    None
}

/// The memory port of `address`, if it has one.
pub fn memory_port(address: &Multiaddr) -> Option<u64> {
    address.iter().find_map(|p| match p {
        Protocol::Memory(port) => Some(port),
        _ => None,
    })
}
