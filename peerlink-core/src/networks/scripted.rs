//! A network whose address list follows a script, for exercising discovery.

use crate::{
    address,
    network::{
        Connection, DialError, DialOptions, InboundHandler, Network, NetworkError, NetworkEvent,
        RawStream, StreamError,
    },
};
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

pub(crate) struct ScriptedNetwork {
    peer_id: PeerId,
    events: broadcast::Sender<NetworkEvent>,
    relay_reachable: bool,
    /// The poll (counting from one) on which the circuit address shows up.
    publish_on_poll: Option<usize>,
    circuit: Multiaddr,
    dials: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedNetwork {
    pub(crate) fn new(relay_reachable: bool, publish_on_poll: Option<usize>) -> Self {
        let peer_id = PeerId::random();
        Self {
            peer_id,
            circuit: address::circuit_address(&Self::relay(), peer_id),
            events: broadcast::channel(16).0,
            relay_reachable,
            publish_on_poll,
            dials: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn relay() -> Multiaddr {
        address::memory_address(1, PeerId::random())
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub(crate) fn circuit(&self) -> Multiaddr {
        self.circuit.clone()
    }
}

#[async_trait::async_trait]
impl Network for ScriptedNetwork {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        vec![]
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        // Something that never matches is always listed
        let mut addresses = vec![address::memory_address(2, self.peer_id)];
        if self.publish_on_poll.map_or(false, |publish| poll >= publish) {
            addresses.push(self.circuit());
        }
        addresses
    }

    async fn start(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn dial(&self, address: &Multiaddr) -> Result<Connection, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.relay_reachable {
            return Err(DialError::Unreachable(address.clone()));
        }
        Ok(Connection {
            remote_peer: address::peer_id_of(address).unwrap_or_else(PeerId::random),
            remote_addr: address.clone(),
            relayed: false,
        })
    }

    async fn dial_protocol(
        &self,
        _address: &Multiaddr,
        protocol: &str,
        _options: DialOptions,
    ) -> Result<RawStream, StreamError> {
        Err(StreamError::ProtocolMismatch(protocol.to_string()))
    }

    fn handle(&self, _protocol: &str, _handler: InboundHandler) {}

    fn unhandle(&self, _protocol: &str) {}

    async fn hang_up(&self, _peer: PeerId) -> Result<(), DialError> {
        Ok(())
    }
}
