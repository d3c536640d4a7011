//! An in-process overlay network.
//!
//! The overlay is a switchboard that every started node registers with.
//! Connections, relay reservations and protocol streams are all plain tokio
//! channels, so whole sessions can run inside a single test.
//!
//! Two kinds of node exist. Relays listen on a memory address and can be
//! dialed directly. Browser nodes have no listen address of their own; once
//! they connect to a relay they hold a reservation there, and after the
//! overlay's publish delay they advertise a circuit address through that relay
//! (see [`address::circuit_address`]). Dialing a circuit address ending in
//! `webrtc` yields a direct connection; without `webrtc` the connection stays
//! relayed and only transient streams may use it.

use crate::{
    address::{self, Circuit},
    logging,
    network::{
        Connection, DialError, DialOptions, InboundHandler, InboundStream, Network, NetworkError,
        NetworkEvent, NetworkFactory, RawStream, SharedNetwork, StreamError,
    },
    FxDashMap,
};
use libp2p_identity::{Keypair, PeerId};
use multiaddr::Multiaddr;
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// The role a node plays on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A peer without a listen address of its own.
    Browser,
    /// A publicly reachable peer that other peers reserve circuits on.
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Idle,
    Running,
    Stopped,
}

/// One side of a connection. Both sides share the same reset token.
#[derive(Debug, Clone)]
struct Link {
    relayed: bool,
    reset: CancellationToken,
}

#[derive(Default)]
struct Switchboard {
    peers: FxDashMap<PeerId, Arc<NodeInner>>,
    ports: FxDashMap<u64, PeerId>,
    next_port: AtomicU64,
    /// How long a relay takes to publish a reserved circuit address.
    publish_delay: Duration,
    /// Serializes link changes so both sides always agree.
    links: Mutex<()>,
}

/// A simulated overlay network that nodes are created on.
///
/// # Example
///
/// ```
/// # use peerlink_core::{networks::Overlay, Network};
/// # #[tokio::main]
/// # async fn main() {
/// let overlay = Overlay::new();
/// let relay = overlay.relay();
/// relay.start().await.unwrap();
///
/// let node = overlay.node();
/// node.start().await.unwrap();
/// node.dial(&relay.memory_address()).await.unwrap();
/// assert_eq!(node.connected_peers(), vec![relay.peer_id()]);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Overlay {
    board: Arc<Switchboard>,
}

impl Overlay {
    /// Creates an overlay where relays publish circuit addresses right away.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an overlay where relays take `delay` to publish circuit
    /// addresses after a reservation.
    pub fn with_publish_delay(delay: Duration) -> Self {
        Self {
            board: Arc::new(Switchboard {
                publish_delay: delay,
                ..Default::default()
            }),
        }
    }

    /// Creates a browser node. It joins the overlay when started.
    pub fn node(&self) -> Arc<OverlayNode> {
        Arc::new(OverlayNode::new(NodeKind::Browser, self.board.clone()))
    }

    /// Creates a relay node. It joins the overlay when started.
    pub fn relay(&self) -> Arc<OverlayNode> {
        Arc::new(OverlayNode::new(NodeKind::Relay, self.board.clone()))
    }

    /// A factory that creates a new browser node each time it is called.
    pub fn factory(&self) -> Arc<dyn NetworkFactory> {
        let overlay = self.clone();
        Arc::new(move || overlay.node() as SharedNetwork)
    }

    /// The peers of every node currently running on the overlay.
    pub fn running_peers(&self) -> Vec<PeerId> {
        self.board.peers.iter().map(|entry| *entry.key()).collect()
    }
}

/// A node on an [`Overlay`].
pub struct OverlayNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    peer_id: PeerId,
    kind: NodeKind,
    port: u64,
    state: RwLock<NodeState>,
    events: broadcast::Sender<NetworkEvent>,
    handlers: FxDashMap<String, InboundHandler>,
    connections: FxDashMap<PeerId, Link>,
    listen: RwLock<Vec<Multiaddr>>,
    board: Arc<Switchboard>,
}

impl OverlayNode {
    fn new(kind: NodeKind, board: Arc<Switchboard>) -> Self {
        let peer_id = Keypair::generate_ed25519().public().to_peer_id();
        let port = board.next_port.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(NodeInner {
                peer_id,
                kind,
                port,
                state: RwLock::new(NodeState::Idle),
                events,
                handlers: Default::default(),
                connections: Default::default(),
                listen: Default::default(),
                board,
            }),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.inner.kind
    }

    /// The memory address of this node. Only relays can be dialed on it.
    pub fn memory_address(&self) -> Multiaddr {
        self.inner.local_address()
    }
}

impl NodeInner {
    fn is_running(&self) -> bool {
        *self.state.read() == NodeState::Running
    }

    fn local_address(&self) -> Multiaddr {
        address::memory_address(self.port, self.peer_id)
    }

    fn emit(&self, event: NetworkEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn is_relayed(&self, peer: PeerId) -> bool {
        self.connections
            .get(&peer)
            .map_or(false, |link| link.relayed)
    }

    /// Drops every circuit address this node advertises through `relay`.
    fn forget_relay(&self, relay: PeerId) {
        self.listen.write().retain(|address| {
            address::split_circuit(address).map_or(true, |circuit| circuit.relay_peer != relay)
        });
    }

    fn dial(self: &Arc<Self>, address: &Multiaddr) -> Result<Connection, DialError> {
        if !self.is_running() {
            return Err(DialError::NotRunning);
        }
        if let Some(circuit) = address::split_circuit(address) {
            return self.dial_circuit(address, circuit);
        }

        let remote = match address::memory_port(address) {
            Some(port) => self.board.by_port(port),
            // A bare `/p2p/<peer>` address reuses an existing connection.
            None => address::peer_id_of(address)
                .filter(|peer| self.connections.contains_key(peer))
                .and_then(|peer| self.board.lookup(&peer)),
        }
        .filter(|node| node.is_running())
        .ok_or_else(|| DialError::Unreachable(address.clone()))?;

        if let Some(expected) = address::peer_id_of(address) {
            if expected != remote.peer_id {
                return Err(DialError::MissingPeer(address.clone()));
            }
        }
        if remote.peer_id == self.peer_id {
            return Err(DialError::SelfDial);
        }

        self.connect_to(&remote, false);
        Ok(Connection {
            remote_peer: remote.peer_id,
            remote_addr: address.clone(),
            relayed: self.is_relayed(remote.peer_id),
        })
    }

    fn dial_circuit(
        self: &Arc<Self>,
        address: &Multiaddr,
        circuit: Circuit,
    ) -> Result<Connection, DialError> {
        let target_peer = circuit
            .target
            .ok_or_else(|| DialError::MissingPeer(address.clone()))?;
        if target_peer == self.peer_id {
            return Err(DialError::SelfDial);
        }
        let relay = self
            .board
            .lookup(&circuit.relay_peer)
            .filter(|node| node.is_running() && node.kind == NodeKind::Relay)
            .ok_or_else(|| DialError::Unreachable(address.clone()))?;
        // The target is only reachable while it holds its reservation.
        let target = self
            .board
            .lookup(&target_peer)
            .filter(|node| node.is_running() && node.connections.contains_key(&relay.peer_id))
            .ok_or_else(|| DialError::Unreachable(address.clone()))?;

        if relay.peer_id != self.peer_id {
            self.connect_to(&relay, false);
        }
        self.connect_to(&target, !circuit.direct);
        Ok(Connection {
            remote_peer: target_peer,
            remote_addr: address.clone(),
            relayed: self.is_relayed(target_peer),
        })
    }

    fn connect_to(self: &Arc<Self>, remote: &Arc<NodeInner>, relayed: bool) {
        let created = self.board.link(self, remote, relayed);
        if created && self.kind == NodeKind::Browser && remote.kind == NodeKind::Relay {
            self.reserve(remote);
        }
    }

    /// Publishes this node's circuit address through `relay` once the
    /// overlay's publish delay has passed.
    fn reserve(self: &Arc<Self>, relay: &Arc<NodeInner>) {
        let circuit = address::circuit_address(&relay.local_address(), self.peer_id);
        let relay_peer = relay.peer_id;
        let delay = self.board.publish_delay;
        let node = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Checked under the lock so a concurrent `forget_relay` cannot be
            // overtaken
            let mut listen = node.listen.write();
            if !node.is_running() || !node.connections.contains_key(&relay_peer) {
                return;
            }
            if !listen.contains(&circuit) {
                listen.push(circuit.clone());
                drop(listen);
                logging::address_event(node.peer_id, &circuit);
            }
        });
    }
}

impl Switchboard {
    fn lookup(&self, peer: &PeerId) -> Option<Arc<NodeInner>> {
        self.peers.get(peer).map(|node| node.clone())
    }

    fn by_port(&self, port: u64) -> Option<Arc<NodeInner>> {
        let peer = *self.ports.get(&port)?;
        self.lookup(&peer)
    }

    fn register(&self, node: &Arc<NodeInner>) {
        self.peers.insert(node.peer_id, node.clone());
        if node.kind == NodeKind::Relay {
            self.ports.insert(node.port, node.peer_id);
        }
    }

    fn unregister(&self, node: &NodeInner) {
        self.peers.remove(&node.peer_id);
        self.ports.remove(&node.port);
    }

    /// Connects `a` and `b`. Returns whether a new connection was made; an
    /// existing relayed connection is upgraded in place when a direct one is
    /// requested.
    fn link(&self, a: &NodeInner, b: &NodeInner, relayed: bool) -> bool {
        let _guard = self.links.lock();
        if let Some(mut existing) = a.connections.get_mut(&b.peer_id) {
            if existing.relayed && !relayed {
                existing.relayed = false;
                drop(existing);
                if let Some(mut other) = b.connections.get_mut(&a.peer_id) {
                    other.relayed = false;
                }
                tracing::debug!("Upgraded connection {} <-> {}", a.peer_id, b.peer_id);
            }
            return false;
        }

        let link = Link {
            relayed,
            reset: CancellationToken::new(),
        };
        a.connections.insert(b.peer_id, link.clone());
        b.connections.insert(a.peer_id, link);
        a.emit(NetworkEvent::PeerConnected(b.peer_id));
        b.emit(NetworkEvent::PeerConnected(a.peer_id));
        logging::peer_event(a.peer_id, b.peer_id, true);
        true
    }

    /// Disconnects `a` from `peer`. Returns whether there was a connection.
    fn unlink(&self, a: &NodeInner, peer: PeerId) -> bool {
        let _guard = self.links.lock();
        let Some((_, link)) = a.connections.remove(&peer) else {
            return false;
        };
        link.reset.cancel();
        a.emit(NetworkEvent::PeerDisconnected(peer));
        a.forget_relay(peer);

        if let Some(b) = self.lookup(&peer) {
            if b.connections.remove(&a.peer_id).is_some() {
                b.emit(NetworkEvent::PeerDisconnected(a.peer_id));
                b.forget_relay(a.peer_id);
            }
        }
        logging::peer_event(a.peer_id, peer, false);
        true
    }
}

/// Moves chunks of one stream from the dialer to the handler.
///
/// The stream stays open until the dialer closes it or the connection resets,
/// whether or not the handler still reads. Chunks nobody reads are dropped.
async fn carry(
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    reset: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = reset.cancelled() => None,
            chunk = outbound.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let _ = inbound.send(chunk);
    }
}

#[async_trait::async_trait]
impl Network for OverlayNode {
    fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen.read().clone()
    }

    async fn start(&self) -> Result<(), NetworkError> {
        {
            let mut state = self.inner.state.write();
            match *state {
                NodeState::Running => return Ok(()),
                NodeState::Stopped => return Err(NetworkError::Stopped),
                NodeState::Idle => *state = NodeState::Running,
            }
        }
        self.inner.board.register(&self.inner);
        if self.inner.kind == NodeKind::Relay {
            self.inner.listen.write().push(self.inner.local_address());
        }
        tracing::info!("{:?} {} started", self.inner.kind, self.inner.peer_id);
        Ok(())
    }

    async fn stop(&self) {
        {
            let mut state = self.inner.state.write();
            let was_running = *state == NodeState::Running;
            *state = NodeState::Stopped;
            if !was_running {
                return;
            }
        }
        let peers: Vec<PeerId> = self.connected_peers();
        for peer in peers {
            self.inner.board.unlink(&self.inner, peer);
        }
        self.inner.board.unregister(&self.inner);
        self.inner.handlers.clear();
        self.inner.listen.write().clear();
        tracing::info!("{:?} {} stopped", self.inner.kind, self.inner.peer_id);
    }

    async fn dial(&self, address: &Multiaddr) -> Result<Connection, DialError> {
        self.inner.dial(address)
    }

    async fn dial_protocol(
        &self,
        address: &Multiaddr,
        protocol: &str,
        options: DialOptions,
    ) -> Result<RawStream, StreamError> {
        let connection = self.inner.dial(address)?;
        let remote_peer = connection.remote_peer;
        if connection.relayed && !options.run_on_transient_connection {
            return Err(StreamError::TransientNotAllowed(remote_peer));
        }

        let remote = self
            .inner
            .board
            .lookup(&remote_peer)
            .ok_or_else(|| DialError::Unreachable(address.clone()))?;
        let handler = remote
            .handlers
            .get(protocol)
            .map(|handler| handler.clone())
            .ok_or_else(|| StreamError::ProtocolMismatch(protocol.to_string()))?;
        let reset = self
            .inner
            .connections
            .get(&remote_peer)
            .map(|link| link.reset.child_token())
            .ok_or(StreamError::Closed)?;

        let (sink, outbound) = mpsc::unbounded_channel();
        let (inbound, source) = mpsc::unbounded_channel();
        tokio::spawn(carry(outbound, inbound, reset.clone()));
        handler(InboundStream {
            remote_peer: self.inner.peer_id,
            protocol: protocol.to_string(),
            source,
            reset: reset.clone(),
        });
        Ok(RawStream {
            remote_peer,
            protocol: protocol.to_string(),
            sink,
            reset,
        })
    }

    fn handle(&self, protocol: &str, handler: InboundHandler) {
        self.inner.handlers.insert(protocol.to_string(), handler);
    }

    fn unhandle(&self, protocol: &str) {
        self.inner.handlers.remove(protocol);
    }

    async fn hang_up(&self, peer: PeerId) -> Result<(), DialError> {
        if !self.inner.is_running() {
            return Err(DialError::NotRunning);
        }
        self.inner.board.unlink(&self.inner, peer);
        Ok(())
    }
}
