//! Contains the [`Network`] trait and supporting types.
//!
//! A network handle is the underlying peer-to-peer stack of a session: it owns
//! the local identity, keeps connections to other peers, and carries protocol
//! streams between them. Sessions only ever talk to it through this trait.

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// A shared handle to a [`Network`].
pub type SharedNetwork = Arc<dyn Network>;

/// Called once for every inbound stream opened on a registered protocol.
pub type InboundHandler = Arc<dyn Fn(InboundStream) + Send + Sync + 'static>;

/// A change in the set of peers the local peer is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// An established connection to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub remote_peer: PeerId,
    /// The address that was dialed to reach the peer.
    pub remote_addr: Multiaddr,
    /// Whether traffic is still carried by a relay rather than a direct
    /// connection.
    pub relayed: bool,
}

/// Options for [`Network::dial_protocol`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Allows the stream to run on a connection that is still relayed.
    pub run_on_transient_connection: bool,
}

/// The sending half of a protocol stream.
///
/// The stream stays open until the sender drops its sink or the connection
/// resets. A remote handler that stops reading does not close it; its chunks
/// are discarded.
#[derive(Debug)]
pub struct RawStream {
    pub remote_peer: PeerId,
    pub protocol: String,
    /// Chunks pushed here arrive at the remote peer in order.
    pub sink: mpsc::UnboundedSender<Vec<u8>>,
    /// Cancelled by the network when the underlying connection goes away.
    pub reset: CancellationToken,
}

/// The receiving half of a protocol stream, handed to an [`InboundHandler`].
#[derive(Debug)]
pub struct InboundStream {
    pub remote_peer: PeerId,
    pub protocol: String,
    pub source: mpsc::UnboundedReceiver<Vec<u8>>,
    pub reset: CancellationToken,
}

/// The underlying peer-network handle of a session.
///
/// A handle is started once and stopped once. A stopped handle is never
/// started again; sessions build a new one through a [`NetworkFactory`].
#[async_trait::async_trait]
pub trait Network: Send + Sync + 'static {
    /// The stable identity of the local peer.
    fn peer_id(&self) -> PeerId;

    /// Subscribes to connect and disconnect events. Subscribe before
    /// [`start`](Network::start) to observe every event.
    fn events(&self) -> broadcast::Receiver<NetworkEvent>;

    /// The peers currently connected, as the network sees them.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// The addresses at which other peers may currently reach this one.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Begins participating in the network.
    async fn start(&self) -> Result<(), NetworkError>;

    /// Closes every connection and stops the handle for good.
    async fn stop(&self);

    /// Opens a connection to the peer at `address`, reusing an existing one if
    /// possible.
    async fn dial(&self, address: &Multiaddr) -> Result<Connection, DialError>;

    /// Dials `address` and opens a stream for `protocol` on the connection.
    async fn dial_protocol(
        &self,
        address: &Multiaddr,
        protocol: &str,
        options: DialOptions,
    ) -> Result<RawStream, StreamError>;

    /// Registers `handler` for inbound streams on `protocol`, replacing any
    /// handler already registered for that name.
    fn handle(&self, protocol: &str, handler: InboundHandler);

    /// Removes the handler for `protocol`, if there is one.
    fn unhandle(&self, protocol: &str);

    /// Closes the connection to `peer`. Succeeds if there was none.
    async fn hang_up(&self, peer: PeerId) -> Result<(), DialError>;
}

/// Builds fresh network handles for a session.
pub trait NetworkFactory: Send + Sync + 'static {
    fn create(&self) -> SharedNetwork;
}

impl<F> NetworkFactory for F
where
    F: Fn() -> SharedNetwork + Send + Sync + 'static,
{
    fn create(&self) -> SharedNetwork {
        self()
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("The network handle was stopped and cannot be started again")]
    Stopped,
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("No peer could be reached at {0}")]
    Unreachable(Multiaddr),
    #[error("The address {0} does not name a reachable peer")]
    MissingPeer(Multiaddr),
    #[error("A peer cannot dial itself")]
    SelfDial,
    #[error("The network handle is not running")]
    NotRunning,
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Failed to dial the remote peer: {0}")]
    Dial(#[from] DialError),
    #[error("The remote peer does not support protocol {0}")]
    ProtocolMismatch(String),
    #[error("The connection to {0} is relayed and the stream may not run on transient connections")]
    TransientNotAllowed(PeerId),
    #[error("The stream is closed")]
    Closed,
}
