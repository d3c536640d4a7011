//! The [`SessionController`] and supporting types.

use crate::{
    membership::MembershipChange,
    network::{DialError, NetworkError, NetworkFactory, SharedNetwork},
    resolver::{ResolveError, ResolverConfig, NO_ADDRESS_SENTINEL},
    shutdown::StopReason,
    stream::{ByteSource, StreamError, StreamHandle, DEFAULT_PROTOCOL},
    AddressResolver, PeerMembership, Shutdown, StreamChannel,
};
use futures::Stream;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error as ThisError;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};

/// Where a [`SessionController`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Started,
    Stopped,
}

/// Settings shared by every session a controller runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// The application protocol used by [`SessionController::open_stream`].
    pub protocol: String,
    /// Bounds for [`SessionController::discover`].
    pub resolver: ResolverConfig,
    /// Whether streams opened with [`SessionController::open_stream`] may run
    /// on relayed connections.
    pub transient: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            resolver: Default::default(),
            transient: true,
        }
    }
}

/// Everything that belongs to the running session.
struct Live {
    network: SharedNetwork,
    channel: Arc<StreamChannel>,
    shutdown: Shutdown,
    watcher: JoinHandle<()>,
}

/// Runs one peer session at a time on top of a [`NetworkFactory`].
///
/// The controller owns the session; there is no global state. Starting it
/// builds a network handle, wires the [`PeerMembership`] to the handle's
/// events and returns the local [`PeerId`]. Every other operation runs against
/// the live handle and fails with [`SessionError::NotStarted`] when there is
/// none.
///
/// A stopped handle is never reused. [`shutdown_and_restart`] tears the
/// session down and builds a new one, which invalidates every
/// [`StreamHandle`] given out before.
///
/// [`shutdown_and_restart`]: SessionController::shutdown_and_restart
pub struct SessionController {
    factory: Arc<dyn NetworkFactory>,
    config: SessionConfig,
    membership: Arc<PeerMembership>,
    /// Serializes start, stop and restart.
    lifecycle: Mutex<SessionState>,
    live: RwLock<Option<Live>>,
    generation: AtomicU64,
}

impl SessionController {
    pub fn new(factory: Arc<dyn NetworkFactory>, config: SessionConfig) -> Self {
        Self {
            factory,
            config,
            membership: PeerMembership::new().shared(),
            lifecycle: Mutex::new(SessionState::NotStarted),
            live: Default::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a new shared handle to a controller.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts the first session and returns the local peer.
    ///
    /// A running controller answers [`SessionError::AlreadyStarted`]; a
    /// stopped one answers [`SessionError::Stopped`] and has to go through
    /// [`shutdown_and_restart`](Self::shutdown_and_restart).
    pub async fn start(&self) -> Result<PeerId, SessionError> {
        let mut state = self.lifecycle.lock().await;
        match *state {
            SessionState::Started => Err(SessionError::AlreadyStarted),
            SessionState::Stopped => Err(SessionError::Stopped),
            SessionState::NotStarted => {
                let peer = self.launch().await?;
                *state = SessionState::Started;
                Ok(peer)
            }
        }
    }

    /// Tears the session down. Stopping twice is harmless.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let mut state = self.lifecycle.lock().await;
        match *state {
            SessionState::NotStarted => Err(SessionError::NotStarted),
            SessionState::Stopped => Ok(()),
            SessionState::Started => {
                self.teardown(StopReason::Stopped).await;
                *state = SessionState::Stopped;
                Ok(())
            }
        }
    }

    /// Closes the network handle and builds a fresh one.
    ///
    /// Every stream handle from before is invalid afterwards, the connected
    /// peers are forgotten and inbound handlers have to be registered again.
    /// The new session usually has a new [`PeerId`].
    pub async fn shutdown_and_restart(&self) -> Result<PeerId, SessionError> {
        let mut state = self.lifecycle.lock().await;
        match *state {
            SessionState::NotStarted => Err(SessionError::NotStarted),
            SessionState::Started | SessionState::Stopped => {
                self.teardown(StopReason::Restarted).await;
                *state = SessionState::Stopped;
                let peer = self.launch().await?;
                *state = SessionState::Started;
                tracing::info!("Session restarted as {}", peer);
                Ok(peer)
            }
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.lifecycle.lock().await
    }

    /// The local peer of the running session.
    pub fn peer_id(&self) -> Result<PeerId, SessionError> {
        Ok(self.live_network()?.peer_id())
    }

    /// The live network handle.
    pub fn network(&self) -> Result<SharedNetwork, SessionError> {
        self.live_network()
    }

    /// The shutdown signal of the running session. It fires when the session
    /// stops or restarts.
    pub fn shutdown_signal(&self) -> Result<Shutdown, SessionError> {
        self.live
            .read()
            .as_ref()
            .map(|live| live.shutdown.clone())
            .ok_or(SessionError::NotStarted)
    }

    /// A snapshot of the connected peers, in the order they connected.
    pub fn members(&self) -> Vec<PeerId> {
        self.membership.current_members()
    }

    pub fn subscribe_members(&self) -> broadcast::Receiver<MembershipChange> {
        self.membership.subscribe()
    }

    pub fn membership(&self) -> &Arc<PeerMembership> {
        &self.membership
    }

    /// Finds an address other peers can dial us on, through `relay`.
    pub async fn discover(&self, relay: &Multiaddr) -> Result<Multiaddr, SessionError> {
        let (network, shutdown) = {
            let live = self.live.read();
            let live = live.as_ref().ok_or(SessionError::NotStarted)?;
            (live.network.clone(), live.shutdown.clone())
        };
        AddressResolver::new(network, shutdown)
            .resolve(relay, self.config.resolver)
            .await
            .map_err(Into::into)
    }

    /// Like [`discover`](Self::discover), but renders a failure as the text
    /// shown in place of an address.
    pub async fn discover_or_sentinel(&self, relay: &Multiaddr) -> String {
        match self.discover(relay).await {
            Ok(address) => address.to_string(),
            Err(e) => {
                tracing::warn!("Discovery through {} failed: {}", relay, e);
                NO_ADDRESS_SENTINEL.to_string()
            }
        }
    }

    /// Dials `address` directly and returns the peer that answered.
    pub async fn connect(&self, address: &Multiaddr) -> Result<PeerId, SessionError> {
        let network = self.live_network()?;
        let connection = network.dial(address).await.map_err(|e| {
            tracing::warn!("Failed to connect to {}: {}", address, e);
            e
        })?;
        tracing::info!("{} connected to {}", network.peer_id(), connection.remote_peer);
        Ok(connection.remote_peer)
    }

    /// Disconnects from one peer without touching the rest of the session.
    pub async fn hang_up(&self, peer: PeerId) -> Result<(), SessionError> {
        let network = self.live_network()?;
        network.hang_up(peer).await?;
        Ok(())
    }

    pub fn register_handler<F>(&self, protocol: &str, on_incoming: F) -> Result<(), SessionError>
    where
        F: Fn(PeerId, ByteSource) + Send + Sync + 'static,
    {
        self.live_channel()?.register_handler(protocol, on_incoming);
        Ok(())
    }

    pub fn unregister_handler(&self, protocol: &str) -> Result<(), SessionError> {
        self.live_channel()?.unregister_handler(protocol);
        Ok(())
    }

    pub async fn open_outbound(
        &self,
        protocol: &str,
        remote: &Multiaddr,
        transient: bool,
    ) -> Result<StreamHandle, SessionError> {
        let channel = self.live_channel()?;
        Ok(channel.open_outbound(protocol, remote, transient).await?)
    }

    /// Opens a stream to `remote` with the configured protocol and transient
    /// setting.
    pub async fn open_stream(&self, remote: &Multiaddr) -> Result<StreamHandle, SessionError> {
        self.open_outbound(&self.config.protocol, remote, self.config.transient)
            .await
    }

    pub fn send(&self, handle: StreamHandle, chunk: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        Ok(self.live_channel()?.send(handle, chunk)?)
    }

    pub fn close(&self, handle: StreamHandle) -> Result<(), SessionError> {
        self.live_channel()?.close(handle);
        Ok(())
    }

    /// Forwards `producer` into the stream until it runs out, the handle is
    /// closed or the session goes away.
    pub fn pipe<S>(&self, handle: StreamHandle, producer: S) -> Result<JoinHandle<()>, SessionError>
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        Ok(self.live_channel()?.pipe(handle, producer)?)
    }

    /// The number of outbound streams open in the running session.
    pub fn open_streams(&self) -> Result<usize, SessionError> {
        Ok(self.live_channel()?.open_streams())
    }

    fn live_network(&self) -> Result<SharedNetwork, SessionError> {
        self.live
            .read()
            .as_ref()
            .map(|live| live.network.clone())
            .ok_or(SessionError::NotStarted)
    }

    fn live_channel(&self) -> Result<Arc<StreamChannel>, SessionError> {
        self.live
            .read()
            .as_ref()
            .map(|live| live.channel.clone())
            .ok_or(SessionError::NotStarted)
    }

    /// Builds, wires and starts a new network handle.
    async fn launch(&self) -> Result<PeerId, SessionError> {
        let network = self.factory.create();
        // Subscribe first so no connection made during start is missed
        let events = network.events();
        network.start().await.map_err(|e| {
            tracing::error!("Failed to start the network: {}", e);
            e
        })?;

        let peer = network.peer_id();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let shutdown = Shutdown::new();
        let channel = StreamChannel::new(network.clone(), shutdown.clone(), generation).shared();
        let watcher = self
            .membership
            .watch(network.clone(), events, shutdown.clone());
        *self.live.write() = Some(Live {
            network,
            channel,
            shutdown,
            watcher,
        });
        tracing::info!("Session {} started as {}", generation, peer);
        Ok(peer)
    }

    /// Ends the running session, if any, and forgets everything tied to it.
    async fn teardown(&self, reason: StopReason) {
        let live = self.live.write().take();
        let Some(live) = live else {
            return;
        };
        let peer = live.network.peer_id();
        live.shutdown.shut_down_with(reason);
        live.watcher.abort();
        // Nothing may touch the membership once it is cleared below
        let _ = live.watcher.await;
        live.channel.close_all();
        live.network.stop().await;
        self.membership.clear();
        tracing::info!("Session of {} torn down: {:?}", peer, reason);
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("The session has not been started")]
    NotStarted,
    #[error("The session is already running")]
    AlreadyStarted,
    #[error("The session was stopped and must be restarted")]
    Stopped,
    #[error("Address discovery failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),
    #[error("Stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("Network failed: {0}")]
    Network(#[from] NetworkError),
}
