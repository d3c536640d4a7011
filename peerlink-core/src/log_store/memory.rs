use super::{Database, LogError, LogEvent, LogStore, Record, RecordId, SharedDatabase};
use crate::{
    address,
    network::{NetworkEvent, SharedNetwork},
    stream::{ByteSource, StreamChannel, StreamHandle},
    FxDashMap, SessionController, Shutdown,
};
use async_trait::async_trait;
use futures::StreamExt;
use indexmap::{IndexMap, IndexSet};
use libp2p_identity::PeerId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    task::JoinHandle,
};

/// The protocol log stores replicate records over.
pub const LOG_PROTOCOL: &str = "/peerlink-log/1.0.0";

/// The wire form of one replicated record. Each stream chunk carries exactly
/// one envelope as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    database: String,
    record: Record,
}

/// A [`LogStore`] that keeps records in memory and replicates them to every
/// connected peer that runs one too.
///
/// Records added locally are pushed to the connected peers right away, and
/// a newly connected peer is sent everything known so far. Receiving a record
/// twice has no effect.
///
/// A store made with [`MemoryLogStore::for_session`] closes together with
/// that session. From then on `open` and `add` fail with [`LogError::Closed`].
pub struct MemoryLogStore {
    shared: Arc<Shared>,
    channel: Arc<StreamChannel>,
    shutdown: Shutdown,
    replicator: JoinHandle<()>,
}

struct Shared {
    local: PeerId,
    databases: FxDashMap<String, Arc<MemoryDatabase>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    liveness: Liveness,
}

/// Whether a store and its databases may still be used.
#[derive(Clone)]
struct Liveness {
    store: Shutdown,
    session: Option<Shutdown>,
}

impl Liveness {
    fn is_closed(&self) -> bool {
        self.store.is_shut_down() || self.session.as_ref().is_some_and(Shutdown::is_shut_down)
    }

    async fn closed(&self) {
        match &self.session {
            Some(session) => {
                tokio::select! {
                    _ = self.store.wait_for_shutdown() => {}
                    _ = session.wait_for_shutdown() => {}
                }
            }
            None => {
                self.store.wait_for_shutdown().await;
            }
        }
    }
}

impl MemoryLogStore {
    /// Creates a store replicating over `network`. It stays open until it is
    /// dropped.
    pub fn new(network: SharedNetwork) -> Self {
        Self::build(network, None)
    }

    /// Creates a store on the live network handle of `session`. The store
    /// closes when that session stops or restarts.
    pub fn for_session(session: &SessionController) -> Result<Self, LogError> {
        let signal = session
            .shutdown_signal()
            .map_err(|_| LogError::NotStarted)?;
        let network = session.network().map_err(|_| LogError::NotStarted)?;
        if signal.is_shut_down() {
            return Err(LogError::NotStarted);
        }
        Ok(Self::build(network, Some(signal)))
    }

    fn build(network: SharedNetwork, session: Option<Shutdown>) -> Self {
        let shutdown = Shutdown::new();
        let liveness = Liveness {
            store: shutdown.clone(),
            session,
        };
        let channel = StreamChannel::new(network.clone(), shutdown.clone(), 0).shared();
        let (outgoing, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local: network.peer_id(),
            databases: Default::default(),
            outgoing,
            liveness: liveness.clone(),
        });

        let receiving = shared.clone();
        channel.register_handler(LOG_PROTOCOL, move |peer, source| {
            tokio::spawn(receiving.clone().read(peer, source));
        });

        let events = network.events();
        let replicator = Replicator {
            network,
            channel: channel.clone(),
            shared: shared.clone(),
            streams: HashMap::new(),
        };
        let replicator = tokio::spawn(replicator.run(queue, events, liveness));

        Self {
            shared,
            channel,
            shutdown,
            replicator,
        }
    }

    /// The peer records written through this store are attributed to.
    pub fn peer_id(&self) -> PeerId {
        self.shared.local
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn open(&self, name: &str) -> Result<SharedDatabase, LogError> {
        if self.shared.liveness.is_closed() {
            return Err(LogError::Closed);
        }
        Ok(self.shared.database(name))
    }
}

impl Drop for MemoryLogStore {
    fn drop(&mut self) {
        self.shutdown.shut_down();
        self.replicator.abort();
        self.channel.unregister_handler(LOG_PROTOCOL);
        self.channel.close_all();
    }
}

impl Shared {
    fn database(&self, name: &str) -> Arc<MemoryDatabase> {
        self.databases
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Opened log {}", name);
                Arc::new(MemoryDatabase::new(
                    name,
                    self.local,
                    self.outgoing.clone(),
                    self.liveness.clone(),
                ))
            })
            .clone()
    }

    /// Everything known so far, encoded for the wire.
    fn snapshot(&self) -> Vec<Vec<u8>> {
        let databases: Vec<_> = self
            .databases
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut encoded = vec![];
        for database in databases {
            for record in database.all() {
                match database.encode(record) {
                    Ok(bytes) => encoded.push(bytes),
                    Err(e) => tracing::warn!("Skipping a record of {}: {}", database.name, e),
                }
            }
        }
        encoded
    }

    async fn read(self: Arc<Self>, peer: PeerId, mut source: ByteSource) {
        while let Some(chunk) = source.next().await {
            match serde_json::from_slice::<Envelope>(chunk.bytes()) {
                Ok(envelope) => self
                    .database(&envelope.database)
                    .merge(peer, envelope.record),
                Err(e) => tracing::warn!("Dropped a malformed record from {}: {}", peer, e),
            }
        }
    }
}

/// Pushes records out to connected peers, one outbound stream per peer.
struct Replicator {
    network: SharedNetwork,
    channel: Arc<StreamChannel>,
    shared: Arc<Shared>,
    streams: HashMap<PeerId, StreamHandle>,
}

impl Replicator {
    async fn run(
        mut self,
        mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
        mut events: broadcast::Receiver<NetworkEvent>,
        liveness: Liveness,
    ) {
        loop {
            tokio::select! {
                _ = liveness.closed() => break,
                bytes = queue.recv() => {
                    let Some(bytes) = bytes else { break };
                    for peer in self.network.connected_peers() {
                        self.deliver(peer, &bytes).await;
                    }
                }
                event = events.recv() => match event {
                    Ok(NetworkEvent::PeerConnected(peer)) => {
                        for bytes in self.shared.snapshot() {
                            self.deliver(peer, &bytes).await;
                        }
                    }
                    Ok(NetworkEvent::PeerDisconnected(peer)) => {
                        if let Some(handle) = self.streams.remove(&peer) {
                            self.channel.close(handle);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Log replication missed {} peer events", missed);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.channel.close_all();
        tracing::debug!("Log replication of {} stopped", self.shared.local);
    }

    async fn deliver(&mut self, peer: PeerId, bytes: &[u8]) {
        let handle = match self.streams.get(&peer).copied() {
            Some(handle) => handle,
            None => {
                let opened = self
                    .channel
                    .open_outbound(LOG_PROTOCOL, &address::peer_address(peer), true)
                    .await;
                match opened {
                    Ok(handle) => {
                        self.streams.insert(peer, handle);
                        handle
                    }
                    Err(e) => {
                        // Relays and peers without a store end up here
                        tracing::debug!("{} takes no log records: {}", peer, e);
                        return;
                    }
                }
            }
        };
        if let Err(e) = self.channel.send(handle, bytes) {
            tracing::debug!("Lost the log stream to {}: {}", peer, e);
            self.streams.remove(&peer);
        }
    }
}

/// One database of a [`MemoryLogStore`].
pub struct MemoryDatabase {
    name: String,
    local: PeerId,
    records: RwLock<IndexMap<RecordId, Record>>,
    /// Remote peers that have contributed records.
    joined: Mutex<IndexSet<PeerId>>,
    next_seq: AtomicU64,
    notify: broadcast::Sender<LogEvent>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    liveness: Liveness,
}

impl MemoryDatabase {
    fn new(
        name: &str,
        local: PeerId,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        liveness: Liveness,
    ) -> Self {
        Self {
            name: name.to_string(),
            local,
            records: Default::default(),
            joined: Default::default(),
            next_seq: AtomicU64::new(0),
            notify: broadcast::channel(256).0,
            outgoing,
            liveness,
        }
    }

    fn encode(&self, record: Record) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope {
            database: self.name.clone(),
            record,
        })
    }

    /// Takes in a record that `from` sent us.
    fn merge(&self, from: PeerId, record: Record) {
        {
            let mut records = self.records.write();
            if records.contains_key(&record.id) {
                return;
            }
            records.insert(record.id.clone(), record.clone());
        }
        if from != self.local && self.joined.lock().insert(from) {
            tracing::info!("{} joined log {}", from, self.name);
            let _ = self.notify.send(LogEvent::Join(from));
        }
        let _ = self.notify.send(LogEvent::Update(record));
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, value: serde_json::Value) -> Result<RecordId, LogError> {
        if self.liveness.is_closed() {
            return Err(LogError::Closed);
        }
        let id = RecordId {
            author: self.local.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let record = Record {
            id: id.clone(),
            value,
        };
        let bytes = self.encode(record.clone())?;
        self.merge(self.local, record);
        self.outgoing.send(bytes).map_err(|_| LogError::Closed)?;
        Ok(id)
    }

    fn all(&self) -> Vec<Record> {
        self.records.read().values().cloned().collect()
    }

    fn events(&self) -> broadcast::Receiver<LogEvent> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{networks::Overlay, Network};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn record(author: PeerId, seq: u64, value: serde_json::Value) -> Record {
        Record {
            id: RecordId {
                author: author.to_string(),
                seq,
            },
            value,
        }
    }

    #[tokio::test]
    async fn local_records_come_back_oldest_first() {
        let overlay = Overlay::new();
        let node = overlay.node();
        node.start().await.unwrap();
        let store = MemoryLogStore::new(node.clone());
        let db = store.open("dashboard").await.unwrap();
        let mut events = db.events();

        let first = db.add(json!({ "n": 1 })).await.unwrap();
        let second = db.add(json!({ "n": 2 })).await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(first.author, node.peer_id().to_string());

        let values: Vec<_> = db.all().into_iter().map(|record| record.value).collect();
        assert_eq!(values, vec![json!({ "n": 1 }), json!({ "n": 2 })]);
        assert!(matches!(events.recv().await, Ok(LogEvent::Update(r)) if r.id == first));
        assert!(matches!(events.recv().await, Ok(LogEvent::Update(r)) if r.id == second));
    }

    #[tokio::test]
    async fn opening_twice_returns_the_same_database() {
        let overlay = Overlay::new();
        let node = overlay.node();
        node.start().await.unwrap();
        let store = MemoryLogStore::new(node);
        let a = store.open("dashboard").await.unwrap();
        a.add(json!("hello")).await.unwrap();
        let b = store.open("dashboard").await.unwrap();
        assert_eq!(b.all().len(), 1);
        assert!(store.open("other").await.unwrap().all().is_empty());
    }

    #[tokio::test]
    async fn databases_close_with_their_store() {
        let overlay = Overlay::new();
        let node = overlay.node();
        node.start().await.unwrap();
        let store = MemoryLogStore::new(node);
        let db = store.open("dashboard").await.unwrap();
        db.add(json!("kept")).await.unwrap();

        drop(store);
        assert!(matches!(db.add(json!("lost")).await, Err(LogError::Closed)));
        assert_eq!(db.all().len(), 1);
    }

    #[test]
    fn merging_is_idempotent_and_joins_once() {
        let (outgoing, _queue) = mpsc::unbounded_channel();
        let liveness = Liveness {
            store: Shutdown::new(),
            session: None,
        };
        let db = MemoryDatabase::new("dashboard", PeerId::random(), outgoing, liveness);
        let mut events = db.events();
        let remote = PeerId::random();

        db.merge(remote, record(remote, 0, json!(1)));
        db.merge(remote, record(remote, 0, json!(1)));
        db.merge(remote, record(remote, 1, json!(2)));

        assert_eq!(db.all().len(), 2);
        assert_eq!(events.try_recv().unwrap(), LogEvent::Join(remote));
        assert!(matches!(events.try_recv(), Ok(LogEvent::Update(r)) if r.id.seq == 0));
        assert!(matches!(events.try_recv(), Ok(LogEvent::Update(r)) if r.id.seq == 1));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn records_replicate_to_connected_peers() {
        let overlay = Overlay::new();
        let relay = overlay.relay();
        let alice = overlay.node();
        let bob = overlay.node();
        for node in [&relay, &alice, &bob] {
            node.start().await.unwrap();
        }
        let alice_store = MemoryLogStore::new(alice.clone());
        let bob_store = MemoryLogStore::new(bob.clone());
        let alice_db = alice_store.open("dashboard").await.unwrap();
        let bob_db = bob_store.open("dashboard").await.unwrap();
        let mut bob_events = bob_db.events();

        // Written before the two peers know each other
        alice_db.add(json!("early")).await.unwrap();

        alice.dial(&relay.memory_address()).await.unwrap();
        let circuit = timeout(Duration::from_secs(1), async {
            loop {
                if let Some(address) = alice
                    .listen_addrs()
                    .into_iter()
                    .find(address::is_circuit_dialable)
                {
                    return address;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        bob.dial(&circuit).await.unwrap();

        let event = timeout(Duration::from_secs(1), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, LogEvent::Join(alice.peer_id()));
        let event = timeout(Duration::from_secs(1), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, LogEvent::Update(r) if r.value == json!("early")));

        alice_db.add(json!("late")).await.unwrap();
        let event = timeout(Duration::from_secs(1), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, LogEvent::Update(r) if r.value == json!("late")));

        let values: Vec<_> = bob_db.all().into_iter().map(|r| r.value).collect();
        assert_eq!(values, vec![json!("early"), json!("late")]);
    }
}
