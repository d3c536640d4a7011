//! Tracks which peers the local peer is directly connected to.

use crate::{
    network::{NetworkEvent, SharedNetwork},
    Shutdown,
};
use indexmap::IndexSet;
use libp2p_identity::PeerId;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

/// A change to the connected peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipChange {
    Joined(PeerId),
    Left(PeerId),
}

/// The set of currently connected peers, in the order they connected.
///
/// Connect and disconnect events may arrive more than once; applying them is
/// idempotent and a [`MembershipChange`] is only sent when the set actually
/// changes. Readers always get a copy, so reading never blocks the task that
/// applies events for longer than the copy takes.
#[derive(Debug)]
pub struct PeerMembership {
    members: RwLock<IndexSet<PeerId>>,
    notify: broadcast::Sender<MembershipChange>,
}

impl PeerMembership {
    pub fn new() -> Self {
        Self {
            members: Default::default(),
            notify: broadcast::channel(64).0,
        }
    }

    /// Creates a new shared handle to a membership tracker.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Records that `id` connected. Returns whether it was new.
    pub fn on_peer_connected(&self, id: PeerId) -> bool {
        let added = self.members.write().insert(id);
        if added {
            self.announce(MembershipChange::Joined(id));
        }
        added
    }

    /// Records that `id` disconnected. Returns whether it was a member.
    pub fn on_peer_disconnected(&self, id: PeerId) -> bool {
        let removed = self.members.write().shift_remove(&id);
        if removed {
            self.announce(MembershipChange::Left(id));
        }
        removed
    }

    /// Applies one network event.
    pub fn apply(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected(id) => self.on_peer_connected(id),
            NetworkEvent::PeerDisconnected(id) => self.on_peer_disconnected(id),
        };
    }

    /// A snapshot of the connected peers in the order they connected.
    pub fn current_members(&self) -> Vec<PeerId> {
        self.members.read().iter().copied().collect()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.members.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to membership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.notify.subscribe()
    }

    /// Removes every member, announcing each removal.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.members.write());
        for id in removed {
            self.announce(MembershipChange::Left(id));
        }
    }

    /// Brings the set in line with `connected` after events were missed.
    pub fn resync(&self, connected: impl IntoIterator<Item = PeerId>) {
        let connected: IndexSet<PeerId> = connected.into_iter().collect();
        for id in self.current_members() {
            if !connected.contains(&id) {
                self.on_peer_disconnected(id);
            }
        }
        for id in connected {
            self.on_peer_connected(id);
        }
    }

    /// Spawns a task applying `events` from `network` until the stream ends or
    /// `shutdown` fires.
    ///
    /// `events` should be subscribed before the network starts so that no
    /// connection is missed.
    pub fn watch(
        self: &Arc<Self>,
        network: SharedNetwork,
        mut events: broadcast::Receiver<NetworkEvent>,
        shutdown: Shutdown,
    ) -> JoinHandle<()> {
        let membership = self.clone();
        let local = network.peer_id();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.wait_for_shutdown() => break,
                };
                match event {
                    Ok(event) => {
                        let (remote, connected) = match event {
                            NetworkEvent::PeerConnected(id) => (id, true),
                            NetworkEvent::PeerDisconnected(id) => (id, false),
                        };
                        tracing::debug!(
                            "{} {} {}",
                            local,
                            if connected { "connected to" } else { "disconnected from" },
                            remote
                        );
                        membership.apply(event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} peer events, resyncing", missed);
                        membership.resync(network.connected_peers());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Stopped watching peers of {}", local);
        })
    }

    fn announce(&self, change: MembershipChange) {
        // No subscribers is fine
        let _ = self.notify.send(change);
    }
}

impl Default for PeerMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::Overlay;
    use crate::Network;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn peers(count: usize) -> Vec<PeerId> {
        (0..count).map(|_| PeerId::random()).collect()
    }

    #[test]
    fn keeps_connection_order_without_duplicates() {
        let membership = PeerMembership::new();
        let ids = peers(3);
        for id in [ids[1], ids[0], ids[1], ids[2], ids[0]] {
            membership.on_peer_connected(id);
        }
        assert_eq!(membership.current_members(), vec![ids[1], ids[0], ids[2]]);

        membership.on_peer_disconnected(ids[0]);
        assert_eq!(membership.current_members(), vec![ids[1], ids[2]]);
        assert_eq!(membership.len(), 2);
    }

    #[test]
    fn size_matches_distinct_connected_peers() {
        let membership = PeerMembership::new();
        let ids = peers(4);
        let script = [
            NetworkEvent::PeerConnected(ids[0]),
            NetworkEvent::PeerConnected(ids[1]),
            NetworkEvent::PeerDisconnected(ids[0]),
            NetworkEvent::PeerConnected(ids[2]),
            NetworkEvent::PeerConnected(ids[2]),
            NetworkEvent::PeerDisconnected(ids[3]),
            NetworkEvent::PeerConnected(ids[0]),
            NetworkEvent::PeerDisconnected(ids[1]),
            NetworkEvent::PeerDisconnected(ids[1]),
        ];
        let mut expected: IndexSet<PeerId> = IndexSet::new();
        for event in script {
            membership.apply(event);
            match event {
                NetworkEvent::PeerConnected(id) => expected.insert(id),
                NetworkEvent::PeerDisconnected(id) => expected.shift_remove(&id),
            };
            assert_eq!(membership.len(), expected.len());
            assert_eq!(
                membership.current_members(),
                expected.iter().copied().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn notifies_once_per_actual_change() {
        let membership = PeerMembership::new();
        let mut changes = membership.subscribe();
        let id = PeerId::random();

        assert!(membership.on_peer_connected(id));
        assert!(!membership.on_peer_connected(id));
        assert!(membership.on_peer_disconnected(id));
        assert!(!membership.on_peer_disconnected(id));

        assert_eq!(changes.try_recv(), Ok(MembershipChange::Joined(id)));
        assert_eq!(changes.try_recv(), Ok(MembershipChange::Left(id)));
        assert_eq!(changes.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn disconnecting_a_stranger_is_silent() {
        let membership = PeerMembership::new();
        let mut changes = membership.subscribe();
        assert!(!membership.on_peer_disconnected(PeerId::random()));
        assert!(membership.is_empty());
        assert_eq!(changes.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn clear_and_resync() {
        let membership = PeerMembership::new();
        let ids = peers(3);
        membership.on_peer_connected(ids[0]);
        membership.on_peer_connected(ids[1]);

        membership.resync([ids[1], ids[2]]);
        assert_eq!(membership.current_members(), vec![ids[1], ids[2]]);

        let mut changes = membership.subscribe();
        membership.clear();
        assert!(membership.is_empty());
        assert_eq!(changes.try_recv(), Ok(MembershipChange::Left(ids[1])));
        assert_eq!(changes.try_recv(), Ok(MembershipChange::Left(ids[2])));
    }

    #[tokio::test]
    async fn watches_network_events() {
        let overlay = Overlay::new();
        let relay = overlay.relay();
        relay.start().await.unwrap();
        let node = overlay.node();
        let membership = PeerMembership::new().shared();
        let mut changes = membership.subscribe();
        let shutdown = Shutdown::new();
        let watcher = membership.watch(node.clone(), node.events(), shutdown.clone());
        node.start().await.unwrap();

        node.dial(&relay.memory_address()).await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, MembershipChange::Joined(relay.peer_id()));
        assert_eq!(membership.current_members(), vec![relay.peer_id()]);

        relay.stop().await;
        let change = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, MembershipChange::Left(relay.peer_id()));

        shutdown.shut_down();
        watcher.await.unwrap();
    }
}
