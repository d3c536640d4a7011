//! A scripted run of the whole session flow on the simulated overlay.
//!
//! One relay and two browser peers, A and B, take part. A discovers a
//! circuit address through the relay and listens on the application
//! protocol. B connects to that address, pipes a few iterations to A and
//! shares a log record. A then restarts, which is the only way to recover
//! from losing its peers.

use peerlink_core::{
    log_store::{LogError, LogEvent, LogStore, MemoryLogStore},
    network::NetworkError,
    networks::Overlay,
    session::{SessionConfig, SessionError},
    stream::iterations,
    Multiaddr, Network, PeerId, SessionController,
};
use serde_json::json;
use std::{fmt, time::Duration};
use thiserror::Error as ThisError;
use tokio::{sync::mpsc, time::timeout};

/// The name of the log both peers share.
pub const LOG_NAME: &str = "dashboard";

/// How long the demo waits for anything to arrive.
const PATIENCE: Duration = Duration::from_secs(5);

/// Knobs for [`run`].
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub session: SessionConfig,
    /// How many chunks B sends to A.
    pub iterations: usize,
    /// The pause between two chunks.
    pub interval: Duration,
    /// How long the relay takes to publish a circuit address.
    pub publish_delay: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            iterations: 5,
            interval: Duration::from_millis(100),
            publish_delay: Duration::from_millis(20),
        }
    }
}

/// What happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoReport {
    pub relay: Multiaddr,
    pub peer_a: PeerId,
    pub peer_b: PeerId,
    /// The address A discovered for itself.
    pub address_a: Multiaddr,
    /// A's connected peers once B has connected.
    pub members_a: Vec<PeerId>,
    /// The chunks A received, decoded as text.
    pub received: Vec<String>,
    /// A's log, newest first.
    pub log: Vec<serde_json::Value>,
    /// A's identity after the restart.
    pub restarted_a: PeerId,
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Relay:      {}", self.relay)?;
        writeln!(f, "Peer A:     {}", self.peer_a)?;
        writeln!(f, "Address A:  {}", self.address_a)?;
        writeln!(f, "Peer B:     {}", self.peer_b)?;
        writeln!(f, "A's peers:")?;
        for peer in &self.members_a {
            writeln!(f, "  {peer}")?;
        }
        writeln!(f, "A received:")?;
        for chunk in &self.received {
            writeln!(f, "  {chunk}")?;
        }
        writeln!(f, "Log, newest first:")?;
        for value in &self.log {
            writeln!(f, "  {value}")?;
        }
        write!(f, "A restarted as {}", self.restarted_a)
    }
}

#[derive(Debug, ThisError)]
pub enum DemoError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("Timed out waiting for {0}")]
    TimedOut(&'static str),
}

/// Runs the demo and reports what happened.
pub async fn run(options: DemoOptions) -> Result<DemoReport, DemoError> {
    let overlay = Overlay::with_publish_delay(options.publish_delay);
    let relay = overlay.relay();
    relay.start().await?;
    let relay_address = relay.memory_address();
    tracing::info!("Relay listening on {}", relay_address);

    let a = SessionController::new(overlay.factory(), options.session.clone());
    let peer_a = a.start().await?;
    let (chunks, mut received_chunks) = mpsc::unbounded_channel();
    a.register_handler(&options.session.protocol, move |peer, source| {
        tracing::info!("Incoming stream from {}", peer);
        let chunks = chunks.clone();
        peerlink_core::stream::spawn_reader(source, move |chunk| {
            let text = chunk.to_string();
            tracing::info!("Received: {}", text);
            let _ = chunks.send(text);
        });
    })?;
    let a_store = MemoryLogStore::for_session(&a)?;
    let a_log = a_store.open(LOG_NAME).await?;
    let mut a_log_events = a_log.events();

    let address_a = a.discover(&relay_address).await?;
    tracing::info!("A can be dialed on {}", address_a);

    let b = SessionController::new(overlay.factory(), options.session.clone());
    let peer_b = b.start().await?;
    let b_store = MemoryLogStore::for_session(&b)?;
    let b_log = b_store.open(LOG_NAME).await?;
    b.connect(&address_a).await?;

    let mut members = a.subscribe_members();
    timeout(PATIENCE, async {
        while !a.members().contains(&peer_b) {
            if members.recv().await.is_err() {
                break;
            }
        }
    })
    .await
    .map_err(|_| DemoError::TimedOut("B to show up in A's peers"))?;
    let members_a = a.members();

    let handle = b.open_stream(&address_a).await?;
    let piping = b.pipe(handle, iterations(options.iterations, options.interval))?;
    let mut received = Vec::with_capacity(options.iterations);
    while received.len() < options.iterations {
        match timeout(PATIENCE, received_chunks.recv()).await {
            Ok(Some(chunk)) => received.push(chunk),
            _ => return Err(DemoError::TimedOut("iterations from B")),
        }
    }
    if piping.await.is_err() {
        tracing::warn!("The piping task of B did not finish cleanly");
    }

    b_log
        .add(json!({ "from": peer_b.to_string(), "text": "Hello from B" }))
        .await?;
    timeout(PATIENCE, async {
        loop {
            match a_log_events.recv().await {
                Ok(LogEvent::Update(record)) if record.id.author == peer_b.to_string() => break,
                Ok(LogEvent::Join(peer)) => tracing::info!("{} joined the log", peer),
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await
    .map_err(|_| DemoError::TimedOut("B's log record"))?;
    a_log
        .add(json!({ "from": peer_a.to_string(), "text": "Hello from A" }))
        .await?;
    let log = a_log
        .all()
        .into_iter()
        .rev()
        .map(|record| record.value)
        .collect();

    drop(a_store);
    let restarted_a = a.shutdown_and_restart().await?;
    tracing::info!("A restarted as {}", restarted_a);

    drop(b_store);
    b.stop().await?;
    a.stop().await?;
    relay.stop().await;

    Ok(DemoReport {
        relay: relay_address,
        peer_a,
        peer_b,
        address_a,
        members_a,
        received,
        log,
        restarted_a,
    })
}
