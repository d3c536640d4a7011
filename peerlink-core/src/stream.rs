//! Application byte streams over a named protocol.
//!
//! A [`StreamChannel`] sits on top of one network handle. It registers
//! inbound handlers, which receive each new stream as a [`ByteSource`], and it
//! opens outbound streams, which are driven through [`StreamHandle`]s. Chunks
//! are delivered as sent, in order, with no framing added.

use crate::{
    logging,
    network::{DialOptions, InboundStream, RawStream, SharedNetwork},
    FxDashMap, Shutdown,
};
use futures::{stream::BoxStream, Stream, StreamExt};
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub use crate::network::StreamError;

/// The protocol the dashboard application speaks.
pub const DEFAULT_PROTOCOL: &str = "/helia-browser-dashboard/1.0.0";

/// Identifies one outbound stream of one session.
///
/// Handles are plain tokens; a handle from a session that has since been
/// stopped or restarted never matches a live stream again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    id: u64,
    generation: u64,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One chunk received on an inbound stream, exactly as it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk(Vec<u8>);

impl InboundChunk {
    /// The chunk decoded as text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for InboundChunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for InboundChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// The chunks of one inbound stream.
///
/// The source is lazy: each chunk is only taken off the stream when the
/// handler polls for it. It ends when the remote closes the stream or the
/// connection goes away.
pub struct ByteSource {
    remote: PeerId,
    protocol: String,
    chunks: BoxStream<'static, InboundChunk>,
}

impl ByteSource {
    fn new(stream: InboundStream) -> Self {
        let InboundStream {
            remote_peer,
            protocol,
            source,
            reset,
        } = stream;
        let chunks = futures::stream::unfold((source, reset), |(mut source, reset)| async move {
            let next = tokio::select! {
                biased;
                chunk = source.recv() => chunk,
                _ = reset.cancelled() => None,
            };
            next.map(|bytes| (InboundChunk::from(bytes), (source, reset)))
        });
        Self {
            remote: remote_peer,
            protocol,
            chunks: chunks.boxed(),
        }
    }

    /// The peer that opened the stream.
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl Stream for ByteSource {
    type Item = InboundChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// The state behind one [`StreamHandle`].
struct Outbound {
    remote: PeerId,
    protocol: String,
    sink: UnboundedSender<Vec<u8>>,
    /// Cancelled by the network when the connection goes away.
    reset: CancellationToken,
    /// Cancelled by [`StreamChannel::close`].
    closed: CancellationToken,
}

/// Inbound handler registration and outbound streams for one network handle.
pub struct StreamChannel {
    network: SharedNetwork,
    shutdown: Shutdown,
    /// Distinguishes the handles of this channel from those of earlier
    /// sessions.
    generation: u64,
    next_id: AtomicU64,
    outbound: FxDashMap<u64, Outbound>,
}

impl StreamChannel {
    /// Creates a channel over `network`. Handles it gives out carry
    /// `generation`.
    pub fn new(network: SharedNetwork, shutdown: Shutdown, generation: u64) -> Self {
        Self {
            network,
            shutdown,
            generation,
            next_id: AtomicU64::new(0),
            outbound: Default::default(),
        }
    }

    /// Creates a new shared handle to a channel.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Binds `on_incoming` to `protocol`, replacing any earlier handler for
    /// the same name. The handler runs once for each inbound stream.
    pub fn register_handler<F>(&self, protocol: &str, on_incoming: F)
    where
        F: Fn(PeerId, ByteSource) + Send + Sync + 'static,
    {
        let local = self.network.peer_id();
        self.network.handle(
            protocol,
            Arc::new(move |stream: InboundStream| {
                logging::stream_event(local, stream.remote_peer, &stream.protocol, "accepted");
                let remote = stream.remote_peer;
                on_incoming(remote, ByteSource::new(stream));
            }),
        );
        tracing::info!("{} registered a handler for {}", local, protocol);
    }

    /// Removes the handler for `protocol`.
    pub fn unregister_handler(&self, protocol: &str) {
        self.network.unhandle(protocol);
    }

    /// Dials `remote` and opens a stream for `protocol`.
    ///
    /// `transient` allows the stream to run on a connection that is still
    /// relayed.
    pub async fn open_outbound(
        &self,
        protocol: &str,
        remote: &Multiaddr,
        transient: bool,
    ) -> Result<StreamHandle, StreamError> {
        if self.shutdown.is_shut_down() {
            return Err(StreamError::Closed);
        }
        let options = DialOptions {
            run_on_transient_connection: transient,
        };
        let RawStream {
            remote_peer,
            protocol,
            sink,
            reset,
        } = self
            .network
            .dial_protocol(remote, protocol, options)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to open {} on {}: {}", protocol, remote, e);
                e
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        logging::stream_event(self.network.peer_id(), remote_peer, &protocol, "opened");
        self.outbound.insert(
            id,
            Outbound {
                remote: remote_peer,
                protocol,
                sink,
                reset,
                closed: CancellationToken::new(),
            },
        );
        Ok(StreamHandle {
            id,
            generation: self.generation,
        })
    }

    /// Appends `chunk` to the stream. Chunks arrive in the order they were
    /// sent; nothing confirms their arrival.
    pub fn send(&self, handle: StreamHandle, chunk: impl Into<Vec<u8>>) -> Result<(), StreamError> {
        if handle.generation != self.generation {
            return Err(StreamError::Closed);
        }
        let delivered = {
            let outbound = self.outbound.get(&handle.id).ok_or(StreamError::Closed)?;
            !outbound.reset.is_cancelled() && outbound.sink.send(chunk.into()).is_ok()
        };
        if delivered {
            Ok(())
        } else {
            // The remote hung up, so the handle is done too.
            self.close(handle);
            Err(StreamError::Closed)
        }
    }

    /// Ends the stream. Closing a handle more than once is harmless.
    pub fn close(&self, handle: StreamHandle) {
        if handle.generation != self.generation {
            return;
        }
        if let Some((_, outbound)) = self.outbound.remove(&handle.id) {
            outbound.closed.cancel();
            logging::stream_event(
                self.network.peer_id(),
                outbound.remote,
                &outbound.protocol,
                "closed",
            );
        }
    }

    /// Forwards every chunk `producer` yields into the stream.
    ///
    /// The returned task ends when the producer runs out, when the handle is
    /// closed, when the connection goes away, or when the session shuts down.
    /// The stream is closed once the task ends.
    pub fn pipe<S>(
        self: &Arc<Self>,
        handle: StreamHandle,
        producer: S,
    ) -> Result<JoinHandle<()>, StreamError>
    where
        S: Stream<Item = Vec<u8>> + Send + 'static,
    {
        if handle.generation != self.generation {
            return Err(StreamError::Closed);
        }
        let (sink, reset, closed) = {
            let outbound = self.outbound.get(&handle.id).ok_or(StreamError::Closed)?;
            (
                outbound.sink.clone(),
                outbound.reset.clone(),
                outbound.closed.clone(),
            )
        };
        let channel = self.clone();
        let shutdown = self.shutdown.clone();
        Ok(tokio::spawn(async move {
            let mut producer = Box::pin(producer);
            loop {
                let chunk = tokio::select! {
                    chunk = producer.next() => chunk,
                    _ = closed.cancelled() => None,
                    _ = reset.cancelled() => None,
                    _ = shutdown.wait_for_shutdown() => None,
                };
                let Some(chunk) = chunk else { break };
                if sink.send(chunk).is_err() {
                    break;
                }
            }
            drop(sink);
            channel.close(handle);
        }))
    }

    /// Closes every outbound stream.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.outbound.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.close(StreamHandle {
                id,
                generation: self.generation,
            });
        }
    }

    /// The number of outbound streams still open.
    pub fn open_streams(&self) -> usize {
        self.outbound.len()
    }

    /// The peer an open stream leads to.
    pub fn remote_of(&self, handle: StreamHandle) -> Option<PeerId> {
        if handle.generation != self.generation {
            return None;
        }
        self.outbound.get(&handle.id).map(|outbound| outbound.remote)
    }
}

/// A producer yielding `"Iteration {i}"` for `i` in `0..count`, pausing
/// `interval` between chunks.
pub fn iterations(count: usize, interval: Duration) -> impl Stream<Item = Vec<u8>> + Send {
    futures::stream::unfold(0, move |i| async move {
        if i >= count {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        Some((format!("Iteration {i}").into_bytes(), i + 1))
    })
}

/// Collects every chunk of `source` as text, replacing invalid UTF-8.
pub async fn collect_text(source: ByteSource) -> Vec<String> {
    source.map(|chunk| chunk.to_string()).collect().await
}

/// Reads chunks off `source` and hands each to `each` until the stream ends.
pub fn spawn_reader<F>(mut source: ByteSource, mut each: F) -> JoinHandle<()>
where
    F: FnMut(InboundChunk) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(chunk) = source.next().await {
            each(chunk);
        }
    })
}
