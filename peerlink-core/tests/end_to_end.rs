use anyhow::Result;
use peerlink_core::{
    log_store::{LogError, LogEvent, LogStore, MemoryLogStore},
    membership::MembershipChange,
    networks::Overlay,
    session::{SessionConfig, SessionError},
    stream::{collect_text, iterations, StreamError, DEFAULT_PROTOCOL},
    Network, SessionController,
};
use serde_json::json;
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

fn session(overlay: &Overlay) -> SessionController {
    SessionController::new(overlay.factory(), SessionConfig::default())
}

#[tokio::test]
#[tracing_test::traced_test]
async fn peer_joins_through_discovered_address() -> Result<()> {
    let overlay = Overlay::new();
    let relay = overlay.relay();
    relay.start().await?;

    let a = session(&overlay);
    a.start().await?;
    let mut changes = a.subscribe_members();
    let x = a.discover(&relay.memory_address()).await?;
    assert_eq!(
        timeout(WAIT, changes.recv()).await??,
        MembershipChange::Joined(relay.peer_id())
    );

    let b = session(&overlay);
    let b_peer = b.start().await?;
    assert_eq!(b.connect(&x).await?, a.peer_id()?);

    assert_eq!(
        timeout(WAIT, changes.recv()).await??,
        MembershipChange::Joined(b_peer)
    );
    assert_eq!(a.members(), vec![relay.peer_id(), b_peer]);
    Ok(())
}

#[tokio::test]
async fn iterations_flow_between_sessions() -> Result<()> {
    let overlay = Overlay::with_publish_delay(Duration::from_millis(15));
    let relay = overlay.relay();
    relay.start().await?;

    let a = session(&overlay);
    a.start().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    a.register_handler(DEFAULT_PROTOCOL, move |peer, source| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send((peer, collect_text(source).await));
        });
    })?;
    let x = a.discover(&relay.memory_address()).await?;

    let b = session(&overlay);
    let b_peer = b.start().await?;
    let handle = b.open_stream(&x).await?;
    b.pipe(handle, iterations(3, Duration::from_millis(1)))?
        .await?;

    let (from, chunks) = timeout(WAIT, rx.recv()).await?.unwrap();
    assert_eq!(from, b_peer);
    assert_eq!(chunks, ["Iteration 0", "Iteration 1", "Iteration 2"]);
    Ok(())
}

#[tokio::test]
async fn restart_recovers_after_remote_hangup() -> Result<()> {
    let overlay = Overlay::new();
    let relay = overlay.relay();
    relay.start().await?;

    let a = session(&overlay);
    a.start().await?;
    // The handler drops its source; the stream stays open regardless
    a.register_handler(DEFAULT_PROTOCOL, |_, _| {})?;
    let x = a.discover(&relay.memory_address()).await?;

    let b = session(&overlay);
    b.start().await?;
    let handle = b.open_stream(&x).await?;
    b.send(handle, "hello")?;
    tokio::task::yield_now().await;
    b.send(handle, "still there?")?;

    // The remote side goes away; only a restart gets A back on the overlay
    a.shutdown_and_restart().await?;
    assert_eq!(
        b.send(handle, "anyone?"),
        Err(SessionError::Stream(StreamError::Closed))
    );
    assert!(matches!(
        b.open_stream(&x).await,
        Err(SessionError::Stream(StreamError::Dial(_)))
    ));

    a.register_handler(DEFAULT_PROTOCOL, |_, _| {})?;
    let x = a.discover(&relay.memory_address()).await?;
    let handle = b.open_stream(&x).await?;
    b.send(handle, "hello again")?;
    b.close(handle)?;
    Ok(())
}

#[tokio::test]
async fn sessions_share_a_log() -> Result<()> {
    let overlay = Overlay::new();
    let relay = overlay.relay();
    relay.start().await?;

    let a = session(&overlay);
    a.start().await?;
    let a_store = MemoryLogStore::for_session(&a)?;
    let a_log = a_store.open("dashboard").await?;

    let b = session(&overlay);
    let b_peer = b.start().await?;
    let b_store = MemoryLogStore::for_session(&b)?;
    let b_log = b_store.open("dashboard").await?;
    let mut a_events = a_log.events();

    let x = a.discover(&relay.memory_address()).await?;
    b.connect(&x).await?;
    b_log.add(json!({ "text": "hi from b" })).await?;

    assert_eq!(timeout(WAIT, a_events.recv()).await??, LogEvent::Join(b_peer));
    match timeout(WAIT, a_events.recv()).await?? {
        LogEvent::Update(record) => assert_eq!(record.value, json!({ "text": "hi from b" })),
        other => panic!("Expected an update, got {other:?}"),
    }

    // Newest first is the caller's job
    a_log.add(json!({ "text": "hi from a" })).await?;
    let newest_first: Vec<_> = a_log.all().into_iter().rev().map(|r| r.value).collect();
    assert_eq!(
        newest_first,
        vec![json!({ "text": "hi from a" }), json!({ "text": "hi from b" })]
    );
    Ok(())
}

#[tokio::test]
async fn log_store_needs_a_running_session() {
    let overlay = Overlay::new();
    let a = session(&overlay);
    assert!(MemoryLogStore::for_session(&a).is_err());
}

#[tokio::test]
async fn log_store_closes_with_its_session() -> Result<()> {
    let overlay = Overlay::new();
    let a = session(&overlay);
    a.start().await?;
    let store = MemoryLogStore::for_session(&a)?;
    let log = store.open("dashboard").await?;
    log.add(json!("before")).await?;

    a.shutdown_and_restart().await?;
    assert!(matches!(store.open("dashboard").await, Err(LogError::Closed)));
    assert!(matches!(log.add(json!("after")).await, Err(LogError::Closed)));
    assert_eq!(log.all().len(), 1);

    // A store for the restarted session works until the session stops
    let store = MemoryLogStore::for_session(&a)?;
    let log = store.open("dashboard").await?;
    log.add(json!("fresh")).await?;
    a.stop().await?;
    assert!(matches!(log.add(json!("gone")).await, Err(LogError::Closed)));
    assert!(matches!(store.open("dashboard").await, Err(LogError::Closed)));
    Ok(())
}
