//! Integration tests for end-to-end star-topology replication.
//!
//! These tests start a real hub and connect real spokes over loopback
//! WebSockets, verifying onboarding order, flood semantics, departure
//! cleanup and reconnection against the live network stack.

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scene_sync::media::{CallCapability, MediaError, MediaStream};
use scene_sync::protocol::{Event, Frame};
use scene_sync::topology::{Session, SyncConfig, SyncHandle};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct StubCapability;

#[async_trait::async_trait]
impl CallCapability for StubCapability {
    async fn call(&self, peer: Uuid) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new(peer))
    }
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub on a free port, return its handle, peer id and port.
async fn start_hub(name: &str) -> (SyncHandle, Uuid, u16) {
    let port = free_port().await;
    let config = SyncConfig::hub(format!("127.0.0.1:{port}"), name);
    let session = Session::new(config, Arc::new(StubCapability));
    let handle = session.handle();
    let peer = session.local_peer();
    tokio::spawn(async move {
        session.run().await.unwrap();
    });
    // Give the listener time to bind.
    sleep(Duration::from_millis(50)).await;
    (handle, peer, port)
}

/// Connect a raw WebSocket spoke: dial, send our Hello, return the socket.
async fn raw_spoke(port: u16, name: &str) -> (RawWs, Uuid) {
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = connect_async(&url).await.unwrap();
    let peer = Uuid::new_v4();
    let hello = Frame::Hello {
        peer,
        name: name.into(),
    };
    ws.send(Message::Binary(hello.encode().unwrap().into()))
        .await
        .unwrap();
    (ws, peer)
}

/// Read the next binary frame, skipping control messages.
async fn next_frame(ws: &mut RawWs) -> Frame {
    loop {
        match ws.next().await.expect("socket ended").unwrap() {
            Message::Binary(data) => {
                let bytes: Vec<u8> = data.into();
                return Frame::decode(&bytes).unwrap();
            }
            _ => continue,
        }
    }
}

/// Poll a condition until it holds or two seconds elapse.
async fn eventually<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_hub_accepts_connections() {
    let (_handle, _peer, port) = start_hub("Host").await;

    let url = format!("ws://127.0.0.1:{port}");
    let result = connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to hub");
}

#[tokio::test]
async fn test_snapshot_before_announce() {
    let (_handle, hub_peer, port) = start_hub("Host").await;

    let (mut alice_ws, alice) = raw_spoke(port, "Alice").await;

    // Alice's onboarding: hub identity, membership, scene — in order.
    match timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
        .await
        .unwrap()
    {
        Frame::Hello { peer, name } => {
            assert_eq!(peer, hub_peer);
            assert_eq!(name, "Host");
        }
        other => panic!("Expected Hello first, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
        .await
        .unwrap()
    {
        Frame::Others(list) => {
            let peers: Vec<Uuid> = list.iter().map(|s| s.peer).collect();
            assert_eq!(peers, vec![hub_peer], "only the hub pre-exists Alice");
        }
        other => panic!("Expected Others second, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
        .await
        .unwrap()
    {
        Frame::Batch(events) => assert_eq!(events, vec![Event::Init]),
        other => panic!("Expected scene snapshot third, got {other:?}"),
    }

    // Bob joins; his snapshot lists hub and Alice, never himself.
    let (mut bob_ws, bob) = raw_spoke(port, "Bob").await;
    let _hello = timeout(Duration::from_secs(2), next_frame(&mut bob_ws))
        .await
        .unwrap();
    match timeout(Duration::from_secs(2), next_frame(&mut bob_ws))
        .await
        .unwrap()
    {
        Frame::Others(list) => {
            let peers: Vec<Uuid> = list.iter().map(|s| s.peer).collect();
            assert!(peers.contains(&hub_peer));
            assert!(peers.contains(&alice));
            assert!(!peers.contains(&bob));
        }
        other => panic!("Expected Others, got {other:?}"),
    }

    // Alice hears about Bob only after his snapshot went out.
    match timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
        .await
        .unwrap()
    {
        Frame::Batch(events) => assert_eq!(
            events,
            vec![Event::User {
                peer: bob,
                name: "Bob".into()
            }]
        ),
        other => panic!("Expected Bob's announcement, got {other:?}"),
    }
}

#[tokio::test]
async fn test_flood_reaches_all_but_sender() {
    let (hub_handle, _hub_peer, port) = start_hub("Host").await;

    let (mut alice_ws, alice) = raw_spoke(port, "Alice").await;
    let (mut bob_ws, _bob) = raw_spoke(port, "Bob").await;

    // Drain onboarding: Hello, Others, scene snapshot (+ Bob's join for Alice).
    for _ in 0..3 {
        let _ = timeout(Duration::from_secs(2), next_frame(&mut bob_ws))
            .await
            .unwrap();
    }
    for _ in 0..4 {
        let _ = timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
            .await
            .unwrap();
    }

    // Alice moves an object.
    let batch = Frame::Batch(vec![Event::Move {
        object: 7,
        x: 12.0,
        y: 34.0,
        state: 1,
        owner: Some(alice),
    }]);
    alice_ws
        .send(Message::Binary(batch.encode().unwrap().into()))
        .await
        .unwrap();

    // Bob receives it verbatim.
    match timeout(Duration::from_secs(2), next_frame(&mut bob_ws))
        .await
        .unwrap()
    {
        Frame::Batch(events) => {
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], Event::Move { object: 7, .. }));
        }
        other => panic!("Expected relayed batch, got {other:?}"),
    }

    // The hub applied it.
    eventually(
        || async {
            hub_handle
                .objects()
                .await
                .unwrap()
                .iter()
                .any(|(id, pose)| *id == 7 && pose.x == 12.0)
        },
        "hub to apply Alice's move",
    )
    .await;

    // Nothing came back to Alice.
    let echo = timeout(Duration::from_millis(200), next_frame(&mut alice_ws)).await;
    assert!(echo.is_err(), "Alice must not receive her own batch");
}

#[tokio::test]
async fn test_abrupt_disconnect_broadcasts_gone() {
    let (hub_handle, hub_peer, port) = start_hub("Host").await;

    let (mut alice_ws, alice) = raw_spoke(port, "Alice").await;
    let (bob_ws, bob) = raw_spoke(port, "Bob").await;

    eventually(
        || async { hub_handle.users().await.unwrap().len() == 3 },
        "hub registry to reach {Host, Alice, Bob}",
    )
    .await;

    // Drain Alice's onboarding and Bob's announcement.
    for _ in 0..4 {
        let _ = timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
            .await
            .unwrap();
    }

    // Bob vanishes without a goodbye.
    drop(bob_ws);

    // The hub evicts him and tells Alice.
    eventually(
        || async {
            let ids: Vec<Uuid> = hub_handle
                .users()
                .await
                .unwrap()
                .iter()
                .map(|u| u.id)
                .collect();
            ids == vec![hub_peer, alice]
        },
        "hub registry to return to {Host, Alice}",
    )
    .await;

    match timeout(Duration::from_secs(2), next_frame(&mut alice_ws))
        .await
        .unwrap()
    {
        Frame::Batch(events) => assert_eq!(events, vec![Event::Gone { peer: bob }]),
        other => panic!("Expected Gone for Bob, got {other:?}"),
    }
}

#[tokio::test]
async fn test_spoke_session_converges_both_ways() {
    let (hub_handle, hub_peer, port) = start_hub("Host").await;

    let config = SyncConfig::spoke(format!("ws://127.0.0.1:{port}"), "Guest");
    let session = Session::new(config, Arc::new(StubCapability));
    let spoke_handle = session.handle();
    let spoke_peer = session.local_peer();
    tokio::spawn(async move {
        let _ = session.run().await;
    });

    // Presence converges on both sides.
    eventually(
        || async {
            let ids: Vec<Uuid> = hub_handle
                .users()
                .await
                .unwrap()
                .iter()
                .map(|u| u.id)
                .collect();
            ids.contains(&spoke_peer) && ids.len() == 2
        },
        "hub to register the spoke",
    )
    .await;
    eventually(
        || async {
            let ids: Vec<Uuid> = spoke_handle
                .users()
                .await
                .unwrap()
                .iter()
                .map(|u| u.id)
                .collect();
            ids.contains(&hub_peer) && ids.len() == 2
        },
        "spoke to register the hub",
    )
    .await;

    // A spoke-side move intent travels through batcher and upstream link.
    spoke_handle
        .move_object(3, 1.5, 2.5, 0, Some(spoke_peer))
        .await
        .unwrap();
    eventually(
        || async {
            hub_handle
                .objects()
                .await
                .unwrap()
                .iter()
                .any(|(id, pose)| *id == 3 && pose.y == 2.5)
        },
        "hub to apply the spoke's move",
    )
    .await;

    // A hub-side move intent floods down to the spoke.
    hub_handle.move_object(4, 9.0, 9.0, 1, None).await.unwrap();
    eventually(
        || async {
            spoke_handle
                .objects()
                .await
                .unwrap()
                .iter()
                .any(|(id, pose)| *id == 4 && pose.state == 1)
        },
        "spoke to apply the hub's move",
    )
    .await;
}

#[tokio::test]
async fn test_spoke_calls_listed_peers_for_media() {
    let (_hub_handle, hub_peer, port) = start_hub("Host").await;

    let config = SyncConfig::spoke(format!("ws://127.0.0.1:{port}"), "Guest");
    let session = Session::new(config, Arc::new(StubCapability));
    let spoke_handle = session.handle();
    tokio::spawn(async move {
        let _ = session.run().await;
    });

    // The hub is in the spoke's Others snapshot, so the spoke dials it
    // and the resulting stream lands in the directory.
    eventually(
        || async {
            spoke_handle
                .streams()
                .await
                .unwrap()
                .iter()
                .any(|s| s.peer == hub_peer)
        },
        "spoke to associate a stream with the hub",
    )
    .await;
}

#[tokio::test]
async fn test_accept_call_associates_stream() {
    let (hub_handle, _hub_peer, port) = start_hub("Host").await;
    let (_alice_ws, alice) = raw_spoke(port, "Alice").await;

    eventually(
        || async { hub_handle.users().await.unwrap().len() == 2 },
        "hub to register Alice",
    )
    .await;

    // An inbound call was accepted outside the core; hand the remote
    // stream to the session.
    hub_handle
        .accept_call(MediaStream::new(alice))
        .await
        .unwrap();

    eventually(
        || async {
            hub_handle
                .streams()
                .await
                .unwrap()
                .iter()
                .any(|s| s.peer == alice)
        },
        "hub to associate Alice's stream",
    )
    .await;

    // The call ends; Alice stays in presence, just without media.
    hub_handle.end_call(alice).await.unwrap();
    eventually(
        || async { hub_handle.streams().await.unwrap().is_empty() },
        "hub to drop Alice's stream",
    )
    .await;
    assert_eq!(hub_handle.users().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_spoke_retries_until_hub_appears() {
    let port = free_port().await;

    // Spoke starts first; nothing is listening yet.
    let mut config = SyncConfig::spoke(format!("ws://127.0.0.1:{port}"), "Early Bird");
    config.reconnect_delay = Duration::from_millis(50);
    let session = Session::new(config, Arc::new(StubCapability));
    let spoke_handle = session.handle();
    let spoke_peer = session.local_peer();
    let errors = session.errors();
    tokio::spawn(async move {
        let _ = session.run().await;
    });

    // Let a few attempts fail.
    sleep(Duration::from_millis(200)).await;
    assert!(!errors.is_empty(), "failed dials are reported");

    // The hub finally shows up on the same port.
    let config = SyncConfig::hub(format!("127.0.0.1:{port}"), "Late Host");
    let hub = Session::new(config, Arc::new(StubCapability));
    let hub_handle = hub.handle();
    tokio::spawn(async move {
        hub.run().await.unwrap();
    });

    // The retry loop finds it without any external nudge.
    eventually(
        || async {
            hub_handle
                .users()
                .await
                .unwrap()
                .iter()
                .any(|u| u.id == spoke_peer)
        },
        "spoke to reach the late hub",
    )
    .await;
    eventually(
        || async { spoke_handle.users().await.unwrap().len() == 2 },
        "spoke registry to converge after retry",
    )
    .await;
}

#[tokio::test]
async fn test_batched_drag_arrives_in_order() {
    let (hub_handle, _hub_peer, port) = start_hub("Host").await;

    let config = SyncConfig::spoke(format!("ws://127.0.0.1:{port}"), "Dragger");
    let session = Session::new(config, Arc::new(StubCapability));
    let spoke_handle = session.handle();
    tokio::spawn(async move {
        let _ = session.run().await;
    });

    eventually(
        || async { hub_handle.users().await.unwrap().len() == 2 },
        "spoke to join before dragging",
    )
    .await;

    // A drag burst recorded within one tick: the last sample must win.
    for i in 0..10 {
        spoke_handle
            .move_object(1, i as f32, 0.0, 0, None)
            .await
            .unwrap();
    }

    eventually(
        || async {
            hub_handle
                .objects()
                .await
                .unwrap()
                .iter()
                .any(|(id, pose)| *id == 1 && pose.x == 9.0)
        },
        "hub to end on the final drag sample",
    )
    .await;
}
