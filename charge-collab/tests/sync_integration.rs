//! End-to-end sync through a real server and real WebSocket clients.

use std::time::Duration;

use charge_collab::client::{ConnectionState, SyncEvent};
use charge_collab::protocol::{MessageType, PeerInfo, SyncMessage};
use charge_collab::server::{ServerConfig, SyncServer};
use charge_collab::session::{RoomSession, SessionConfig};
use charge_core::{patch, CharacterInput, ClockInput, Notice};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

async fn start_test_server(max_peers: usize) -> (SyncServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: max_peers,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
        storage_path: None,
    })
    .unwrap();
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run_on(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn open(url: &str, world_id: Uuid, user: &str) -> RoomSession {
    let session = RoomSession::open(world_id, SessionConfig::new(url, user))
        .await
        .unwrap();
    timeout(Duration::from_secs(2), session.wait_loaded())
        .await
        .expect("first snapshot")
        .unwrap();
    session
}

/// Wait until `check` holds, polling.
async fn eventually<F: Fn() -> bool>(check: F) {
    timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_matching<F: Fn(&SyncEvent) -> bool>(rx: &mut mpsc::Receiver<SyncEvent>, pred: F) -> SyncEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

#[tokio::test]
async fn test_session_connects_and_loads() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let session = open(&url, world_id, "alice").await;

    assert_eq!(session.connection_state().await, ConnectionState::Connected);
    assert_eq!(server.room_count().await, 1);
    assert_eq!(server.stats().await.active_connections, 1);
    session.close().await;
}

#[tokio::test]
async fn test_edit_reaches_other_session_and_server() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let owner = open(&url, world_id, "owner").await;
    server.memberships().add_player(world_id, "bob").await.unwrap();
    let bob = open(&url, world_id, "bob").await;

    let created = owner
        .collections()
        .characters
        .create(CharacterInput {
            name: Some("Vex".into()),
            ..CharacterInput::default()
        })
        .unwrap();

    eventually(|| bob.collections().characters.item(&created.id).is_some()).await;
    eventually(|| owner.replica().pending_len() == 0).await;

    bob.collections()
        .characters
        .update(&created.id, &patch(json!({ "stress": 2 })))
        .unwrap();
    eventually(|| {
        owner
            .collections()
            .characters
            .item(&created.id)
            .is_some_and(|c| c.value.stress == 2)
    })
    .await;

    let json = server.world_json(world_id).await.unwrap();
    assert_eq!(json["characters"][&created.id]["name"], "Vex");
    assert_eq!(json["characters"][&created.id]["stress"], 2);
}

#[tokio::test]
async fn test_late_joiner_receives_existing_state() {
    let (_server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let owner = open(&url, world_id, "owner").await;
    owner
        .collections()
        .clocks
        .append(ClockInput {
            name: Some("Heat".into()),
            ..ClockInput::default()
        })
        .unwrap();
    eventually(|| owner.replica().pending_len() == 0).await;

    let late = open(&url, world_id, "carol").await;
    let clocks = late.collections().clocks.items();
    assert_eq!(clocks.len(), 1);
    assert_eq!(clocks[0].name, "Heat");
}

#[tokio::test]
async fn test_spectator_edit_rejected_with_notice() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let _owner = open(&url, world_id, "owner").await;
    let mut watcher = open(&url, world_id, "watcher").await;
    let mut events = watcher.take_events().unwrap();

    let notices = std::sync::Arc::new(std::sync::Mutex::new(Vec::<Notice>::new()));
    let sink = notices.clone();
    watcher
        .signals()
        .notices
        .subscribe(move |n| sink.lock().unwrap().push(n.clone()))
        .detach();

    watcher.collections().clocks.append(ClockInput::default()).unwrap();
    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::Rejected { .. })).await;
    assert!(matches!(event, SyncEvent::Rejected { .. }));
    assert_eq!(watcher.replica().pending_len(), 0);
    assert_eq!(notices.lock().unwrap().len(), 1);

    assert_eq!(server.stats().await.rejected_deltas, 1);
    let json = server.world_json(world_id).await.unwrap();
    assert!(json.get("clocks").is_none());
}

#[tokio::test]
async fn test_offline_edits_resent_on_reconnect() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let mut owner = open(&url, world_id, "owner").await;
    let mut events = owner.take_events().unwrap();

    owner.disconnect().await;
    assert_eq!(owner.connection_state().await, ConnectionState::Disconnected);
    owner.collections().clocks.append(ClockInput::default()).unwrap();
    assert_eq!(owner.replica().pending_len(), 1);

    owner.reconnect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::Acked(_))).await;
    eventually(|| owner.replica().pending_len() == 0).await;

    let json = server.world_json(world_id).await.unwrap();
    assert_eq!(json["clocks"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_offline_edits_beyond_pending_capacity_reach_server() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let config = SessionConfig {
        pending_capacity: 2,
        ..SessionConfig::new(&url, "owner")
    };
    let mut owner = RoomSession::open(world_id, config).await.unwrap();
    timeout(Duration::from_secs(2), owner.wait_loaded())
        .await
        .expect("first snapshot")
        .unwrap();

    owner.disconnect().await;
    for name in ["one", "two", "three", "four"] {
        owner
            .collections()
            .clocks
            .append(ClockInput {
                name: Some(name.into()),
                ..ClockInput::default()
            })
            .unwrap();
    }
    assert_eq!(owner.replica().pending_len(), 2);

    owner.reconnect().await.unwrap();
    eventually(|| owner.replica().pending_len() == 0).await;

    let json = server.world_json(world_id).await.unwrap();
    let names: Vec<&str> = json["clocks"]
        .as_array()
        .map(|clocks| clocks.iter().filter_map(|c| c["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["one", "two", "three", "four"]);
}

#[tokio::test]
async fn test_room_full_refuses_join() {
    let (_server, url) = start_test_server(1).await;
    let world_id = Uuid::new_v4();
    let _first = open(&url, world_id, "owner").await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let join = SyncMessage::peer_joined(world_id, &PeerInfo::new("bob", "Bob")).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let bytes = match reply {
        Message::Binary(bytes) => bytes,
        other => panic!("expected a binary refusal, got {other:?}"),
    };
    let msg = SyncMessage::decode(&bytes).unwrap();
    assert_eq!(msg.msg_type, MessageType::Rejected);
    assert_eq!(msg.reason().unwrap(), "room is full");
}

#[tokio::test]
async fn test_room_closes_when_last_peer_leaves() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let session = open(&url, world_id, "owner").await;
    assert_eq!(server.room_count().await, 1);

    session.close().await;
    timeout(Duration::from_secs(3), async {
        while server.room_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room should close");
}

#[tokio::test]
async fn test_sse_hub_hears_accepted_edits() {
    let (server, url) = start_test_server(10).await;
    let world_id = Uuid::new_v4();
    let mut listener = server.hub().subscribe(world_id, "someone-else");
    let owner = open(&url, world_id, "owner").await;

    owner.collections().clocks.append(ClockInput::default()).unwrap();
    let event = timeout(Duration::from_secs(2), listener.recv()).await.unwrap().unwrap();
    assert_eq!(event.source_user_id(), "owner");
}
