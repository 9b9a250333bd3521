//! Persistence through the full server stack.
//!
//! Verifies:
//! - Snapshot on room close, with deltas compacted away
//! - Restart recovery from snapshot plus trailing deltas
//! - Memberships survive a restart
//! - Worlds stay isolated on disk

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use charge_collab::room::Replica;
use charge_collab::server::{ServerConfig, SyncServer};
use charge_collab::session::{RoomSession, SessionConfig};
use charge_collab::storage::{RoomStore, StoreConfig};
use charge_collab::world::WorldCollections;
use charge_core::{patch, CharacterInput, ClockInput, Role, RoomSignals};
use serde_json::json;
use tempfile::tempdir;
use tokio::runtime::Runtime;
use tokio::time::timeout;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start(path: &Path) -> (SyncServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: Some(path.to_path_buf()),
        ..ServerConfig::default()
    })
    .unwrap();
    server.recover().await.unwrap();
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
        .unwrap()
        .unwrap();
    session
}

async fn settled(session: &RoomSession) {
    timeout(Duration::from_secs(3), async {
        while session.replica().pending_len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edits were not acknowledged");
}

async fn room_closed(server: &SyncServer) {
    timeout(Duration::from_secs(3), async {
        while server.room_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room did not close");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_writes_snapshot_and_compacts() {
    let dir = tempdir().unwrap();
    let (server, url) = start(&dir.path().join("db")).await;
    let world_id = Uuid::new_v4();

    let session = open(&url, world_id, "owner").await;
    for _ in 0..3 {
        session.collections().clocks.append(ClockInput::default()).unwrap();
    }
    settled(&session).await;

    let store = server.store().unwrap().clone();
    assert_eq!(store.load_deltas_since(world_id, 0).unwrap().len(), 3);

    session.close().await;
    room_closed(&server).await;

    assert!(store.load_deltas_since(world_id, 0).unwrap().is_empty());
    let meta = store.load_metadata(world_id).unwrap().unwrap();
    assert_eq!(meta.snapshot_version, 3);
    assert_eq!(meta.delta_count, 0);

    let replica = Replica::from_state(world_id, &store.load_snapshot(world_id).unwrap()).unwrap();
    assert_eq!(replica.to_json()["clocks"].as_array().map(Vec::len), Some(3));
    assert_eq!(server.stats().await.persisted_snapshots, 1);
}

#[test]
fn test_restart_recovers_snapshot_and_trailing_deltas() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let world_id = Uuid::new_v4();

    let rt = Runtime::new().unwrap();
    let character_id = rt.block_on(async {
        let (server, url) = start(&path).await;

        let first = open(&url, world_id, "owner").await;
        let created = first
            .collections()
            .characters
            .create(CharacterInput {
                name: Some("Vex".into()),
                ..CharacterInput::default()
            })
            .unwrap();
        settled(&first).await;
        first.close().await;
        room_closed(&server).await;

        // Edited after the snapshot and never closed: lives only as a delta.
        let second = open(&url, world_id, "owner").await;
        second
            .collections()
            .characters
            .update(&created.id, &patch(json!({ "stress": 3 })))
            .unwrap();
        settled(&second).await;
        created.id
    });
    drop(rt);

    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let (server, _url) = start(&path).await;
        assert_eq!(server.room_count().await, 1);

        let json = server.world_json(world_id).await.unwrap();
        assert_eq!(json["characters"][&character_id]["name"], "Vex");
        assert_eq!(json["characters"][&character_id]["stress"], 3);

        let memberships = server.memberships();
        assert_eq!(memberships.role_of(world_id, "owner").await.unwrap(), Role::Owner);
        assert_eq!(
            memberships.ensure_membership(world_id, "newcomer").await.unwrap(),
            Role::Spectator
        );
    });
}

#[test]
fn test_worlds_isolated_on_disk() {
    let dir = tempdir().unwrap();
    let store = RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let writer = Arc::new(Replica::new(a));
    let mut outbox = writer.take_outbox().unwrap();
    let world = WorldCollections::new(writer, &RoomSignals::new());
    world.clocks.append(ClockInput::default()).unwrap();
    let op = outbox.try_recv().unwrap();

    assert_eq!(store.append_delta(a, &op.update).unwrap(), 1);
    assert_eq!(store.append_delta(b, &op.update).unwrap(), 1);
    assert_eq!(store.append_delta(a, &op.update).unwrap(), 2);

    store.compact_deltas(a, 2).unwrap();
    assert!(store.load_deltas_since(a, 0).unwrap().is_empty());
    assert_eq!(store.load_deltas_since(b, 0).unwrap().len(), 1);

    let mut worlds = store.list_worlds().unwrap();
    worlds.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(worlds, expected);
}
