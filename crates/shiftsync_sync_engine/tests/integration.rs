//! Integration tests for the sync engine against the reference server.

use shiftsync_core::{MergeRuleRegistry, Replica, ReplicaConfig};
use shiftsync_protocol::{
    ActorId, DeviceId, EntityId, EntityType, FieldPath, OpKind, OpValue, PushRequest,
    RejectReason, Record,
};
use shiftsync_sync_engine::{
    HttpTransport, LoopbackClient, SyncConfig, SyncEngine, SyncError, SyncState, SyncTransport,
};
use shiftsync_sync_server::{ServerConfig, SyncServer};
use std::sync::Arc;

type Transport = HttpTransport<LoopbackClient<Arc<SyncServer>>>;

fn replica(device: &str) -> Arc<Replica> {
    let config = ReplicaConfig::new(
        DeviceId::new(device).unwrap(),
        ActorId::new(format!("{device}-crew")).unwrap(),
    );
    Arc::new(Replica::in_memory(config, Arc::new(MergeRuleRegistry::standard().unwrap())).unwrap())
}

fn engine(server: &Arc<SyncServer>, replica: &Arc<Replica>) -> SyncEngine<Transport, Replica> {
    let config = SyncConfig::new(replica.device_id().clone());
    let transport = HttpTransport::new(
        "loopback://authority",
        LoopbackClient::new(Arc::clone(server)),
    );
    SyncEngine::new(config, transport, Arc::clone(replica))
}

fn shift() -> EntityId {
    EntityId::new("shift-2024-06-01-A").unwrap()
}

fn open_shift(replica: &Replica) {
    let mut seed = Record::new();
    seed.insert("status".into(), OpValue::text("OPEN"));
    replica
        .record(EntityType::Shift, shift(), OpKind::Create, None, Some(OpValue::Record(seed)))
        .unwrap();
}

fn set(replica: &Replica, path: &str, value: &str) {
    replica
        .record(
            EntityType::Shift,
            shift(),
            OpKind::Update,
            Some(FieldPath::parse(path).unwrap()),
            Some(OpValue::text(value)),
        )
        .unwrap();
}

#[tokio::test]
async fn client_server_full_sync() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
    let tablet = replica("tablet-a");
    open_shift(&tablet);
    set(&tablet, "supervisor", "m.okafor");

    let engine = engine(&server, &tablet);
    let result = engine.sync().await.unwrap();

    assert_eq!(result.pushed, 2);
    assert_eq!(engine.state(), SyncState::Synced);
    assert_eq!(server.operation_count(), 2);
    assert_eq!(tablet.sync_status().unwrap().pending_ops, 0);
    // Own operations come back on the pull and are recognised.
    assert_eq!(tablet.stats().unwrap().operations, 2);
    server.oplog().verify().unwrap();
}

#[tokio::test]
async fn two_devices_converge() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
    let a = replica("tablet-a");
    let b = replica("tablet-b");
    let engine_a = engine(&server, &a);
    let engine_b = engine(&server, &b);

    open_shift(&a);
    engine_a.sync().await.unwrap();
    engine_b.sync().await.unwrap();
    assert!(b.get_entity(EntityType::Shift, &shift()).unwrap().created);

    // Concurrent edits while both are offline.
    set(&a, "supervisor", "m.okafor");
    set(&b, "notes.handover", "conveyor 4 tripped twice");

    engine_a.sync().await.unwrap();
    engine_b.sync().await.unwrap();
    engine_a.sync().await.unwrap();

    let on_a = a.get_entity(EntityType::Shift, &shift()).unwrap();
    let on_b = b.get_entity(EntityType::Shift, &shift()).unwrap();
    assert_eq!(on_a.state, on_b.state);
    assert_eq!(on_a.version, 3);
    assert_eq!(on_a.state.get("supervisor"), Some(&OpValue::text("m.okafor")));
    assert_eq!(server.operation_count(), 3);
}

#[tokio::test]
async fn tampered_operation_splits_the_push() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
    let tablet = replica("tablet-a");
    open_shift(&tablet);
    for i in 0..9 {
        set(&tablet, "notes.log", &format!("entry {i}"));
    }
    let mut ops = tablet.pending_push(10);
    assert_eq!(ops.len(), 10);
    ops[4].client_timestamp += 1;

    let transport = HttpTransport::new("loopback://authority", LoopbackClient::new(Arc::clone(&server)));
    let response = transport
        .push(&PushRequest {
            device_id: tablet.device_id().clone(),
            ops: ops.clone(),
        })
        .await
        .unwrap();

    let first_four: Vec<_> = ops[..4].iter().map(|op| op.op_id).collect();
    assert_eq!(response.accepted, first_four);
    assert_eq!(response.rejected.len(), 6);
    assert_eq!(response.rejected[0].reason, RejectReason::HashMismatch);
    for rejected in &response.rejected[1..] {
        assert_eq!(
            rejected.reason,
            RejectReason::AfterBrokenLink {
                first_rejected: ops[4].op_id
            }
        );
    }
    assert_eq!(server.operation_count(), 4);

    // The untouched operations still go through once the device pushes its
    // real chain.
    let engine = engine(&server, &tablet);
    assert_eq!(engine.push_pending().await.unwrap(), 10);
    assert_eq!(server.operation_count(), 10);
}

#[tokio::test]
async fn offline_device_keeps_its_work() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
    let tablet = replica("tablet-a");
    open_shift(&tablet);
    let engine = engine(&server, &tablet);

    let client = LoopbackClient::new(Arc::clone(&server));
    client.set_online(false);
    let offline = SyncEngine::new(
        SyncConfig::new(tablet.device_id().clone()),
        HttpTransport::new("loopback://authority", client),
        Arc::clone(&tablet),
    );

    let err = offline.sync().await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(offline.state(), SyncState::Error);
    assert_eq!(tablet.sync_status().unwrap().pending_ops, 1);
    assert!(offline.transport().last_error().is_some());

    engine.sync().await.unwrap();
    assert_eq!(tablet.sync_status().unwrap().pending_ops, 0);
}

#[tokio::test]
async fn pull_pages_through_a_small_server_batch() {
    let server = Arc::new(SyncServer::new(ServerConfig::default().with_max_pull_batch(2)).unwrap());
    let a = replica("tablet-a");
    open_shift(&a);
    for i in 0..4 {
        set(&a, "notes.log", &format!("entry {i}"));
    }
    engine(&server, &a).push_pending().await.unwrap();

    let b = replica("tablet-b");
    let engine_b = engine(&server, &b);
    assert_eq!(engine_b.pull_entity(EntityType::Shift).await.unwrap(), 5);

    let cursor = b.cursor(EntityType::Shift);
    assert_eq!(cursor.position, 5);
    assert_eq!(
        a.get_entity(EntityType::Shift, &shift()).unwrap().state,
        b.get_entity(EntityType::Shift, &shift()).unwrap().state
    );

    // Nothing new: the cursor stays put.
    assert_eq!(engine_b.pull_entity(EntityType::Shift).await.unwrap(), 0);
    assert_eq!(b.cursor(EntityType::Shift), cursor);
}

#[tokio::test]
async fn version_mismatch_is_not_retried() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()).unwrap());
    let tablet = replica("tablet-a");
    let mut config = SyncConfig::new(tablet.device_id().clone());
    config.protocol_version += 1;
    let engine = SyncEngine::new(
        config,
        HttpTransport::new("loopback://authority", LoopbackClient::new(Arc::clone(&server))),
        Arc::clone(&tablet),
    );

    let err = engine.sync_with_retry().await.unwrap_err();
    assert!(matches!(err, SyncError::VersionMismatch { .. }));
    assert_eq!(engine.stats().retries, 0);
}
