//! Peer lifecycle through the provisioning engine, against in-process
//! live table and snapshot doubles.

use meshprov_common::{
    generate_key_pair, public_key_from_private, Caller, Database, Error, PeerFilter, PeerState,
};
use meshprov_provisioner::config::OverlayConfig;
use meshprov_provisioner::reconciler::{LivePeerTable, MemoryPeerTable, MemorySnapshot, PeerSnapshot};
use meshprov_provisioner::{
    AddressPool, DeviceConfigRenderer, LiveOutcome, PeerStore, PeerTableReconciler, ProvisioningEngine,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: ProvisioningEngine,
    table: Arc<MemoryPeerTable>,
    snapshot: Arc<MemorySnapshot>,
}

fn harness() -> Harness {
    let store = PeerStore::open(Database::open_memory().unwrap()).unwrap();
    let table = Arc::new(MemoryPeerTable::new());
    let snapshot = Arc::new(MemorySnapshot::new());
    let reconciler = PeerTableReconciler::new(table.clone(), snapshot.clone(), table.clone())
        .with_snapshot_retries(1)
        .with_retry_backoff(Duration::from_millis(1));

    let engine = ProvisioningEngine::new(
        store,
        AddressPool::new("10.10.10.0/24", 10).unwrap(),
        reconciler,
        DeviceConfigRenderer::with_server_key(
            &OverlayConfig::default(),
            generate_key_pair().unwrap().public_key,
        ),
    );

    Harness {
        engine,
        table,
        snapshot,
    }
}

fn admin() -> Caller {
    Caller::admin("ops")
}

#[tokio::test]
async fn onboarding_scenario() {
    let h = harness();
    let t1 = Caller::tenant("alice", "T1");
    let t2 = Caller::tenant("mallory", "T2");

    h.engine.add_site(&admin(), "S1", "T1", "Head office").await.unwrap();

    let reg = h.engine.register(&t1, "AA:BB:CC:DD:EE:01", Some("T1")).await.unwrap();
    assert_eq!(reg.peer.state, PeerState::Pending);
    assert_eq!(reg.peer.internal_address, Ipv4Addr::new(10, 10, 10, 10));
    assert_eq!(reg.peer.hardware_id, "aa:bb:cc:dd:ee:01");
    assert!(!reg.private_key.is_empty());
    assert!(!reg.peer.public_key.is_empty());
    assert_ne!(reg.private_key, reg.peer.public_key);
    assert_eq!(public_key_from_private(&reg.private_key).unwrap(), reg.peer.public_key);

    let id = reg.peer.id;

    let peer = h.engine.associate(&t1, id, "S1").await.unwrap();
    assert_eq!(peer.state, PeerState::Associated);
    assert_eq!(peer.site_id.as_deref(), Some("S1"));

    let err = h.engine.associate(&t2, id, "S1").await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    // Device never came up
    let outcome = h.engine.test(&t1, id).await.unwrap();
    assert!(!outcome.reachable);
    assert_eq!(outcome.state, PeerState::Associated);

    let change = h.engine.disable(&t1, id).await.unwrap();
    assert!(change.live.is_applied());
    assert_eq!(change.peer.state, PeerState::Disabled);
    assert!(!h.table.contains(&reg.peer.public_key));

    h.engine.remove(&t1, id).await.unwrap();
    assert!(matches!(h.engine.get(&admin(), id).await, Err(Error::NotFound { .. })));
    assert!(h.engine.store().get_by_id(id).unwrap().is_none());
}

#[tokio::test]
async fn duplicate_hardware_id_conflicts_in_any_case() {
    let h = harness();
    h.engine.register(&admin(), "AA:BB:CC:DD:EE:02", None).await.unwrap();

    let err = h
        .engine
        .register(&admin(), "aa:bb:cc:dd:ee:02", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert_eq!(h.engine.store().count().unwrap(), 1);
}

#[tokio::test]
async fn distinct_registrations_get_distinct_addresses() {
    let h = harness();
    let mut seen = std::collections::HashSet::new();
    for i in 0..20 {
        let reg = h
            .engine
            .register(&admin(), &format!("02:00:00:00:00:{:02x}", i), None)
            .await
            .unwrap();
        assert!(seen.insert(reg.peer.internal_address));
    }
}

#[tokio::test]
async fn enable_twice_leaves_one_live_entry() {
    let h = harness();
    let reg = h.engine.register(&admin(), "aa:00:00:00:00:01", None).await.unwrap();

    h.engine.enable(&admin(), reg.peer.id).await.unwrap();
    let change = h.engine.enable(&admin(), reg.peer.id).await.unwrap();
    assert_eq!(change.peer.state, PeerState::Active);

    let live = h.table.list_peers().await.unwrap();
    let entries = live
        .iter()
        .filter(|p| p.public_key == reg.peer.public_key)
        .count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn remove_succeeds_when_live_table_fails() {
    let h = harness();
    let reg = h.engine.register(&admin(), "aa:00:00:00:00:02", None).await.unwrap();

    h.table.set_failing(true);
    h.engine.remove(&admin(), reg.peer.id).await.unwrap();

    assert!(h.engine.store().get_by_id(reg.peer.id).unwrap().is_none());
    // Hardware ID is free again
    h.table.set_failing(false);
    h.engine.register(&admin(), "aa:00:00:00:00:02", None).await.unwrap();
}

#[tokio::test]
async fn disable_then_test_is_never_reachable() {
    let h = harness();
    let reg = h.engine.register(&admin(), "aa:00:00:00:00:03", None).await.unwrap();
    h.table.set_online(reg.peer.internal_address, true);

    let outcome = h.engine.test(&admin(), reg.peer.id).await.unwrap();
    assert!(outcome.reachable);
    assert_eq!(outcome.state, PeerState::Active);
    assert!(outcome.peer.last_seen_at.is_some());

    h.engine.disable(&admin(), reg.peer.id).await.unwrap();
    let outcome = h.engine.test(&admin(), reg.peer.id).await.unwrap();
    assert!(!outcome.reachable);
    assert_eq!(outcome.state, PeerState::Disabled);
}

#[tokio::test]
async fn disable_keeps_address_and_records_live_failure() {
    let h = harness();
    let reg = h.engine.register(&admin(), "aa:00:00:00:00:04", None).await.unwrap();

    h.table.set_failing(true);
    let change = h.engine.disable(&admin(), reg.peer.id).await.unwrap();
    assert!(matches!(change.live, LiveOutcome::Failed(_)));
    assert_eq!(change.peer.state, PeerState::Disabled);
    assert!(change.peer.last_error.is_some());
    h.table.set_failing(false);

    let next = h.engine.register(&admin(), "aa:00:00:00:00:05", None).await.unwrap();
    assert_ne!(next.peer.internal_address, reg.peer.internal_address);
}

#[tokio::test]
async fn snapshot_failure_surfaces_as_partially_applied() {
    let h = harness();
    let reg = h.engine.register(&admin(), "aa:00:00:00:00:06", None).await.unwrap();
    h.engine.disable(&admin(), reg.peer.id).await.unwrap();

    h.snapshot.fail_next_writes(100);
    let change = h.engine.enable(&admin(), reg.peer.id).await.unwrap();

    assert!(matches!(change.live, LiveOutcome::PartiallyApplied(_)));
    assert_eq!(change.peer.state, PeerState::Active);
    assert!(change.peer.last_error.is_some());
    assert!(h.table.contains(&reg.peer.public_key));
}

#[tokio::test]
async fn reconcile_persists_peers_missing_from_snapshot() {
    let h = harness();
    h.snapshot.fail_next_writes(2);

    let reg = h.engine.register(&admin(), "aa:00:00:00:00:08", None).await.unwrap();
    assert!(matches!(reg.live, LiveOutcome::PartiallyApplied(_)));
    assert!(h.table.contains(&reg.peer.public_key));
    assert!(h.snapshot.entries().await.unwrap().is_empty());

    let drift = h.engine.drift(&admin()).await.unwrap();
    assert!(drift.live_is_clean());
    assert_eq!(drift.snapshot_missing.len(), 1);

    let report = h.engine.reconcile(&admin()).await.unwrap();
    assert!(report.errors.is_empty());
    let persisted = h.snapshot.entries().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].public_key, reg.peer.public_key);
    assert_eq!(persisted[0].address, Some(reg.peer.internal_address));

    assert!(h.engine.drift(&admin()).await.unwrap().is_clean());
}

#[tokio::test]
async fn tenant_cannot_touch_other_tenants_peers() {
    let h = harness();
    let reg = h.engine.register(&admin(), "aa:00:00:00:00:07", Some("T1")).await.unwrap();
    let other = Caller::tenant("mallory", "T2");

    for result in [
        h.engine.enable(&other, reg.peer.id).await.map(|_| ()),
        h.engine.disable(&other, reg.peer.id).await.map(|_| ()),
        h.engine.test(&other, reg.peer.id).await.map(|_| ()),
        h.engine.remove(&other, reg.peer.id).await,
    ] {
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    // No side effects
    assert!(h.table.contains(&reg.peer.public_key));
    let mine = h
        .engine
        .list(&Caller::read_only("viewer", "T1"), PeerFilter::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].state, PeerState::Pending);
}
