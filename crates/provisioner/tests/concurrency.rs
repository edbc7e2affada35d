//! Concurrent registrations against a pool one address short, and
//! lifecycle operations racing on the same peer.
//!
//! Runs both inside one engine and across two engines opened on the same
//! database file, the way two provisioner processes would share a store.

use async_trait::async_trait;
use meshprov_common::{generate_key_pair, Caller, Database, Error, PeerState, Result};
use meshprov_provisioner::config::{LiveBackend, OverlayConfig};
use meshprov_provisioner::reconciler::{MemoryPeerTable, MemorySnapshot};
use meshprov_provisioner::{
    AddressPool, DeviceConfigRenderer, LivePeer, LivePeerTable, PeerStore, PeerTableReconciler,
    ProvisionerConfig, ProvisioningEngine, ReachabilityProbe,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// /29 from offset 1 holds six addresses
const POOL: &str = "10.10.10.0/29";
const CAPACITY: usize = 6;

fn config(store: &std::path::Path) -> ProvisionerConfig {
    let mut config = ProvisionerConfig::default();
    config.store_path = store.to_path_buf();
    config.pool.cidr = POOL.to_string();
    config.pool.reserved_low = 1;
    config.live.backend = LiveBackend::Memory;
    config.overlay.server_public_key = Some(generate_key_pair().unwrap().public_key);
    config
}

fn check(results: Vec<Result<Ipv4Addr>>) {
    let mut addresses = HashSet::new();
    let mut exhausted = 0;
    for result in results {
        match result {
            Ok(addr) => assert!(addresses.insert(addr), "address {} handed out twice", addr),
            Err(Error::PoolExhausted { .. }) => exhausted += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(addresses.len(), CAPACITY);
    assert!(exhausted >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_in_one_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ProvisioningEngine::from_config(&config(dir.path())).unwrap());

    let mut handles = Vec::new();
    for i in 0..=CAPACITY {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .register(&Caller::admin("ops"), &format!("02:00:00:00:01:{:02x}", i), None)
                .await
                .map(|reg| reg.peer.internal_address)
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    check(results);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_across_two_handles() {
    let dir = tempfile::tempdir().unwrap();
    let first = Arc::new(ProvisioningEngine::from_config(&config(dir.path())).unwrap());
    let second = Arc::new(ProvisioningEngine::from_config(&config(dir.path())).unwrap());

    let mut handles = Vec::new();
    for i in 0..=CAPACITY {
        let engine = if i % 2 == 0 { first.clone() } else { second.clone() };
        handles.push(tokio::spawn(async move {
            engine
                .register(&Caller::admin("ops"), &format!("02:00:00:00:02:{:02x}", i), None)
                .await
                .map(|reg| reg.peer.internal_address)
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    check(results);

    // Both handles see the same six records
    assert_eq!(first.store().count().unwrap(), CAPACITY);
    assert_eq!(second.store().count().unwrap(), CAPACITY);
}

#[tokio::test]
async fn same_hardware_id_across_handles_registers_once() {
    let dir = tempfile::tempdir().unwrap();
    let first = ProvisioningEngine::from_config(&config(dir.path())).unwrap();
    let second = ProvisioningEngine::from_config(&config(dir.path())).unwrap();
    let admin = Caller::admin("ops");

    let (a, b) = tokio::join!(
        first.register(&admin, "AA:BB:CC:DD:EE:FF", None),
        second.register(&admin, "aa:bb:cc:dd:ee:ff", None),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    assert_eq!(first.store().count().unwrap(), 1);
}

const SLOW: Duration = Duration::from_millis(300);
const HEAD_START: Duration = Duration::from_millis(50);

/// Takes its answer from the table when asked, returns it after `SLOW`
struct SlowProbe(Arc<MemoryPeerTable>);

#[async_trait]
impl ReachabilityProbe for SlowProbe {
    async fn probe(&self, address: Ipv4Addr) -> bool {
        let reachable = self.0.probe(address).await;
        tokio::time::sleep(SLOW).await;
        reachable
    }
}

/// Live table whose adds land after `SLOW`
struct SlowAddTable(Arc<MemoryPeerTable>);

#[async_trait]
impl LivePeerTable for SlowAddTable {
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        tokio::time::sleep(SLOW).await;
        self.0.add_peer(public_key, address).await
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.0.remove_peer(public_key).await
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>> {
        self.0.list_peers().await
    }
}

fn engine_over(
    db: Database,
    table: Arc<dyn LivePeerTable>,
    probe: Arc<dyn ReachabilityProbe>,
) -> Arc<ProvisioningEngine> {
    Arc::new(ProvisioningEngine::new(
        PeerStore::open(db).unwrap(),
        AddressPool::new("10.10.10.0/24", 10).unwrap(),
        PeerTableReconciler::new(table, Arc::new(MemorySnapshot::new()), probe),
        DeviceConfigRenderer::with_server_key(
            &OverlayConfig::default(),
            generate_key_pair().unwrap().public_key,
        ),
    ))
}

/// Start `test` on `tester`, then disable the same peer through `disabler`
/// while the reachability check is still out
async fn race_test_against_disable(
    tester: Arc<ProvisioningEngine>,
    disabler: Arc<ProvisioningEngine>,
    table: Arc<MemoryPeerTable>,
) {
    let admin = Caller::admin("ops");
    let reg = disabler.register(&admin, "02:00:00:00:03:01", None).await.unwrap();
    let id = reg.peer.id;
    table.set_online(reg.peer.internal_address, true);

    let probing = tokio::spawn(async move { tester.test(&Caller::admin("ops"), id).await });
    tokio::time::sleep(HEAD_START).await;
    let change = disabler.disable(&admin, id).await.unwrap();
    assert_eq!(change.peer.state, PeerState::Disabled);

    let outcome = probing.await.unwrap().unwrap();
    assert!(outcome.reachable);

    let stored = disabler.get(&admin, id).await.unwrap();
    assert_eq!(stored.state, PeerState::Disabled);
    assert!(!table.contains(&reg.peer.public_key));
}

#[tokio::test]
async fn reachability_check_racing_disable_in_one_engine_ends_disabled() {
    let table = Arc::new(MemoryPeerTable::new());
    let engine = engine_over(
        Database::open_memory().unwrap(),
        table.clone(),
        Arc::new(SlowProbe(table.clone())),
    );
    race_test_against_disable(engine.clone(), engine, table).await;
}

#[tokio::test]
async fn reachability_check_racing_disable_across_handles_ends_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.db");
    let table = Arc::new(MemoryPeerTable::new());

    let tester = engine_over(
        Database::open(&path).unwrap(),
        table.clone(),
        Arc::new(SlowProbe(table.clone())),
    );
    let disabler = engine_over(Database::open(&path).unwrap(), table.clone(), table.clone());
    race_test_against_disable(tester, disabler, table).await;
}

#[tokio::test]
async fn enable_racing_remove_in_one_engine_leaves_no_live_entry() {
    let admin = Caller::admin("ops");
    let table = Arc::new(MemoryPeerTable::new());
    let engine = engine_over(
        Database::open_memory().unwrap(),
        Arc::new(SlowAddTable(table.clone())),
        table.clone(),
    );
    let reg = engine.register(&admin, "02:00:00:00:04:01", None).await.unwrap();
    let id = reg.peer.id;

    let enabling = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.enable(&Caller::admin("ops"), id).await })
    };
    tokio::time::sleep(HEAD_START).await;
    engine.remove(&admin, id).await.unwrap();

    // Enable held the peer first and finished; remove ran after it
    let change = enabling.await.unwrap().unwrap();
    assert_eq!(change.peer.state, PeerState::Active);

    assert!(engine.store().get_by_id(id).unwrap().is_none());
    assert!(!table.contains(&reg.peer.public_key));
}

#[tokio::test]
async fn enable_racing_remove_across_handles_withdraws_live_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.db");
    let admin = Caller::admin("ops");
    let table = Arc::new(MemoryPeerTable::new());

    let enabler = engine_over(
        Database::open(&path).unwrap(),
        Arc::new(SlowAddTable(table.clone())),
        table.clone(),
    );
    let remover = engine_over(Database::open(&path).unwrap(), table.clone(), table.clone());

    let reg = remover.register(&admin, "02:00:00:00:04:02", None).await.unwrap();
    let id = reg.peer.id;
    assert!(table.contains(&reg.peer.public_key));

    let enabling = {
        let enabler = enabler.clone();
        tokio::spawn(async move { enabler.enable(&Caller::admin("ops"), id).await })
    };
    tokio::time::sleep(HEAD_START).await;
    remover.remove(&admin, id).await.unwrap();

    let result = enabling.await.unwrap();
    assert!(matches!(result, Err(Error::NotFound { .. })));

    assert!(remover.store().get_by_id(id).unwrap().is_none());
    assert!(!table.contains(&reg.peer.public_key));
}
