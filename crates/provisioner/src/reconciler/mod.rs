//! Live peer table reconciliation
//!
//! Keeps two targets in step with the peer store's intent:
//! - the running overlay process's in-memory peer table ([`LivePeerTable`])
//! - the persisted snapshot the overlay reloads on restart ([`PeerSnapshot`])
//!
//! A change counts as applied only once both targets hold it. When the live
//! table changed but the snapshot could not be written (after retries) the
//! result is `PartiallyApplied`, not a plain failure.

pub mod memory;
pub mod probe;
pub mod routeros;
pub mod snapshot;
pub mod wg;

use crate::config::{LiveBackend, ProvisionerConfig};
use async_trait::async_trait;
use meshprov_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use memory::{MemoryPeerTable, MemorySnapshot};
pub use probe::TcpProbe;
pub use routeros::RouterOsTable;
pub use snapshot::FileSnapshot;
pub use wg::WgCommandTable;

/// One entry of the live peer table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePeer {
    pub public_key: String,
    /// Overlay address routed to the peer (`None` when it has no allowed IPs)
    pub address: Option<Ipv4Addr>,
}

impl LivePeer {
    pub fn new(public_key: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            public_key: public_key.into(),
            address: Some(address),
        }
    }
}

/// Control surface of the running overlay process
#[async_trait]
pub trait LivePeerTable: Send + Sync {
    /// Add or update a peer, keyed by public key
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()>;

    /// Remove a peer; absent peers are not an error
    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// Current live entries
    async fn list_peers(&self) -> Result<Vec<LivePeer>>;
}

/// Persisted peer configuration that survives an overlay restart
#[async_trait]
pub trait PeerSnapshot: Send + Sync {
    async fn upsert(&self, public_key: &str, address: Ipv4Addr) -> Result<()>;

    /// Remove an entry; absent entries are not an error
    async fn remove(&self, public_key: &str) -> Result<()>;

    async fn entries(&self) -> Result<Vec<LivePeer>>;
}

/// Bounded liveness check against a peer's overlay address
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Never errors: timeouts and refusals are "unreachable"
    async fn probe(&self, address: Ipv4Addr) -> bool;
}

/// Difference between desired peers and the two targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftReport {
    /// Desired but absent from the live table
    pub missing: Vec<LivePeer>,
    /// Live but not desired
    pub unexpected: Vec<LivePeer>,
    /// Live with a different address than desired
    pub mismatched: Vec<LivePeer>,
    /// Desired but absent from the snapshot, or persisted with another address
    #[serde(default)]
    pub snapshot_missing: Vec<LivePeer>,
    /// Persisted in the snapshot but not desired
    #[serde(default)]
    pub snapshot_unexpected: Vec<LivePeer>,
    /// Per-peer failures while applying a sweep
    pub errors: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.live_is_clean() && self.snapshot_is_clean()
    }

    pub fn live_is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn snapshot_is_clean(&self) -> bool {
        self.snapshot_missing.is_empty() && self.snapshot_unexpected.is_empty()
    }
}

/// Drives the live peer table and snapshot to match the store
pub struct PeerTableReconciler {
    table: Arc<dyn LivePeerTable>,
    snapshot: Arc<dyn PeerSnapshot>,
    probe: Arc<dyn ReachabilityProbe>,
    live_timeout: Duration,
    probe_timeout: Duration,
    snapshot_retries: u32,
    retry_backoff: Duration,
}

impl PeerTableReconciler {
    pub fn new(
        table: Arc<dyn LivePeerTable>,
        snapshot: Arc<dyn PeerSnapshot>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        Self {
            table,
            snapshot,
            probe,
            live_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(1500),
            snapshot_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }

    /// Build the configured backend
    pub fn from_config(config: &ProvisionerConfig) -> Result<Self> {
        let table: Arc<dyn LivePeerTable> = match config.live.backend {
            LiveBackend::Wg => Arc::new(WgCommandTable::new(
                &config.live.wg_binary,
                &config.overlay.interface,
            )),
            LiveBackend::Routeros => Arc::new(RouterOsTable::new(
                &config.live.routeros,
                config.timeouts.live(),
            )?),
            LiveBackend::Memory => Arc::new(MemoryPeerTable::new()),
        };
        let snapshot: Arc<dyn PeerSnapshot> = match config.live.backend {
            LiveBackend::Memory => Arc::new(MemorySnapshot::new()),
            _ => Arc::new(FileSnapshot::new(config.snapshot_path())),
        };
        let probe = Arc::new(TcpProbe::new(config.probe.port, config.probe.timeout()));

        info!("Live peer table backend: {:?}", config.live.backend);

        Ok(Self::new(table, snapshot, probe)
            .with_live_timeout(config.timeouts.live())
            .with_probe_timeout(config.probe.timeout())
            .with_snapshot_retries(config.live.snapshot_retries))
    }

    pub fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_timeout = timeout;
        self
    }

    /// Outer bound around the probe, on top of the probe's own timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_snapshot_retries(mut self, retries: u32) -> Self {
        self.snapshot_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Add (or update) the live entry, then persist it.
    pub async fn add_live_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        self.bounded_live("live add", self.table.add_peer(public_key, address))
            .await?;
        debug!("Live peer {} -> {}", public_key, address);

        self.persist("snapshot upsert", || self.snapshot.upsert(public_key, address))
            .await
    }

    /// Remove the live entry, then drop it from the snapshot.
    ///
    /// A peer missing from the live table counts as removed.
    pub async fn remove_live_peer(&self, public_key: &str) -> Result<()> {
        if let Err(e) = self.bounded_live("live remove", self.table.remove_peer(public_key)).await {
            // Keep the snapshot from resurrecting the peer on restart
            if let Err(snap) = self.bounded_live("snapshot remove", self.snapshot.remove(public_key)).await {
                warn!("Snapshot removal for {} also failed: {}", public_key, snap);
            }
            return Err(e);
        }
        debug!("Removed live peer {}", public_key);

        self.persist("snapshot remove", || self.snapshot.remove(public_key))
            .await
    }

    /// Whether the peer answers on its overlay address
    pub async fn probe_reachability(&self, address: Ipv4Addr) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.probe.probe(address)).await {
            Ok(reachable) => reachable,
            Err(_) => {
                debug!("Probe of {} exceeded {:?}", address, self.probe_timeout);
                false
            }
        }
    }

    /// Current live table
    pub async fn live_peers(&self) -> Result<Vec<LivePeer>> {
        self.bounded_live("live list", self.table.list_peers()).await
    }

    /// Compare desired entries against the live table and the snapshot
    pub async fn drift(&self, desired: &[LivePeer]) -> Result<DriftReport> {
        let live = self.live_peers().await?;
        let persisted = self.bounded_live("snapshot read", self.snapshot.entries()).await?;
        let mut report = DriftReport::default();

        for want in desired {
            match live.iter().find(|p| p.public_key == want.public_key) {
                None => report.missing.push(want.clone()),
                Some(have) if have.address != want.address => report.mismatched.push(want.clone()),
                Some(_) => {}
            }
            if !persisted.contains(want) {
                report.snapshot_missing.push(want.clone());
            }
        }
        for have in &live {
            if !desired.iter().any(|p| p.public_key == have.public_key) {
                report.unexpected.push(have.clone());
            }
        }
        for have in &persisted {
            if !desired.iter().any(|p| p.public_key == have.public_key) {
                report.snapshot_unexpected.push(have.clone());
            }
        }
        Ok(report)
    }

    /// Apply drift: add missing/mismatched entries, remove unexpected ones,
    /// then bring the snapshot in line for entries the live pass left alone.
    ///
    /// Per-peer failures are collected in the report rather than aborting.
    pub async fn sweep(&self, desired: &[LivePeer]) -> Result<DriftReport> {
        let mut report = self.drift(desired).await?;
        if report.is_clean() {
            debug!("Live peer table and snapshot in sync ({} peers)", desired.len());
            return Ok(report);
        }

        info!(
            "Reconciling live peers: {} missing, {} mismatched, {} unexpected; snapshot: {} missing, {} unexpected",
            report.missing.len(),
            report.mismatched.len(),
            report.unexpected.len(),
            report.snapshot_missing.len(),
            report.snapshot_unexpected.len()
        );

        let mut errors = Vec::new();
        for peer in report.missing.iter().chain(report.mismatched.iter()) {
            let Some(address) = peer.address else { continue };
            if let Err(e) = self.add_live_peer(&peer.public_key, address).await {
                warn!("Failed to restore live peer {}: {}", peer.public_key, e);
                errors.push(format!("{}: {}", peer.public_key, e));
            }
        }
        for peer in &report.unexpected {
            if let Err(e) = self.remove_live_peer(&peer.public_key).await {
                warn!("Failed to remove unexpected peer {}: {}", peer.public_key, e);
                errors.push(format!("{}: {}", peer.public_key, e));
            }
        }

        let handled = |key: &str, list: &[LivePeer]| list.iter().any(|p| p.public_key == key);
        for peer in &report.snapshot_missing {
            if handled(&peer.public_key, &report.missing) || handled(&peer.public_key, &report.mismatched) {
                continue;
            }
            let Some(address) = peer.address else { continue };
            if let Err(e) = self
                .persist("snapshot upsert", || self.snapshot.upsert(&peer.public_key, address))
                .await
            {
                warn!("Failed to persist peer {}: {}", peer.public_key, e);
                errors.push(format!("{}: {}", peer.public_key, e));
            }
        }
        for peer in &report.snapshot_unexpected {
            if handled(&peer.public_key, &report.unexpected) {
                continue;
            }
            if let Err(e) = self
                .persist("snapshot remove", || self.snapshot.remove(&peer.public_key))
                .await
            {
                warn!("Failed to drop peer {} from snapshot: {}", peer.public_key, e);
                errors.push(format!("{}: {}", peer.public_key, e));
            }
        }

        report.errors = errors;
        Ok(report)
    }

    async fn bounded_live<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.live_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ Error::LiveApplyFailed(_))) => Err(e),
            Ok(Err(e)) => Err(Error::LiveApplyFailed(format!("{}: {}", operation, e))),
            Err(_) => Err(Error::timeout(operation, self.live_timeout)),
        }
    }

    /// Write the snapshot, retrying before reporting `PartiallyApplied`
    async fn persist<F, Fut>(&self, operation: &str, mut write: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut last_error = String::new();
        for attempt in 0..=self.snapshot_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_backoff * attempt).await;
            }
            match tokio::time::timeout(self.live_timeout, write()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.live_timeout),
            }
            warn!(
                "{} failed (attempt {}/{}): {}",
                operation,
                attempt + 1,
                self.snapshot_retries + 1,
                last_error
            );
        }
        Err(Error::PartiallyApplied(format!("{}: {}", operation, last_error)))
    }
}
