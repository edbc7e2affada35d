//! Provisioning engine
//!
//! Single state machine over the peer lifecycle:
//!
//! ```text
//! pending --associate--> associated --test(reachable)--> active
//!    \____________________________________________________/
//!                 |  disable                ^ enable
//!                 v                         |
//!              disabled --------------------+
//!
//! any --remove--> deleted (terminal)
//! ```
//!
//! Authorization is checked before any side effect. Store calls run on the
//! blocking pool under the store timeout; live table calls go through the
//! [`PeerTableReconciler`].
//!
//! Operations on the same peer are serialized inside one engine. State writes
//! are conditional on the state that was read, so an engine in another
//! process sharing the store cannot push a peer through an illegal edge.

use crate::allocator::AddressPool;
use crate::config::{ProvisionerConfig, ScriptFormat};
use crate::reconciler::{DriftReport, LivePeer, PeerTableReconciler};
use crate::render::DeviceConfigRenderer;
use crate::store::PeerStore;
use meshprov_common::{
    generate_key_pair, normalize_hardware_id, Caller, Database, Error, NewPeer, Peer, PeerFilter,
    PeerState, PeerSummary, Result, Site,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a live table change attempted on behalf of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
pub enum LiveOutcome {
    /// Live table and snapshot both updated
    Applied,
    /// Live table changed, snapshot not persisted
    PartiallyApplied(String),
    /// Live table unchanged
    Failed(String),
}

impl LiveOutcome {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Applied,
            Err(Error::PartiallyApplied(msg)) => Self::PartiallyApplied(msg),
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Message to surface as a warning, if any
    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Applied => None,
            Self::PartiallyApplied(msg) | Self::Failed(msg) => Some(msg),
        }
    }
}

/// Returned once from `register`; the only time the private key leaves
/// the engine for a non-admin caller
#[derive(Clone, Serialize)]
pub struct Registration {
    pub peer: PeerSummary,
    pub private_key: String,
    pub device_config: String,
    pub live: LiveOutcome,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("peer", &self.peer)
            .field("private_key", &"<redacted>")
            .field("live", &self.live)
            .finish()
    }
}

/// Peer after an enable/disable, with the live table result
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub peer: PeerSummary,
    pub live: LiveOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub reachable: bool,
    pub state: PeerState,
    pub peer: PeerSummary,
}

/// Lifecycle operations on one peer take its stripe for their whole
/// read, live change and write
const PEER_LOCK_STRIPES: usize = 64;

pub struct ProvisioningEngine {
    store: PeerStore,
    pool: AddressPool,
    reconciler: PeerTableReconciler,
    renderer: DeviceConfigRenderer,
    store_timeout: Duration,
    peer_locks: Vec<Mutex<()>>,
}

impl ProvisioningEngine {
    pub fn new(
        store: PeerStore,
        pool: AddressPool,
        reconciler: PeerTableReconciler,
        renderer: DeviceConfigRenderer,
    ) -> Self {
        Self {
            store,
            pool,
            reconciler,
            renderer,
            store_timeout: Duration::from_secs(5),
            peer_locks: (0..PEER_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Open the store and build every collaborator from configuration
    pub fn from_config(config: &ProvisionerConfig) -> Result<Self> {
        let db = Database::open_with_busy_timeout(config.db_path(), config.timeouts.store())?;
        let store = PeerStore::open(db)?;
        let pool = AddressPool::from_config(&config.pool)?;
        let reconciler = PeerTableReconciler::from_config(config)?;
        let renderer = DeviceConfigRenderer::from_config(&config.overlay)?;

        info!("Provisioning engine ready: pool {}, store {}", pool, config.db_path().display());

        Ok(Self::new(store, pool, reconciler, renderer).with_store_timeout(config.timeouts.store()))
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn store(&self) -> &PeerStore {
        &self.store
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn reconciler(&self) -> &PeerTableReconciler {
        &self.reconciler
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register a device: issue keys, allocate an address, add the live peer.
    ///
    /// A failed live add does not fail the registration; it is reported in
    /// [`Registration::live`] and recorded on the peer.
    pub async fn register(
        &self,
        caller: &Caller,
        hardware_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Registration> {
        require_mutate(caller)?;

        let hardware_id = normalize_hardware_id(hardware_id)
            .ok_or_else(|| Error::InvalidInput("hardware_id must not be empty".to_string()))?;

        let tenant_id = match (caller.tenant_id(), tenant_id) {
            (Some(own), Some(requested)) if requested != own => {
                return Err(Error::Forbidden(format!(
                    "cannot register peers for tenant {}",
                    requested
                )));
            }
            (Some(own), _) => Some(own.to_string()),
            (None, requested) => requested.map(str::to_string),
        };

        let keys = generate_key_pair()?;
        let peer = self
            .create_peer(NewPeer {
                hardware_id,
                tenant_id,
                keys,
            })
            .await?;

        info!(
            "Registered peer {} ({}) at {}",
            peer.id, peer.hardware_id, peer.internal_address
        );

        let live = LiveOutcome::from_result(
            self.reconciler
                .add_live_peer(peer.public_key(), peer.internal_address)
                .await,
        );
        let peer = match live.warning() {
            None => peer,
            Some(msg) => {
                warn!("Live add for new peer {} failed: {}", peer.id, msg);
                self.note_error(peer, msg).await
            }
        };

        Ok(Registration {
            device_config: self.renderer.render(&peer),
            private_key: peer.keys.private_key.clone(),
            peer: PeerSummary::from(&peer),
            live,
        })
    }

    /// Assign the peer to a site, adopting the site's tenant
    pub async fn associate(&self, caller: &Caller, peer_id: Uuid, site_id: &str) -> Result<PeerSummary> {
        require_mutate(caller)?;

        let site = self.site(site_id).await?;
        if !caller.can_see(Some(site.tenant_id.as_str())) {
            return Err(Error::Forbidden(format!("site {} belongs to another tenant", site.id)));
        }

        let _guard = self.lock_peer(peer_id).await;
        let peer = self.visible_peer(caller, peer_id).await?;
        if let Some(owner) = &peer.tenant_id {
            if owner != &site.tenant_id {
                return Err(Error::Forbidden(format!(
                    "peer {} and site {} belong to different tenants",
                    peer.id, site.id
                )));
            }
        }
        if peer.state == PeerState::Disabled {
            return Err(Error::InvalidStateTransition {
                from: peer.state.to_string(),
                to: PeerState::Associated.to_string(),
            });
        }

        let updated = self
            .with_store("peer associate", move |s| {
                s.associate(peer_id, &site.id, Some(site.tenant_id.as_str()))
            })
            .await?;

        info!("Associated peer {} with site {}", updated.id, site_id);
        Ok(PeerSummary::from(&updated))
    }

    /// Re-add the live peer; `active` on success, resting state otherwise.
    ///
    /// If the peer was removed or disabled by another writer while the live
    /// add ran, the live entry is taken back out and the store error returned.
    pub async fn enable(&self, caller: &Caller, peer_id: Uuid) -> Result<StateChange> {
        require_mutate(caller)?;
        let _guard = self.lock_peer(peer_id).await;
        let peer = self.visible_peer(caller, peer_id).await?;

        let live = LiveOutcome::from_result(
            self.reconciler
                .add_live_peer(peer.public_key(), peer.internal_address)
                .await,
        );
        let next = match live {
            LiveOutcome::Failed(_) => peer.resting_state(),
            _ => PeerState::Active,
        };
        if let Some(msg) = live.warning() {
            warn!("Enable of peer {} did not fully apply: {}", peer.id, msg);
        }

        let expected = peer.state;
        let error = live.warning().map(str::to_string);
        let written = self
            .with_store("peer enable", move |s| {
                s.apply_outcome(peer_id, expected, next, error.as_deref())
            })
            .await;

        let updated = match written {
            Ok(updated) => updated,
            Err(e) => {
                if !matches!(live, LiveOutcome::Failed(_)) {
                    self.withdraw_live_peer(&peer).await;
                }
                return Err(e);
            }
        };

        info!("Peer {} enabled ({})", updated.id, updated.state);
        Ok(StateChange {
            peer: PeerSummary::from(&updated),
            live,
        })
    }

    /// Remove the live peer and mark it disabled; the address is kept
    pub async fn disable(&self, caller: &Caller, peer_id: Uuid) -> Result<StateChange> {
        require_mutate(caller)?;
        let _guard = self.lock_peer(peer_id).await;
        let peer = self.visible_peer(caller, peer_id).await?;

        let live = LiveOutcome::from_result(self.reconciler.remove_live_peer(peer.public_key()).await);
        if let Some(msg) = live.warning() {
            warn!("Live removal for peer {} failed: {}", peer.id, msg);
        }

        let expected = peer.state;
        let error = live.warning().map(str::to_string);
        let updated = self
            .with_store("peer disable", move |s| {
                s.apply_outcome(peer_id, expected, PeerState::Disabled, error.as_deref())
            })
            .await?;

        info!("Peer {} disabled", updated.id);
        Ok(StateChange {
            peer: PeerSummary::from(&updated),
            live,
        })
    }

    /// Probe the peer; promotes pending/associated to active when reachable
    pub async fn test(&self, caller: &Caller, peer_id: Uuid) -> Result<TestOutcome> {
        require_mutate(caller)?;
        let _guard = self.lock_peer(peer_id).await;
        let peer = self.visible_peer(caller, peer_id).await?;

        let reachable = self.reconciler.probe_reachability(peer.internal_address).await;
        if !reachable {
            debug!("Peer {} unreachable at {}", peer.id, peer.internal_address);
            return Ok(TestOutcome {
                reachable,
                state: peer.state,
                peer: PeerSummary::from(&peer),
            });
        }

        let updated = self
            .with_store("peer test", move |s| s.mark_reachable(peer_id))
            .await?;

        if updated.state != peer.state {
            info!("Peer {} reachable, now {}", updated.id, updated.state);
        }
        Ok(TestOutcome {
            reachable,
            state: updated.state,
            peer: PeerSummary::from(&updated),
        })
    }

    /// Best-effort live removal, then soft delete
    pub async fn remove(&self, caller: &Caller, peer_id: Uuid) -> Result<()> {
        require_mutate(caller)?;
        let _guard = self.lock_peer(peer_id).await;
        let peer = self.visible_peer(caller, peer_id).await?;

        if let Err(e) = self.reconciler.remove_live_peer(peer.public_key()).await {
            warn!("Live removal for deleted peer {} failed: {}", peer.id, e);
        }

        self.with_store("peer delete", move |s| s.delete(peer_id)).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn list(&self, caller: &Caller, filter: PeerFilter) -> Result<Vec<PeerSummary>> {
        let mut filter = filter;
        if let Some(own) = caller.tenant_id() {
            match filter.tenant_id.as_deref() {
                Some(requested) if requested != own => {
                    return Err(Error::Forbidden(format!(
                        "cannot list peers of tenant {}",
                        requested
                    )));
                }
                _ => filter.tenant_id = Some(own.to_string()),
            }
        }

        let peers = self.with_store("peer list", move |s| s.list(&filter)).await?;
        Ok(peers.iter().map(PeerSummary::from).collect())
    }

    pub async fn get(&self, caller: &Caller, peer_id: Uuid) -> Result<PeerSummary> {
        let peer = self.visible_peer(caller, peer_id).await?;
        Ok(PeerSummary::from(&peer))
    }

    /// Re-render the device configuration, private key included. Admin only.
    pub async fn device_config(
        &self,
        caller: &Caller,
        peer_id: Uuid,
        format: Option<ScriptFormat>,
    ) -> Result<String> {
        require_admin(caller)?;
        let peer = self.visible_peer(caller, peer_id).await?;
        Ok(self
            .renderer
            .render_as(&peer, format.unwrap_or_else(|| self.renderer.format())))
    }

    /// Compare the live table with the store without changing anything. Admin only.
    pub async fn drift(&self, caller: &Caller) -> Result<DriftReport> {
        require_admin(caller)?;
        let desired = self.desired_live_peers().await?;
        self.reconciler.drift(&desired).await
    }

    /// Drive the live table to the store's intent. Admin only.
    pub async fn reconcile(&self, caller: &Caller) -> Result<DriftReport> {
        require_admin(caller)?;
        let desired = self.desired_live_peers().await?;

        let report = self.reconciler.sweep(&desired).await?;
        if !report.errors.is_empty() {
            warn!("Reconcile finished with {} errors", report.errors.len());
        }
        Ok(report)
    }

    // ========================================================================
    // Sites
    // ========================================================================

    /// Add a site; tenant callers may only add sites for themselves
    pub async fn add_site(&self, caller: &Caller, site_id: &str, tenant_id: &str, name: &str) -> Result<Site> {
        require_mutate(caller)?;
        if !caller.can_see(Some(tenant_id)) {
            return Err(Error::Forbidden(format!("cannot add sites for tenant {}", tenant_id)));
        }
        let site_id = site_id.trim().to_string();
        if site_id.is_empty() {
            return Err(Error::InvalidInput("site id must not be empty".to_string()));
        }

        let (tenant_id, name) = (tenant_id.to_string(), name.to_string());
        self.with_store("site create", move |s| s.put_site(&site_id, &tenant_id, &name))
            .await
    }

    pub async fn list_sites(&self, caller: &Caller) -> Result<Vec<Site>> {
        let tenant = caller.tenant_id().map(str::to_string);
        self.with_store("site list", move |s| s.list_sites(tenant.as_deref()))
            .await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn with_store<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&PeerStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || f(&store));

        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Internal(format!("{} task failed: {}", operation, e))),
            Err(_) => Err(Error::timeout(operation, self.store_timeout)),
        }
    }

    async fn lock_peer(&self, peer_id: Uuid) -> MutexGuard<'_, ()> {
        let stripe = (peer_id.as_u128() % self.peer_locks.len() as u128) as usize;
        self.peer_locks[stripe].lock().await
    }

    /// Insert the peer, riding out a slow store.
    ///
    /// The insert keeps running on the blocking pool after a timeout, so it
    /// gets a second window to land and is then looked up by hardware ID. If
    /// it commits later still, the caller sees `Timeout`; an admin recovers
    /// the device configuration with [`Self::device_config`].
    async fn create_peer(&self, new_peer: NewPeer) -> Result<Peer> {
        let store = self.store.clone();
        let pool = self.pool;
        let hardware_id = new_peer.hardware_id.clone();
        let public_key = new_peer.keys.public_key.clone();
        let mut task = tokio::task::spawn_blocking(move || store.create(&new_peer, &pool));

        for window in 1..=2 {
            match tokio::time::timeout(self.store_timeout, &mut task).await {
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => return Err(Error::Internal(format!("peer create task failed: {}", e))),
                Err(_) => warn!(
                    "Peer create for {} still running after {:?} (window {})",
                    hardware_id, self.store_timeout, window
                ),
            }
        }

        let hw = hardware_id.clone();
        match self
            .with_store("peer lookup", move |s| s.get_by_hardware_id(&hw))
            .await
        {
            Ok(Some(peer)) if peer.public_key() == public_key => Ok(peer),
            _ => Err(Error::timeout("peer create", self.store_timeout)),
        }
    }

    /// Take back a live add whose store write did not land, unless the peer
    /// still exists in a state that wants its live entry
    async fn withdraw_live_peer(&self, peer: &Peer) {
        let id = peer.id;
        let current = self.with_store("peer lookup", move |s| s.get_by_id(id)).await;
        if matches!(&current, Ok(Some(p)) if p.state.expects_live_entry()) {
            return;
        }
        match self.reconciler.remove_live_peer(peer.public_key()).await {
            Ok(()) => info!("Withdrew live entry for peer {} after a concurrent change", id),
            Err(e) => warn!("Could not withdraw live entry for peer {}: {}", id, e),
        }
    }

    async fn desired_live_peers(&self) -> Result<Vec<LivePeer>> {
        Ok(self
            .with_store("live peer list", |s| s.live_peers())
            .await?
            .iter()
            .map(|p| LivePeer::new(p.public_key(), p.internal_address))
            .collect())
    }

    async fn site(&self, site_id: &str) -> Result<Site> {
        let id = site_id.to_string();
        self.with_store("site lookup", move |s| s.get_site(&id))
            .await?
            .ok_or_else(|| Error::not_found("site", site_id))
    }

    /// Load a non-deleted peer the caller is allowed to see
    async fn visible_peer(&self, caller: &Caller, peer_id: Uuid) -> Result<Peer> {
        let peer = self
            .with_store("peer lookup", move |s| s.get_by_id(peer_id))
            .await?
            .ok_or_else(|| Error::not_found("peer", peer_id.to_string()))?;

        if !caller.can_see(peer.tenant_id.as_deref()) {
            return Err(Error::Forbidden(format!(
                "peer {} belongs to another tenant",
                peer_id
            )));
        }
        Ok(peer)
    }

    /// Record a live failure on the peer; a store failure here is only logged
    async fn note_error(&self, peer: Peer, msg: &str) -> Peer {
        let id = peer.id;
        let msg = msg.to_string();
        match self
            .with_store("peer record error", move |s| s.record_error(id, Some(msg.as_str())))
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!("Could not record live failure on peer {}: {}", id, e);
                peer
            }
        }
    }
}

fn require_mutate(caller: &Caller) -> Result<()> {
    if caller.can_mutate() {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("{} is read-only", caller.subject)))
    }
}

fn require_admin(caller: &Caller) -> Result<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("{} is not an administrator", caller.subject)))
    }
}
