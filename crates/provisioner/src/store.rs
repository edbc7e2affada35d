//! Peer store
//!
//! Tables:
//! - sites: minimal site directory (id, owning tenant) used for association checks
//! - peers: one row per provisioned device, soft-deleted on removal
//!
//! Hardware IDs, addresses and public keys are unique among rows with
//! `deleted_at IS NULL` (partial unique indexes), so a deleted peer releases
//! its address and hardware ID.

use crate::allocator::AddressPool;
use meshprov_common::{
    normalize_hardware_id, now_epoch_secs, Database, Error, NewPeer, Peer, PeerFilter, PeerState,
    Result, Site, WgKeyPair,
};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at the allocate-and-insert transaction when an address collides
const ALLOCATION_ATTEMPTS: usize = 3;

const PEER_COLUMNS: &str = "id, hardware_id, tenant_id, site_id, private_key, public_key, internal_address, \
     state, last_seen_at, last_error, created_at, updated_at";

/// Durable record of every device.
///
/// Reads are public. Peer writes are crate-private, so state only moves
/// through [`ProvisioningEngine`](crate::ProvisioningEngine):
///
/// ```compile_fail
/// use meshprov_common::Database;
/// use meshprov_provisioner::PeerStore;
///
/// let store = PeerStore::open(Database::open_memory().unwrap()).unwrap();
/// store.mark_reachable(uuid::Uuid::new_v4()).unwrap();
/// ```
#[derive(Clone)]
pub struct PeerStore {
    db: Database,
}

impl PeerStore {
    /// Wrap a database and make sure the schema exists
    pub fn open(db: Database) -> Result<Self> {
        let store = Self { db };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize schema
    fn init_schema(&self) -> Result<()> {
        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sites_tenant ON sites(tenant_id);

            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                hardware_id TEXT NOT NULL,
                tenant_id TEXT,
                site_id TEXT REFERENCES sites(id),
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                internal_address TEXT NOT NULL,
                state TEXT NOT NULL,
                last_seen_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_hardware_live
                ON peers(hardware_id) WHERE deleted_at IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_address_live
                ON peers(internal_address) WHERE deleted_at IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_public_key_live
                ON peers(public_key) WHERE deleted_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_peers_tenant ON peers(tenant_id);
            "#,
        )?;
        debug!("Peer store schema initialized");
        Ok(())
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Allocate an address from `pool` and insert the peer in one transaction.
    ///
    /// Fails with `Conflict` when the hardware ID is already registered and
    /// with `PoolExhausted` when no address is free.
    pub(crate) fn create(&self, new_peer: &NewPeer, pool: &AddressPool) -> Result<Peer> {
        let hardware_id = normalize_hardware_id(&new_peer.hardware_id)
            .ok_or_else(|| Error::InvalidInput("hardware_id must not be empty".to_string()))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.db.write_transaction(|tx| {
                let taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM peers WHERE hardware_id = ?1 AND deleted_at IS NULL)",
                    params![hardware_id],
                    |row| row.get(0),
                )?;
                if taken {
                    return Err(Error::conflict("peer", hardware_id.as_str()));
                }

                let in_use = addresses_in_use(tx)?;
                let address = pool.allocate(&in_use)?;

                let now = now_epoch_secs();
                let peer = Peer {
                    id: Uuid::new_v4(),
                    hardware_id: hardware_id.clone(),
                    tenant_id: new_peer.tenant_id.clone(),
                    site_id: None,
                    keys: new_peer.keys.clone(),
                    internal_address: address,
                    state: PeerState::Pending,
                    last_seen_at: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };

                tx.execute(
                    "INSERT INTO peers (id, hardware_id, tenant_id, site_id, private_key, public_key, \
                     internal_address, state, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        peer.id.to_string(),
                        peer.hardware_id,
                        peer.tenant_id,
                        peer.keys.private_key,
                        peer.keys.public_key,
                        peer.internal_address.to_string(),
                        peer.state.as_str(),
                        peer.created_at,
                        peer.updated_at,
                    ],
                )?;
                Ok(peer)
            });

            match result {
                Err(Error::Database(e)) if is_unique_violation(&e) => {
                    let message = e.to_string();
                    if message.contains("hardware_id") {
                        return Err(Error::conflict("peer", hardware_id));
                    }
                    if message.contains("internal_address") && attempt < ALLOCATION_ATTEMPTS {
                        warn!("Address collision allocating for {}, retrying", hardware_id);
                        continue;
                    }
                    return Err(Error::conflict("peer", format!("{} ({})", hardware_id, message)));
                }
                Ok(peer) => {
                    info!(
                        "Created peer {} for {} at {}",
                        peer.id, peer.hardware_id, peer.internal_address
                    );
                    return Ok(peer);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get a non-deleted peer by ID
    pub fn get_by_id(&self, id: Uuid) -> Result<Option<Peer>> {
        self.db.with_connection(|conn| {
            query_one(
                conn,
                &format!("SELECT {} FROM peers WHERE id = ?1 AND deleted_at IS NULL", PEER_COLUMNS),
                params![id.to_string()],
            )
        })
    }

    /// Get a non-deleted peer by hardware ID (case-insensitive)
    pub fn get_by_hardware_id(&self, hardware_id: &str) -> Result<Option<Peer>> {
        let Some(hardware_id) = normalize_hardware_id(hardware_id) else {
            return Ok(None);
        };
        self.db.with_connection(|conn| {
            query_one(
                conn,
                &format!(
                    "SELECT {} FROM peers WHERE hardware_id = ?1 AND deleted_at IS NULL",
                    PEER_COLUMNS
                ),
                params![hardware_id],
            )
        })
    }

    /// List non-deleted peers, newest first
    pub fn list(&self, filter: &PeerFilter) -> Result<Vec<Peer>> {
        let mut sql = format!("SELECT {} FROM peers WHERE deleted_at IS NULL", PEER_COLUMNS);
        let mut args: Vec<&dyn ToSql> = Vec::new();

        if let Some(tenant_id) = &filter.tenant_id {
            args.push(tenant_id);
            sql.push_str(&format!(" AND tenant_id = ?{}", args.len()));
        }
        let state = filter.state.map(|s| s.as_str());
        if let Some(state) = &state {
            args.push(state);
            sql.push_str(&format!(" AND state = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        self.db.with_connection(|conn| query_many(conn, &sql, &args))
    }

    /// Peers that should currently hold a live overlay entry
    pub fn live_peers(&self) -> Result<Vec<Peer>> {
        let states: Vec<String> = PeerState::ALL
            .iter()
            .filter(|s| s.expects_live_entry())
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let sql = format!(
            "SELECT {} FROM peers WHERE deleted_at IS NULL AND state IN ({}) ORDER BY created_at",
            PEER_COLUMNS,
            states.join(", ")
        );
        self.db.with_connection(|conn| query_many(conn, &sql, &[]))
    }

    /// Move a peer from `expected` to `new_state`, replacing the last error
    /// (`None` clears it).
    ///
    /// The write only lands if the stored state is still `expected`; a peer
    /// deleted meanwhile is `NotFound`, one changed meanwhile is
    /// `InvalidStateTransition` from its current state.
    pub(crate) fn apply_outcome(
        &self,
        id: Uuid,
        expected: PeerState,
        new_state: PeerState,
        last_error: Option<&str>,
    ) -> Result<Peer> {
        if new_state.is_deleted() {
            return Err(Error::InvalidInput("use delete() to remove a peer".to_string()));
        }
        self.db.with_connection(|conn| {
            let rows = conn.execute(
                "UPDATE peers SET state = ?1, last_error = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND state = ?5 AND deleted_at IS NULL",
                params![
                    new_state.as_str(),
                    last_error,
                    now_epoch_secs(),
                    id.to_string(),
                    expected.as_str()
                ],
            )?;
            let peer = fetch_live(conn, id)?;
            if rows == 0 {
                debug!("Peer {} left {} before the write to {}", id, expected, new_state);
                return Err(Error::InvalidStateTransition {
                    from: peer.state.to_string(),
                    to: new_state.to_string(),
                });
            }
            Ok(peer)
        })
    }

    /// Record (or clear) the last live-apply failure without touching state
    pub(crate) fn record_error(&self, id: Uuid, last_error: Option<&str>) -> Result<Peer> {
        self.update_returning(
            id,
            "UPDATE peers SET last_error = ?1, updated_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
            params![last_error, now_epoch_secs(), id.to_string()],
        )
    }

    /// Record a successful reachability probe.
    ///
    /// `pending` and `associated` move to `active` in the same statement; any
    /// other state (a peer disabled while the probe ran) is kept.
    pub(crate) fn mark_reachable(&self, id: Uuid) -> Result<Peer> {
        let now = now_epoch_secs();
        self.update_returning(
            id,
            "UPDATE peers SET last_seen_at = ?1, updated_at = ?1, \
             state = CASE WHEN state IN ('pending', 'associated') THEN 'active' ELSE state END \
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id.to_string()],
        )
    }

    /// Assign a site.
    ///
    /// Adopts `tenant_id` when the peer has none and moves `pending` to
    /// `associated`; other states are kept.
    pub(crate) fn associate(&self, id: Uuid, site_id: &str, tenant_id: Option<&str>) -> Result<Peer> {
        self.update_returning(
            id,
            "UPDATE peers SET site_id = ?1, tenant_id = COALESCE(tenant_id, ?2), \
             state = CASE WHEN state = 'pending' THEN 'associated' ELSE state END, \
             updated_at = ?3 WHERE id = ?4 AND deleted_at IS NULL",
            params![site_id, tenant_id, now_epoch_secs(), id.to_string()],
        )
    }

    /// Soft-delete a peer.
    ///
    /// The private key is scrubbed and the hardware ID and address leave the
    /// uniqueness namespace.
    pub(crate) fn delete(&self, id: Uuid) -> Result<()> {
        let now = now_epoch_secs();
        let rows = self.db.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE peers SET state = 'deleted', private_key = '', deleted_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, id.to_string()],
            )?)
        })?;

        if rows == 0 {
            return Err(Error::not_found("peer", id.to_string()));
        }
        info!("Deleted peer {}", id);
        Ok(())
    }

    /// Number of non-deleted peers holding an address
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM peers WHERE deleted_at IS NULL",
                [],
                |row| row.get(0),
            )?)
        })?;
        Ok(count as usize)
    }

    fn update_returning(&self, id: Uuid, sql: &str, args: &[&dyn ToSql]) -> Result<Peer> {
        self.db.with_connection(|conn| {
            if conn.execute(sql, args)? == 0 {
                return Err(Error::not_found("peer", id.to_string()));
            }
            fetch_live(conn, id)
        })
    }

    // ========================================================================
    // Sites
    // ========================================================================

    /// Register a site in the directory
    pub fn put_site(&self, id: &str, tenant_id: &str, name: &str) -> Result<Site> {
        let site = Site {
            id: id.trim().to_string(),
            tenant_id: tenant_id.trim().to_string(),
            name: name.to_string(),
            created_at: now_epoch_secs(),
        };
        if site.id.is_empty() || site.tenant_id.is_empty() {
            return Err(Error::InvalidInput("site id and tenant id are required".to_string()));
        }

        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sites (id, tenant_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![site.id, site.tenant_id, site.name, site.created_at],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::conflict("site", site.id.as_str())
                } else {
                    Error::Database(e)
                }
            })?;
            Ok(())
        })?;
        Ok(site)
    }

    pub fn get_site(&self, id: &str) -> Result<Option<Site>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, tenant_id, name, created_at FROM sites WHERE id = ?1",
                    params![id],
                    site_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_sites(&self, tenant_id: Option<&str>) -> Result<Vec<Site>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, name, created_at FROM sites \
                 WHERE (?1 IS NULL OR tenant_id = ?1) ORDER BY id",
            )?;
            let rows = stmt.query_map(params![tenant_id], site_from_row)?;
            let mut sites = Vec::new();
            for row in rows {
                sites.push(row?);
            }
            Ok(sites)
        })
    }
}

/// Raw peer row before parsing
struct RawPeer {
    id: String,
    hardware_id: String,
    tenant_id: Option<String>,
    site_id: Option<String>,
    private_key: String,
    public_key: String,
    internal_address: String,
    state: String,
    last_seen_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawPeer {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hardware_id: row.get(1)?,
            tenant_id: row.get(2)?,
            site_id: row.get(3)?,
            private_key: row.get(4)?,
            public_key: row.get(5)?,
            internal_address: row.get(6)?,
            state: row.get(7)?,
            last_seen_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn parse(self) -> Result<Peer> {
        Ok(Peer {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| Error::Internal(format!("corrupt peer id {}: {}", self.id, e)))?,
            hardware_id: self.hardware_id,
            tenant_id: self.tenant_id,
            site_id: self.site_id,
            keys: WgKeyPair {
                private_key: self.private_key,
                public_key: self.public_key,
            },
            internal_address: parse_address(&self.internal_address)?,
            state: self.state.parse().map_err(Error::Internal)?,
            last_seen_at: self.last_seen_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn query_one(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Option<Peer>> {
    let raw = conn.query_row(sql, args, RawPeer::from_row).optional()?;
    raw.map(RawPeer::parse).transpose()
}

/// Non-deleted peer by ID, `NotFound` otherwise
fn fetch_live(conn: &Connection, id: Uuid) -> Result<Peer> {
    query_one(
        conn,
        &format!("SELECT {} FROM peers WHERE id = ?1 AND deleted_at IS NULL", PEER_COLUMNS),
        params![id.to_string()],
    )?
    .ok_or_else(|| Error::not_found("peer", id.to_string()))
}

fn query_many(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<Peer>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, RawPeer::from_row)?;
    let mut peers = Vec::new();
    for row in rows {
        peers.push(row?.parse()?);
    }
    Ok(peers)
}

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn addresses_in_use(conn: &Connection) -> Result<HashSet<Ipv4Addr>> {
    let mut stmt = conn.prepare("SELECT internal_address FROM peers WHERE deleted_at IS NULL")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut in_use = HashSet::new();
    for row in rows {
        in_use.insert(parse_address(&row?)?);
    }
    Ok(in_use)
}

fn parse_address(raw: &str) -> Result<Ipv4Addr> {
    raw.parse()
        .map_err(|e| Error::Internal(format!("corrupt address {}: {}", raw, e)))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshprov_common::generate_key_pair;

    fn test_store() -> PeerStore {
        PeerStore::open(Database::open_memory().unwrap()).unwrap()
    }

    fn new_peer(hw: &str, tenant: Option<&str>) -> NewPeer {
        NewPeer {
            hardware_id: hw.to_string(),
            tenant_id: tenant.map(str::to_string),
            keys: generate_key_pair().unwrap(),
        }
    }

    fn pool() -> AddressPool {
        AddressPool::new("10.10.10.0/24", 10).unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let store = test_store();
        let peer = store.create(&new_peer("AA:BB:CC:DD:EE:01", Some("t1")), &pool()).unwrap();

        assert_eq!(peer.hardware_id, "aa:bb:cc:dd:ee:01");
        assert_eq!(peer.state, PeerState::Pending);
        assert_eq!(peer.internal_address, Ipv4Addr::new(10, 10, 10, 10));

        let fetched = store.get_by_id(peer.id).unwrap().unwrap();
        assert_eq!(fetched.keys, peer.keys);
        assert_eq!(fetched.tenant_id.as_deref(), Some("t1"));

        let by_hw = store.get_by_hardware_id("aa:bb:cc:dd:ee:01").unwrap().unwrap();
        assert_eq!(by_hw.id, peer.id);
    }

    #[test]
    fn test_duplicate_hardware_id_conflicts() {
        let store = test_store();
        store.create(&new_peer("AA:BB:CC:DD:EE:01", None), &pool()).unwrap();

        let err = store
            .create(&new_peer("aa:bb:cc:dd:ee:01", None), &pool())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_sequential_addresses_are_distinct() {
        let store = test_store();
        let mut seen = HashSet::new();
        for i in 0..20 {
            let peer = store.create(&new_peer(&format!("hw-{}", i), None), &pool()).unwrap();
            assert!(seen.insert(peer.internal_address));
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let store = test_store();
        let small = AddressPool::new("10.0.0.0/30", 1).unwrap();
        store.create(&new_peer("a", None), &small).unwrap();
        store.create(&new_peer("b", None), &small).unwrap();

        let err = store.create(&new_peer("c", None), &small).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(store.get_by_hardware_id("c").unwrap().is_none());
    }

    #[test]
    fn test_delete_releases_address_and_hardware_id() {
        let store = test_store();
        let small = AddressPool::new("10.0.0.0/30", 2).unwrap();
        let first = store.create(&new_peer("a", None), &small).unwrap();

        store.delete(first.id).unwrap();
        assert!(store.get_by_id(first.id).unwrap().is_none());
        assert!(matches!(store.delete(first.id), Err(Error::NotFound { .. })));

        let again = store.create(&new_peer("a", None), &small).unwrap();
        assert_eq!(again.internal_address, first.internal_address);
        assert_ne!(again.id, first.id);
    }

    #[test]
    fn test_delete_scrubs_private_key() {
        let store = test_store();
        let peer = store.create(&new_peer("a", None), &pool()).unwrap();
        store.delete(peer.id).unwrap();

        let key: String = store
            .db
            .with_connection(|c| {
                Ok(c.query_row(
                    "SELECT private_key FROM peers WHERE id = ?1",
                    params![peer.id.to_string()],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(key.is_empty());
    }

    #[test]
    fn test_list_filters() {
        let store = test_store();
        let a = store.create(&new_peer("a", Some("t1")), &pool()).unwrap();
        store.create(&new_peer("b", Some("t2")), &pool()).unwrap();
        store.create(&new_peer("c", Some("t1")), &pool()).unwrap();
        store
            .apply_outcome(a.id, PeerState::Pending, PeerState::Disabled, None)
            .unwrap();

        assert_eq!(store.list(&PeerFilter::default()).unwrap().len(), 3);
        assert_eq!(store.list(&PeerFilter::tenant("t1")).unwrap().len(), 2);

        let disabled = store
            .list(&PeerFilter::tenant("t1").with_state(PeerState::Disabled))
            .unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].id, a.id);

        let live = store.live_peers().unwrap();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn test_associate_adopts_tenant_and_moves_pending() {
        let store = test_store();
        store.put_site("s1", "t1", "Head office").unwrap();
        let peer = store.create(&new_peer("a", None), &pool()).unwrap();

        let updated = store.associate(peer.id, "s1", Some("t1")).unwrap();
        assert_eq!(updated.state, PeerState::Associated);
        assert_eq!(updated.site_id.as_deref(), Some("s1"));
        assert_eq!(updated.tenant_id.as_deref(), Some("t1"));
        assert!(updated.updated_at >= peer.updated_at);

        store
            .apply_outcome(peer.id, PeerState::Associated, PeerState::Active, None)
            .unwrap();
        let again = store.associate(peer.id, "s1", Some("t1")).unwrap();
        assert_eq!(again.state, PeerState::Active);
    }

    #[test]
    fn test_updates_on_missing_peer_are_not_found() {
        let store = test_store();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.apply_outcome(id, PeerState::Pending, PeerState::Active, None),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(store.mark_reachable(id), Err(Error::NotFound { .. })));
        assert!(store
            .apply_outcome(id, PeerState::Pending, PeerState::Deleted, None)
            .is_err());
    }

    #[test]
    fn test_apply_outcome_sets_and_clears_error() {
        let store = test_store();
        let peer = store.create(&new_peer("a", None), &pool()).unwrap();

        let failed = store
            .apply_outcome(peer.id, PeerState::Pending, PeerState::Pending, Some("wg: device not found"))
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("wg: device not found"));

        let cleared = store
            .apply_outcome(peer.id, PeerState::Pending, PeerState::Active, None)
            .unwrap();
        assert!(cleared.last_error.is_none());
        assert_eq!(cleared.state, PeerState::Active);
    }

    #[test]
    fn test_apply_outcome_requires_expected_state() {
        let store = test_store();
        let peer = store.create(&new_peer("a", None), &pool()).unwrap();
        store
            .apply_outcome(peer.id, PeerState::Pending, PeerState::Disabled, None)
            .unwrap();

        // A writer that read `pending` before the disable must not land
        let err = store
            .apply_outcome(peer.id, PeerState::Pending, PeerState::Active, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition { ref from, .. } if from == "disabled"
        ));
        assert_eq!(store.get_by_id(peer.id).unwrap().unwrap().state, PeerState::Disabled);

        store.delete(peer.id).unwrap();
        assert!(matches!(
            store.apply_outcome(peer.id, PeerState::Disabled, PeerState::Active, None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_mark_reachable_promotes_only_resting_states() {
        let store = test_store();
        store.put_site("s1", "t1", "Head office").unwrap();

        let pending = store.create(&new_peer("a", None), &pool()).unwrap();
        let seen = store.mark_reachable(pending.id).unwrap();
        assert_eq!(seen.state, PeerState::Active);
        assert!(seen.last_seen_at.is_some());

        let associated = store.create(&new_peer("b", None), &pool()).unwrap();
        store.associate(associated.id, "s1", Some("t1")).unwrap();
        assert_eq!(store.mark_reachable(associated.id).unwrap().state, PeerState::Active);

        let disabled = store.create(&new_peer("c", None), &pool()).unwrap();
        store
            .apply_outcome(disabled.id, PeerState::Pending, PeerState::Disabled, None)
            .unwrap();
        let kept = store.mark_reachable(disabled.id).unwrap();
        assert_eq!(kept.state, PeerState::Disabled);
        assert!(kept.last_seen_at.is_some());
    }

    #[test]
    fn test_record_error_keeps_state() {
        let store = test_store();
        let peer = store.create(&new_peer("a", None), &pool()).unwrap();

        let noted = store.record_error(peer.id, Some("wg: timed out")).unwrap();
        assert_eq!(noted.state, PeerState::Pending);
        assert_eq!(noted.last_error.as_deref(), Some("wg: timed out"));
    }

    #[test]
    fn test_sites() {
        let store = test_store();
        store.put_site("s1", "t1", "Head office").unwrap();
        store.put_site("s2", "t2", "Depot").unwrap();

        assert!(matches!(
            store.put_site("s1", "t1", "dup"),
            Err(Error::Conflict { .. })
        ));
        assert_eq!(store.get_site("s1").unwrap().unwrap().tenant_id, "t1");
        assert!(store.get_site("nope").unwrap().is_none());
        assert_eq!(store.list_sites(None).unwrap().len(), 2);
        assert_eq!(store.list_sites(Some("t2")).unwrap().len(), 1);
    }
}
