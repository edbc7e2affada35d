//! In-process peer table and snapshot
//!
//! Used for dry runs and tests. The table doubles as a reachability probe: an
//! address answers only while it has a live entry and the device is marked
//! online.

use super::{LivePeer, LivePeerTable, PeerSnapshot, ReachabilityProbe};
use async_trait::async_trait;
use meshprov_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct MemoryPeerTable {
    peers: Mutex<BTreeMap<String, Ipv4Addr>>,
    online: Mutex<HashSet<Ipv4Addr>>,
    failing: AtomicBool,
}

impl MemoryPeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every table call fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Mark the device behind `address` as up or down
    pub fn set_online(&self, address: Ipv4Addr, online: bool) {
        let mut set = self.online.lock();
        if online {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.peers.lock().contains_key(public_key)
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::LiveApplyFailed(format!("{}: peer table unavailable", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl LivePeerTable for MemoryPeerTable {
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        self.check("add")?;
        self.peers.lock().insert(public_key.to_string(), address);
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.check("remove")?;
        self.peers.lock().remove(public_key);
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>> {
        self.check("list")?;
        Ok(self
            .peers
            .lock()
            .iter()
            .map(|(pk, addr)| LivePeer::new(pk.clone(), *addr))
            .collect())
    }
}

#[async_trait]
impl ReachabilityProbe for MemoryPeerTable {
    async fn probe(&self, address: Ipv4Addr) -> bool {
        let routed = self.peers.lock().values().any(|a| *a == address);
        routed && self.online.lock().contains(&address)
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshot {
    entries: Mutex<BTreeMap<String, Ipv4Addr>>,
    failures_left: AtomicU32,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes
    pub fn fail_next_writes(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "snapshot write failed",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerSnapshot for MemorySnapshot {
    async fn upsert(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        self.check_write()?;
        self.entries.lock().insert(public_key.to_string(), address);
        Ok(())
    }

    async fn remove(&self, public_key: &str) -> Result<()> {
        self.check_write()?;
        self.entries.lock().remove(public_key);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LivePeer>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(pk, addr)| LivePeer::new(pk.clone(), *addr))
            .collect())
    }
}
