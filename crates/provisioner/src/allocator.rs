//! Overlay address pool
//!
//! Addresses come from a fixed IPv4 network. The first `reserved_low` host
//! offsets (offset 0 is the network address) and the broadcast address are
//! never handed out. Allocation is a first-fit ascending scan over whatever
//! the caller reports as in use; callers run it inside the store's write
//! transaction so the scan and the insert are atomic.

use crate::config::PoolConfig;
use ipnetwork::Ipv4Network;
use meshprov_common::{Error, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Bounded pool of allocatable overlay addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Network,
    reserved_low: u32,
}

impl AddressPool {
    /// Build a pool from a CIDR string.
    pub fn new(cidr: &str, reserved_low: u32) -> Result<Self> {
        let parsed: Ipv4Network = cidr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("Invalid pool CIDR {}: {}", cidr, e)))?;

        if parsed.prefix() > 30 {
            return Err(Error::InvalidConfig(format!(
                "Pool {} is too small, need at least a /30",
                cidr
            )));
        }

        // Normalize 10.10.10.7/24 to 10.10.10.0/24
        let network = Ipv4Network::new(parsed.network(), parsed.prefix())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let pool = Self {
            network,
            reserved_low,
        };
        if pool.capacity() == 0 {
            return Err(Error::InvalidConfig(format!(
                "Pool {} has no allocatable addresses with reserved_low={}",
                cidr, reserved_low
            )));
        }
        Ok(pool)
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(&config.cidr, config.reserved_low)
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.network.prefix()))
    }

    /// First allocatable host offset
    fn first_offset(&self) -> u64 {
        u64::from(self.reserved_low.max(1))
    }

    /// One past the last allocatable host offset (broadcast is excluded)
    fn end_offset(&self) -> u64 {
        self.size() - 1
    }

    /// Allocatable addresses in ascending order
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u64::from(u32::from(self.network.network()));
        (self.first_offset()..self.end_offset()).map(move |offset| Ipv4Addr::from((base + offset) as u32))
    }

    /// Number of allocatable addresses
    pub fn capacity(&self) -> usize {
        self.end_offset().saturating_sub(self.first_offset()) as usize
    }

    /// Whether `addr` is an allocatable member of this pool
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if !self.network.contains(addr) {
            return false;
        }
        let offset = u64::from(u32::from(addr)) - u64::from(u32::from(self.network.network()));
        offset >= self.first_offset() && offset < self.end_offset()
    }

    /// Pick the lowest address not present in `in_use`.
    pub fn allocate(&self, in_use: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.candidates()
            .find(|addr| !in_use.contains(addr))
            .ok_or_else(|| Error::PoolExhausted {
                pool: self.network.to_string(),
            })
    }
}

impl std::fmt::Display for AddressPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (from offset {})", self.network, self.reserved_low)
    }
}
