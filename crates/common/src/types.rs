//! Core types for meshprov

use crate::crypto::WgKeyPair;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Provisioning state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Registered, no site yet
    Pending,
    /// Site assigned
    Associated,
    /// Reachability probe succeeded at least once, or re-enabled
    Active,
    /// Administratively suspended
    Disabled,
    /// Terminal
    Deleted,
}

impl Default for PeerState {
    fn default() -> Self {
        Self::Pending
    }
}

impl PeerState {
    pub const ALL: [PeerState; 5] = [
        PeerState::Pending,
        PeerState::Associated,
        PeerState::Active,
        PeerState::Disabled,
        PeerState::Deleted,
    ];

    /// States whose peers are expected to hold a live overlay entry
    pub fn expects_live_entry(self) -> bool {
        matches!(self, Self::Pending | Self::Associated | Self::Active)
    }

    pub fn is_deleted(self) -> bool {
        self == Self::Deleted
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Associated => "associated",
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeerState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "associated" => Ok(Self::Associated),
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("unknown peer state: {}", s)),
        }
    }
}

/// Durable peer record, including the private key.
///
/// Never serialized as a whole; transports get a [`PeerSummary`].
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: Uuid,
    pub hardware_id: String,
    pub tenant_id: Option<String>,
    pub site_id: Option<String>,
    pub keys: WgKeyPair,
    pub internal_address: Ipv4Addr,
    pub state: PeerState,
    pub last_seen_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Peer {
    pub fn public_key(&self) -> &str {
        &self.keys.public_key
    }

    /// State a re-enabled peer falls back to when no live entry could be applied
    pub fn resting_state(&self) -> PeerState {
        if self.site_id.is_some() {
            PeerState::Associated
        } else {
            PeerState::Pending
        }
    }
}

/// Input for creating a peer; the address is allocated by the store
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub hardware_id: String,
    pub tenant_id: Option<String>,
    pub keys: WgKeyPair,
}

/// Peer view safe to hand to any authorized caller (no private key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: Uuid,
    pub hardware_id: String,
    pub tenant_id: Option<String>,
    pub site_id: Option<String>,
    pub public_key: String,
    pub internal_address: Ipv4Addr,
    pub state: PeerState,
    pub last_seen_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Peer> for PeerSummary {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            hardware_id: peer.hardware_id.clone(),
            tenant_id: peer.tenant_id.clone(),
            site_id: peer.site_id.clone(),
            public_key: peer.keys.public_key.clone(),
            internal_address: peer.internal_address,
            state: peer.state,
            last_seen_at: peer.last_seen_at,
            last_error: peer.last_error.clone(),
            created_at: peer.created_at,
            updated_at: peer.updated_at,
        }
    }
}

/// Site directory entry, used for tenant checks on association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub created_at: i64,
}

/// Filter for listing peers
#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    pub tenant_id: Option<String>,
    pub state: Option<PeerState>,
}

impl PeerFilter {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            state: None,
        }
    }

    pub fn with_state(mut self, state: PeerState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Authorization scope of an authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tenant_id")]
pub enum Scope {
    /// Unrestricted
    Admin,
    /// May manage peers of one tenant
    Tenant(String),
    /// May only list peers of one tenant
    ReadOnly(String),
}

/// Already-authenticated caller identity handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub subject: String,
    pub scope: Scope,
}

impl Caller {
    pub fn admin(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scope: Scope::Admin,
        }
    }

    pub fn tenant(subject: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scope: Scope::Tenant(tenant_id.into()),
        }
    }

    pub fn read_only(subject: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scope: Scope::ReadOnly(tenant_id.into()),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.scope, Scope::Admin)
    }

    pub fn can_mutate(&self) -> bool {
        !matches!(self.scope, Scope::ReadOnly(_))
    }

    /// Tenant the caller is restricted to, if any
    pub fn tenant_id(&self) -> Option<&str> {
        match &self.scope {
            Scope::Admin => None,
            Scope::Tenant(t) | Scope::ReadOnly(t) => Some(t),
        }
    }

    /// Whether a resource owned by `owner` is visible to this caller
    pub fn can_see(&self, owner: Option<&str>) -> bool {
        match self.tenant_id() {
            None => true,
            Some(t) => owner == Some(t),
        }
    }
}

/// Normalize a hardware identifier (trimmed, lowercase).
pub fn normalize_hardware_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}
