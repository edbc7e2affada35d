//! Provisioner configuration

use meshprov_common::{crypto, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides `overlay.server_private_key`
pub const SERVER_PRIVATE_KEY_ENV: &str = "MESHPROV_SERVER_PRIVATE_KEY";

/// Provisioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Address pool
    pub pool: PoolConfig,

    /// Network-side overlay settings rendered into device configs
    pub overlay: OverlayConfig,

    /// Live peer table control surface
    pub live: LiveTableConfig,

    /// Reachability probe
    pub probe: ProbeConfig,

    /// Bounds on external calls
    pub timeouts: TimeoutConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            store_path: meshprov_common::default_store_path(),
            pool: PoolConfig::default(),
            overlay: OverlayConfig::default(),
            live: LiveTableConfig::default(),
            probe: ProbeConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Address pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// IPv4 network in CIDR notation
    pub cidr: String,

    /// Host offsets below this value are never allocated (network, gateway, infra)
    pub reserved_low: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cidr: "10.10.10.0/24".to_string(),
            reserved_low: 10,
        }
    }
}

/// Device config output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptFormat {
    /// MikroTik RouterOS script
    Routeros,
    /// wg-quick configuration file
    WgQuick,
}

impl Default for ScriptFormat {
    fn default() -> Self {
        Self::Routeros
    }
}

/// Overlay (server side) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Server WireGuard interface on the overlay host
    pub interface: String,

    /// Interface name created on the device
    pub device_interface: String,

    /// Public endpoint devices dial
    pub endpoint_host: String,

    pub endpoint_port: u16,

    /// Server public key; derived from the private key when unset
    pub server_public_key: Option<String>,

    /// Server private key; only used to derive the public key
    pub server_private_key: Option<String>,

    /// Addresses routed through the tunnel on the device
    pub allowed_addresses: String,

    /// Persistent keepalive in seconds
    pub keepalive: u16,

    pub script_format: ScriptFormat,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            device_interface: "wg0".to_string(),
            endpoint_host: "vpn.example.com".to_string(),
            endpoint_port: 51820,
            server_public_key: None,
            server_private_key: None,
            allowed_addresses: "0.0.0.0/0".to_string(),
            keepalive: 25,
            script_format: ScriptFormat::default(),
        }
    }
}

impl OverlayConfig {
    /// Resolve the server public key from config or the private key override
    pub fn resolve_server_public_key(&self) -> Result<String> {
        self.resolve_server_public_key_with(std::env::var(SERVER_PRIVATE_KEY_ENV).ok().as_deref())
    }

    /// Same as [`Self::resolve_server_public_key`], with the override passed in
    pub fn resolve_server_public_key_with(&self, private_override: Option<&str>) -> Result<String> {
        if let Some(private) = private_override {
            return crypto::public_key_from_private(private);
        }
        if let Some(public) = &self.server_public_key {
            crypto::validate_key(public)?;
            return Ok(public.trim().to_string());
        }
        if let Some(private) = &self.server_private_key {
            return crypto::public_key_from_private(private);
        }
        Err(Error::InvalidConfig(format!(
            "overlay.server_public_key is not set (or set {})",
            SERVER_PRIVATE_KEY_ENV
        )))
    }
}

/// Which live peer table implementation to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveBackend {
    /// Local `wg` tool against the overlay interface
    Wg,
    /// Remote RouterOS REST API
    Routeros,
    /// In-process table (dry run)
    Memory,
}

impl Default for LiveBackend {
    fn default() -> Self {
        Self::Wg
    }
}

/// Live peer table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveTableConfig {
    pub backend: LiveBackend,

    /// Path to the `wg` binary
    pub wg_binary: String,

    /// Persisted peer snapshot reloaded by the overlay on restart
    pub snapshot_path: Option<PathBuf>,

    /// Extra attempts at persisting the snapshot after the live table changed
    pub snapshot_retries: u32,

    pub routeros: RouterOsConfig,
}

impl Default for LiveTableConfig {
    fn default() -> Self {
        Self {
            backend: LiveBackend::default(),
            wg_binary: "wg".to_string(),
            snapshot_path: None,
            snapshot_retries: 2,
            routeros: RouterOsConfig::default(),
        }
    }
}

/// RouterOS REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterOsConfig {
    /// e.g. `https://192.168.88.1`
    pub base_url: String,
    pub username: String,
    pub password: Option<String>,
    /// WireGuard interface on the router
    pub interface: String,
    /// Accept self-signed router certificates
    pub accept_invalid_certs: bool,
}

impl Default for RouterOsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://192.168.88.1".to_string(),
            username: "admin".to_string(),
            password: None,
            interface: "wg0".to_string(),
            accept_invalid_certs: false,
        }
    }
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// TCP port dialed on the peer's overlay address
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: 22,
            timeout_ms: 1500,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Timeouts for store and live table calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub store_ms: u64,
    pub live_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_ms: 5000,
            live_ms: 5000,
        }
    }
}

impl TimeoutConfig {
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    pub fn live(&self) -> Duration {
        Duration::from_millis(self.live_ms)
    }
}

impl ProvisionerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("peers.db")
    }

    /// Get the snapshot path
    pub fn snapshot_path(&self) -> PathBuf {
        self.live
            .snapshot_path
            .clone()
            .unwrap_or_else(|| self.store_path.join(format!("{}.peers.conf", self.overlay.interface)))
    }
}
