//! Device onboarding configuration
//!
//! Renders what a device needs to join the overlay: its own key and address
//! plus the server peer. Output contains the device's private key and must
//! only be handed to the device (or an admin).

use crate::config::{OverlayConfig, ScriptFormat};
use meshprov_common::{Peer, Result};

#[derive(Debug, Clone)]
pub struct DeviceConfigRenderer {
    format: ScriptFormat,
    device_interface: String,
    server_public_key: String,
    endpoint_host: String,
    endpoint_port: u16,
    allowed_addresses: String,
    keepalive: u16,
}

impl DeviceConfigRenderer {
    pub fn from_config(overlay: &OverlayConfig) -> Result<Self> {
        Ok(Self::with_server_key(overlay, overlay.resolve_server_public_key()?))
    }

    /// Build with an already resolved server public key
    pub fn with_server_key(overlay: &OverlayConfig, server_public_key: String) -> Self {
        Self {
            format: overlay.script_format,
            device_interface: overlay.device_interface.clone(),
            server_public_key,
            endpoint_host: overlay.endpoint_host.clone(),
            endpoint_port: overlay.endpoint_port,
            allowed_addresses: overlay.allowed_addresses.clone(),
            keepalive: overlay.keepalive,
        }
    }

    pub fn format(&self) -> ScriptFormat {
        self.format
    }

    /// Render in the configured format
    pub fn render(&self, peer: &Peer) -> String {
        self.render_as(peer, self.format)
    }

    pub fn render_as(&self, peer: &Peer, format: ScriptFormat) -> String {
        match format {
            ScriptFormat::Routeros => self.routeros(peer),
            ScriptFormat::WgQuick => self.wg_quick(peer),
        }
    }

    fn routeros(&self, peer: &Peer) -> String {
        format!(
            r#"# MikroTik WireGuard onboarding script
# Hardware ID: {hardware_id}
/interface wireguard add name={iface} private-key="{private_key}"
/ip address add address={address}/32 interface={iface}
/interface wireguard peers add interface={iface} public-key="{server_key}" endpoint-address={host} endpoint-port={port} allowed-address={allowed} persistent-keepalive={keepalive}s
"#,
            hardware_id = peer.hardware_id,
            iface = self.device_interface,
            private_key = peer.keys.private_key,
            address = peer.internal_address,
            server_key = self.server_public_key,
            host = self.endpoint_host,
            port = self.endpoint_port,
            allowed = self.allowed_addresses,
            keepalive = self.keepalive,
        )
    }

    fn wg_quick(&self, peer: &Peer) -> String {
        format!(
            r#"# WireGuard configuration
# Hardware ID: {hardware_id}

[Interface]
PrivateKey = {private_key}
Address = {address}/32

[Peer]
PublicKey = {server_key}
AllowedIPs = {allowed}
Endpoint = {host}:{port}
PersistentKeepalive = {keepalive}
"#,
            hardware_id = peer.hardware_id,
            private_key = peer.keys.private_key,
            address = peer.internal_address,
            server_key = self.server_public_key,
            allowed = self.allowed_addresses,
            host = self.endpoint_host,
            port = self.endpoint_port,
            keepalive = self.keepalive,
        )
    }
}
