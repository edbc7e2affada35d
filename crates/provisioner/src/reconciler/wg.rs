//! Live peer table driven through the `wg` tool

use super::{LivePeer, LivePeerTable};
use async_trait::async_trait;
use meshprov_common::{Error, Result};
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::debug;

/// Drives a local WireGuard interface with `wg set` / `wg show`
#[derive(Debug, Clone)]
pub struct WgCommandTable {
    binary: String,
    interface: String,
}

impl WgCommandTable {
    pub fn new(binary: &str, interface: &str) -> Self {
        Self {
            binary: binary.to_string(),
            interface: interface.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::LiveApplyFailed(format!("Failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::LiveApplyFailed(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl LivePeerTable for WgCommandTable {
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let allowed = format!("{}/32", address);
        self.run(&[
            "set",
            &self.interface,
            "peer",
            public_key,
            "allowed-ips",
            &allowed,
        ])
        .await
        .map(|_| ())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        // `wg` treats removal of an unknown peer as a no-op
        self.run(&["set", &self.interface, "peer", public_key, "remove"])
            .await
            .map(|_| ())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>> {
        let out = self.run(&["show", &self.interface, "allowed-ips"]).await?;
        Ok(parse_allowed_ips(&out))
    }
}

/// Parse `wg show <iface> allowed-ips` output.
///
/// Each line is `<public key>\t<cidr> <cidr> ...` or `<public key>\t(none)`.
/// The first IPv4 host route is taken as the peer's address.
fn parse_allowed_ips(output: &str) -> Vec<LivePeer> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let public_key = fields.next()?.to_string();
            let address = fields.find_map(|cidr| {
                let (ip, prefix) = cidr.split_once('/')?;
                if prefix != "32" {
                    return None;
                }
                ip.parse::<Ipv4Addr>().ok()
            });
            Some(LivePeer {
                public_key,
                address,
            })
        })
        .collect()
}
