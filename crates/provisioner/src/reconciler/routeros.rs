//! Live peer table on a RouterOS overlay router, via its REST API

use super::{LivePeer, LivePeerTable};
use crate::config::RouterOsConfig;
use async_trait::async_trait;
use meshprov_common::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

const PEERS_PATH: &str = "rest/interface/wireguard/peers";

/// Peer record as returned by `/rest/interface/wireguard/peers`
#[derive(Debug, Deserialize)]
struct RosPeer {
    #[serde(rename = ".id")]
    id: String,
    #[serde(rename = "public-key")]
    public_key: String,
    #[serde(rename = "allowed-address", default)]
    allowed_address: String,
    #[serde(default)]
    interface: String,
}

impl RosPeer {
    fn to_live(&self) -> LivePeer {
        let address = self.allowed_address.split(',').find_map(|cidr| {
            let (ip, prefix) = cidr.trim().split_once('/')?;
            if prefix != "32" {
                return None;
            }
            ip.parse::<Ipv4Addr>().ok()
        });
        LivePeer {
            public_key: self.public_key.clone(),
            address,
        }
    }
}

pub struct RouterOsTable {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: Option<String>,
    interface: String,
}

impl RouterOsTable {
    pub fn new(config: &RouterOsConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("RouterOS client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            interface: config.interface.clone(),
        })
    }

    fn url(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(id) => format!("{}/{}/{}", self.base_url, PEERS_PATH, id),
            None => format!("{}/{}", self.base_url, PEERS_PATH),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .basic_auth(&self.username, self.password.as_deref())
            .send()
            .await
            .map_err(|e| Error::LiveApplyFailed(format!("RouterOS request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::LiveApplyFailed(format!(
                "RouterOS returned {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(response)
    }

    async fn fetch(&self) -> Result<Vec<RosPeer>> {
        let response = self
            .send(self.client.get(self.url(None)).query(&[("interface", &self.interface)]))
            .await?;
        let peers: Vec<RosPeer> = response
            .json()
            .await
            .map_err(|e| Error::LiveApplyFailed(format!("Malformed RouterOS peer list: {}", e)))?;
        Ok(peers
            .into_iter()
            .filter(|p| p.interface.is_empty() || p.interface == self.interface)
            .collect())
    }

    async fn find(&self, public_key: &str) -> Result<Option<RosPeer>> {
        Ok(self
            .fetch()
            .await?
            .into_iter()
            .find(|p| p.public_key == public_key))
    }
}

#[async_trait]
impl LivePeerTable for RouterOsTable {
    async fn add_peer(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let allowed = format!("{}/32", address);

        match self.find(public_key).await? {
            Some(existing) => {
                debug!("Updating RouterOS peer {} ({})", public_key, existing.id);
                self.send(
                    self.client
                        .patch(self.url(Some(existing.id.as_str())))
                        .json(&json!({ "allowed-address": allowed })),
                )
                .await?;
            }
            None => {
                debug!("Adding RouterOS peer {}", public_key);
                self.send(self.client.put(self.url(None)).json(&json!({
                    "interface": self.interface,
                    "public-key": public_key,
                    "allowed-address": allowed,
                })))
                .await?;
            }
        }
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let Some(existing) = self.find(public_key).await? else {
            return Ok(());
        };
        self.send(self.client.delete(self.url(Some(existing.id.as_str()))))
            .await?;
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>> {
        Ok(self.fetch().await?.iter().map(RosPeer::to_live).collect())
    }
}
