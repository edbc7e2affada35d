//! Persisted peer snapshot
//!
//! A list of `[Peer]` sections the overlay host loads with
//! `wg addconf <iface> <file>` after a restart. Writes go to a temp file and
//! are renamed into place, so a crash never leaves a half-written snapshot.

use super::{LivePeer, PeerSnapshot};
use async_trait::async_trait;
use meshprov_common::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const HEADER: &str = "# Managed by meshprov. Do not edit.\n";

pub struct FileSnapshot {
    path: PathBuf,
    // Serializes read-modify-write within this process
    lock: Mutex<()>,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<LivePeer>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, peers: &[LivePeer]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, render(peers)).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("Wrote {} peers to {}", peers.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl PeerSnapshot for FileSnapshot {
    async fn upsert(&self, public_key: &str, address: Ipv4Addr) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut peers = self.read().await?;
        match peers.iter_mut().find(|p| p.public_key == public_key) {
            Some(existing) if existing.address == Some(address) => return Ok(()),
            Some(existing) => existing.address = Some(address),
            None => peers.push(LivePeer::new(public_key, address)),
        }
        self.write(&peers).await
    }

    async fn remove(&self, public_key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut peers = self.read().await?;
        let before = peers.len();
        peers.retain(|p| p.public_key != public_key);
        if peers.len() == before {
            return Ok(());
        }
        self.write(&peers).await
    }

    async fn entries(&self) -> Result<Vec<LivePeer>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }
}

fn render(peers: &[LivePeer]) -> String {
    let mut out = String::from(HEADER);
    for peer in peers {
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", peer.public_key));
        if let Some(addr) = peer.address {
            out.push_str(&format!("AllowedIPs = {}/32\n", addr));
        }
    }
    out
}

fn parse(content: &str) -> Result<Vec<LivePeer>> {
    let mut peers: Vec<LivePeer> = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "[Peer]" {
            peers.push(LivePeer {
                public_key: String::new(),
                address: None,
            });
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::Internal(format!("Snapshot line {}: expected key = value", lineno + 1))
        })?;
        let current = peers.last_mut().ok_or_else(|| {
            Error::Internal(format!("Snapshot line {}: entry outside [Peer]", lineno + 1))
        })?;

        match key.trim() {
            "PublicKey" => current.public_key = value.trim().to_string(),
            "AllowedIPs" => {
                current.address = value
                    .split(',')
                    .filter_map(|c| c.trim().strip_suffix("/32"))
                    .find_map(|ip| ip.parse().ok());
            }
            _ => {}
        }
    }

    peers.retain(|p| !p.public_key.is_empty());
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_remove_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = FileSnapshot::new(dir.path().join("state").join("wg0.peers.conf"));

        assert!(snapshot.entries().await.unwrap().is_empty());

        snapshot.upsert("key-a", Ipv4Addr::new(10, 10, 10, 10)).await.unwrap();
        snapshot.upsert("key-b", Ipv4Addr::new(10, 10, 10, 11)).await.unwrap();
        snapshot.upsert("key-a", Ipv4Addr::new(10, 10, 10, 12)).await.unwrap();

        let reopened = FileSnapshot::new(snapshot.path());
        assert_eq!(
            reopened.entries().await.unwrap(),
            vec![
                LivePeer::new("key-a", Ipv4Addr::new(10, 10, 10, 12)),
                LivePeer::new("key-b", Ipv4Addr::new(10, 10, 10, 11)),
            ]
        );

        reopened.remove("key-a").await.unwrap();
        reopened.remove("key-a").await.unwrap();
        assert_eq!(reopened.entries().await.unwrap().len(), 1);
    }

    #[test]
    fn test_rendered_format() {
        let text = render(&[LivePeer::new("abc=", Ipv4Addr::new(10, 10, 10, 10))]);
        assert!(text.contains("[Peer]\nPublicKey = abc=\nAllowedIPs = 10.10.10.10/32\n"));
        assert_eq!(parse(&text).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse("PublicKey = x").is_err());
        assert!(parse("[Peer]\nnonsense").is_err());
    }
}
