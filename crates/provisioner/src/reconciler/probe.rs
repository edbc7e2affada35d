//! TCP connect reachability probe

use super::ReachabilityProbe;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Considers a peer reachable when a TCP connect to `address:port` completes
/// within the timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self, address: Ipv4Addr) -> bool {
        let target = SocketAddr::from((address, self.port));
        match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe {} failed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("Probe {} timed out after {:?}", target, self.timeout);
                false
            }
        }
    }
}
