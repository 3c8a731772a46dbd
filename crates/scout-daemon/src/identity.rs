//! Resolve who this node is: hostname plus the IP it advertises.

use scout_core::NodeIdentity;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{UdpSocket, lookup_host};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Could not determine hostname")]
    NoHostname,
    #[error("No non-loopback IPv4 address found for {0}")]
    NoAddress(String),
}

/// Resolve the identity, honoring configured overrides.
pub async fn resolve(
    hostname_override: Option<&str>,
    ip_override: Option<IpAddr>,
) -> Result<NodeIdentity, IdentityError> {
    let hostname = match hostname_override {
        Some(name) => name.to_string(),
        None => local_hostname().ok_or(IdentityError::NoHostname)?,
    };

    let ip = match ip_override {
        Some(ip) => ip,
        None => match lookup_ipv4(&hostname).await {
            Some(ip) => ip,
            None => {
                debug!("DNS gave no usable address for {}, trying route lookup", hostname);
                route_ipv4()
                    .await
                    .ok_or_else(|| IdentityError::NoAddress(hostname.clone()))?
            }
        },
    };

    Ok(NodeIdentity::new(hostname, ip))
}

fn local_hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return Some(name);
        }
    }
    match std::fs::read_to_string("/etc/hostname") {
        Ok(contents) => first_hostname(&contents),
        Err(e) => {
            warn!("Failed to read /etc/hostname: {}", e);
            None
        }
    }
}

fn first_hostname(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
}

async fn lookup_ipv4(hostname: &str) -> Option<IpAddr> {
    let addrs = lookup_host((hostname, 0)).await.ok()?;
    pick_ipv4(addrs.map(|a| a.ip()))
}

/// First non-loopback IPv4 address.
fn pick_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    addrs
        .into_iter()
        .find(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified()))
}

/// Source address the kernel would use to reach the outside. No packet is sent.
async fn route_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .ok()?;
    socket
        .connect(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 9)))
        .await
        .ok()?;
    let local = socket.local_addr().ok()?;
    pick_ipv4([local.ip()])
}
