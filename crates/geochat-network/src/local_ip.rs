//! Local address detection
//!
//! The advertised RPC host is the address of the interface the OS routes
//! outbound traffic through. Connecting a UDP socket picks that interface
//! without sending a datagram.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::UdpSocket;

/// Probe target; connecting a UDP socket sends nothing
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Address of the interface the OS would route outbound traffic through.
///
/// Falls back to `127.0.0.1` when there is no route (offline host, sandbox).
pub async fn detect_local_ip() -> IpAddr {
    match probe().await {
        Ok(ip) => ip,
        Err(e) => {
            tracing::debug!("Local IP probe failed ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn probe() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(PROBE_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_local_ip_is_ipv4() {
        let ip = detect_local_ip().await;
        assert!(ip.is_ipv4());
        assert!(!ip.is_unspecified());
    }
}
