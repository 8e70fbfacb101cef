//! UDP discovery.
//!
//! Any datagram sent to the discovery port is answered with the scheduler's
//! TCP port as a big-endian `u16`, so workers and submitters on the local
//! network can locate the scheduler with a single broadcast.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub struct DiscoveryResponder {
    socket: UdpSocket,
    tcp_port: u16,
}

impl DiscoveryResponder {
    pub async fn bind(addr: SocketAddr, tcp_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, tcp_port })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer probes until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let reply = self.tcp_port.to_be_bytes();
        let mut buf = [0u8; 512];
        if let Ok(addr) = self.socket.local_addr() {
            tracing::info!(addr = %addr, tcp_port = self.tcp_port, "Discovery responder started");
        }

        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = shutdown.cancelled() => break,
            };

            match received {
                Ok((_, peer)) => {
                    tracing::debug!(peer = %peer, "Discovery probe");
                    if let Err(e) = self.socket.send_to(&reply, peer).await {
                        tracing::warn!(
                            peer = %peer,
                            error = %e,
                            "Failed to answer discovery probe"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery receive failed");
                }
            }
        }

        tracing::info!("Discovery responder stopped");
    }
}

/// Probe `target` (usually a broadcast address) and return the scheduler's
/// TCP address from the first reply.
pub async fn discover(target: SocketAddr, timeout: Duration) -> Result<SocketAddr> {
    let bind = if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.set_broadcast(true)?;
    socket.send_to(&[], target).await?;

    let mut buf = [0u8; 2];
    let (len, responder) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "no discovery reply")
        })??;
    if len != buf.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("discovery reply of {} bytes", len),
        )
        .into());
    }

    Ok(SocketAddr::new(responder.ip(), u16::from_be_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_returns_tcp_port() {
        let responder = DiscoveryResponder::bind("127.0.0.1:0".parse().unwrap(), 4337)
            .await
            .unwrap();
        let addr = responder.local_addr().unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(responder.run(token.clone()));

        let found = discover(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(found, "127.0.0.1:4337".parse().unwrap());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn discover_times_out_without_responder() {
        // bound but silent
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        assert!(discover(addr, Duration::from_millis(50)).await.is_err());
    }
}
