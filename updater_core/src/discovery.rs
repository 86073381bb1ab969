use crate::config::ProtocolConfig;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive buffer for discovery datagrams. The tokens are a handful of
/// bytes; anything that does not fit cannot be an exact match anyway.
const RECV_BUF_LEN: usize = 64;

/// Broadcast for a device on the LAN and wait once for its reply.
///
/// Returns the sender's address only if a datagram arrives within `wait`
/// and its payload equals the response token exactly. A wrong payload, a
/// timeout and a transport error all collapse into `None`: the caller is
/// expected to fall back to a manually supplied address.
pub async fn discover(cfg: &ProtocolConfig, wait: Duration) -> Option<IpAddr> {
    match try_discover(cfg, wait).await {
        Ok(found) => found,
        Err(e) => {
            warn!("discovery failed: {e:#}");
            None
        }
    }
}

async fn try_discover(cfg: &ProtocolConfig, wait: Duration) -> Result<Option<IpAddr>> {
    // Ephemeral port; the socket is dropped (closed) on every return path
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let target = SocketAddr::new(cfg.broadcast_addr, cfg.udp_port);
    info!("sending discovery broadcast to {target}");
    socket.send_to(cfg.discovery_request, target).await?;

    // Exactly one receive attempt: the first datagram decides the outcome
    let mut buf = [0u8; RECV_BUF_LEN];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, addr))) => {
            if &buf[..len] == cfg.discovery_response {
                info!("device discovered at {}", addr.ip());
                Ok(Some(addr.ip()))
            } else {
                warn!("reply from {addr} did not match the response token, ignoring");
                Ok(None)
            }
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            info!("discovery timed out, no device found");
            Ok(None)
        }
    }
}

/// Device-side half of the handshake: answers every exact request-token
/// datagram with the response token, sent back to the requester.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    request: &'static [u8],
    response: &'static [u8],
}

impl DiscoveryResponder {
    pub async fn bind(cfg: &ProtocolConfig) -> Result<Self> {
        // Bind to 0.0.0.0 so broadcast datagrams are delivered on all
        // interfaces
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.udp_port)).await?;
        Ok(Self {
            socket,
            request: cfg.discovery_request,
            response: cfg.discovery_response,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer discovery requests until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = res?;
                    if &buf[..len] == self.request {
                        debug!("discovery request from {addr}");
                        let _ = self.socket.send_to(self.response, addr).await;
                    }
                    // Foreign datagrams are ignored silently
                }
            }
        }
    }
}
