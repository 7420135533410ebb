//! UDP simultaneous-open hole punching
//!
//! Both sides fire probes at each other; the first probe or response that
//! comes back from the peer's IP proves the path. Three strategies race:
//! the advertised address, an optional LAN address, and ports adjacent to
//! the advertised one for NATs that allocate sequentially.

use super::{PunchAdapter, PunchError};
use crate::contact::Contact;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

const PROBE_MARKER: &[u8] = b"KADMESH_PROBE";
const RESPONSE_MARKER: &[u8] = b"KADMESH_PROBE_ACK";

const MAX_PROBE_ATTEMPTS: usize = 20;
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_PORT_OFFSET: u16 = 10;

/// Overall deadline for one punch
pub const PUNCH_DEADLINE: Duration = Duration::from_secs(5);

/// [`PunchAdapter`] probing from a dedicated UDP socket
#[derive(Debug)]
pub struct UdpHolePuncher {
    socket: UdpSocket,
}

impl UdpHolePuncher {
    /// Bind the probing socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn bind(addr: SocketAddr) -> Result<Self, PunchError> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    /// Address the probes leave from
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr, PunchError> {
        Ok(self.socket.local_addr()?)
    }

    /// Race all strategies against `external` (and `internal`, if given)
    ///
    /// # Errors
    ///
    /// Returns `PunchError::Timeout` if nothing answers before
    /// [`PUNCH_DEADLINE`]
    pub async fn punch_addr(
        &self,
        external: SocketAddr,
        internal: Option<SocketAddr>,
    ) -> Result<SocketAddr, PunchError> {
        tokio::select! {
            result = self.probe_repeatedly(external, MAX_PROBE_ATTEMPTS, false) => result,
            result = self.probe_internal(internal) => result,
            result = self.probe_adjacent_ports(external) => result,
            () = tokio::time::sleep(PUNCH_DEADLINE) => Err(PunchError::Timeout),
        }
    }

    /// Send one probe to keep an opened binding alive
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be sent
    pub async fn keepalive(&self, peer: SocketAddr) -> Result<(), PunchError> {
        self.socket.send_to(PROBE_MARKER, peer).await?;
        Ok(())
    }

    /// Hand the socket over for application traffic
    #[must_use]
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    async fn probe_repeatedly(
        &self,
        peer: SocketAddr,
        attempts: usize,
        exact: bool,
    ) -> Result<SocketAddr, PunchError> {
        for _ in 0..attempts {
            if let Some(from) = self.probe_once(peer, exact).await? {
                return Ok(from);
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
        Err(PunchError::Timeout)
    }

    async fn probe_internal(&self, peer: Option<SocketAddr>) -> Result<SocketAddr, PunchError> {
        let peer = peer.ok_or(PunchError::NoInternalAddress)?;
        self.probe_repeatedly(peer, MAX_PROBE_ATTEMPTS / 2, true).await
    }

    async fn probe_adjacent_ports(&self, peer: SocketAddr) -> Result<SocketAddr, PunchError> {
        let base = peer.port();
        for offset in 1..=MAX_PORT_OFFSET {
            for port in [base.wrapping_add(offset), base.wrapping_sub(offset)] {
                let candidate = SocketAddr::new(peer.ip(), port);
                if let Some(from) = self.probe_once(candidate, false).await? {
                    return Ok(from);
                }
            }
            tokio::time::sleep(PROBE_INTERVAL / 2).await;
        }
        Err(PunchError::Timeout)
    }

    /// One probe and a short wait for an answer from `peer`'s IP, or from
    /// `peer` itself when `exact`
    async fn probe_once(&self, peer: SocketAddr, exact: bool) -> Result<Option<SocketAddr>, PunchError> {
        self.socket.send_to(PROBE_MARKER, peer).await?;
        match tokio::time::timeout(PROBE_TIMEOUT, self.recv_probe()).await {
            Ok(Ok(from)) if from == peer || (!exact && from.ip() == peer.ip()) => Ok(Some(from)),
            _ => Ok(None),
        }
    }

    async fn recv_probe(&self) -> std::io::Result<SocketAddr> {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match &buf[..len] {
                m if m == PROBE_MARKER => {
                    let _ = self.socket.send_to(RESPONSE_MARKER, from).await;
                    return Ok(from);
                }
                m if m == RESPONSE_MARKER => return Ok(from),
                _ => tracing::trace!("Ignoring non-probe datagram from {}", from),
            }
        }
    }
}

#[async_trait]
impl PunchAdapter for UdpHolePuncher {
    async fn punch(&self, rendezvous: &Contact, target: &Contact) -> Result<SocketAddr, PunchError> {
        tracing::debug!(
            "Simultaneous open towards {} (rendezvous {})",
            target.addr,
            rendezvous.addr
        );
        self.punch_addr(target.addr, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::NodeId;

    async fn puncher() -> UdpHolePuncher {
        UdpHolePuncher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[test]
    fn test_punch_error_display() {
        assert_eq!(PunchError::Timeout.to_string(), "Hole punching timeout");
        assert_eq!(
            PunchError::NoInternalAddress.to_string(),
            "No internal address for LAN strategy"
        );
        let io: PunchError = std::io::Error::other("boom").into();
        assert!(matches!(io, PunchError::Io(_)));
    }

    #[tokio::test]
    async fn test_simultaneous_open_on_loopback() {
        let a = puncher().await;
        let b = puncher().await;
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();

        let (ra, rb) = tokio::join!(a.punch_addr(addr_b, Some(addr_b)), b.punch_addr(addr_a, Some(addr_a)));
        assert_eq!(ra.unwrap().ip(), addr_b.ip());
        assert_eq!(rb.unwrap().ip(), addr_a.ip());
    }

    #[tokio::test]
    async fn test_adapter_targets_contact_address() {
        let a = puncher().await;
        let b = puncher().await;
        let target = Contact::new(NodeId::random(), b.local_addr().unwrap());
        let rendezvous = Contact::new(NodeId::random(), "127.0.0.1:9".parse().unwrap());

        let responder = tokio::spawn(async move {
            let _ = b.recv_probe().await;
            b
        });
        let reached = PunchAdapter::punch(&a, &rendezvous, &target).await.unwrap();
        assert_eq!(reached.ip(), target.addr.ip());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_and_into_socket() {
        let p = puncher().await;
        let local = p.local_addr().unwrap();
        p.keepalive("127.0.0.1:12345".parse().unwrap()).await.unwrap();
        assert_eq!(p.into_socket().local_addr().unwrap(), local);
    }
}
