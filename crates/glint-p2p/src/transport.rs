//! The boundary to the connection layer.
//!
//! Connection establishment, stream multiplexing and the encryption handshake
//! live behind the `Transport` trait. The light client only dials, hangs up and
//! opens one substream per request.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::multiaddr::Protocol as AddrProtocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A negotiated, bidirectional byte stream for one request.
pub trait Substream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Substream for T {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Dial to {peer} failed: {reason}")]
    DialFailed { peer: PeerId, reason: String },

    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("Peer does not support protocol {0}")]
    UnsupportedProtocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Connection layer used by the light client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection to `peer` using any of `addresses`.
    async fn dial(&self, peer: PeerId, addresses: &[Multiaddr]) -> Result<(), TransportError>;

    /// Close every connection to `peer`.
    async fn disconnect(&self, peer: PeerId);

    /// Open a substream to a connected peer and negotiate `protocol_id` on it.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol_id: &str,
    ) -> Result<Box<dyn Substream>, TransportError>;
}

/// Transport a multiaddress would be dialed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Tcp,
    Quic,
}

impl TransportType {
    /// The dialable transport of an address, if it has one.
    pub fn from_multiaddr(address: &Multiaddr) -> Option<Self> {
        let mut has_ip = false;
        let mut transport = None;
        for component in address.iter() {
            match component {
                AddrProtocol::Ip4(_)
                | AddrProtocol::Ip6(_)
                | AddrProtocol::Dns(_)
                | AddrProtocol::Dns4(_)
                | AddrProtocol::Dns6(_) => has_ip = true,
                AddrProtocol::Tcp(_) if transport.is_none() => transport = Some(TransportType::Tcp),
                AddrProtocol::QuicV1 => transport = Some(TransportType::Quic),
                // Browser and relayed transports are not dialable from here
                AddrProtocol::Ws(_)
                | AddrProtocol::Wss(_)
                | AddrProtocol::WebRTCDirect
                | AddrProtocol::WebTransport
                | AddrProtocol::P2pCircuit => return None,
                _ => {}
            }
        }
        if has_ip {
            transport
        } else {
            None
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TransportType::Tcp => "TCP (noise, yamux)",
            TransportType::Quic => "QUIC v1",
        }
    }
}

/// Connection layer settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Give up on a dial after this long.
    pub dial_timeout_ms: u64,
    /// Hard ceiling on simultaneous connections.
    pub max_peers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 10_000,
            max_peers: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_and_quic_addresses_are_dialable() {
        let tcp: Multiaddr = "/ip4/10.0.0.1/tcp/9000".parse().unwrap();
        let quic: Multiaddr = "/ip4/10.0.0.1/udp/9001/quic-v1".parse().unwrap();
        let dns: Multiaddr = "/dns4/node.example.org/tcp/9000".parse().unwrap();
        assert_eq!(TransportType::from_multiaddr(&tcp), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_multiaddr(&quic), Some(TransportType::Quic));
        assert_eq!(TransportType::from_multiaddr(&dns), Some(TransportType::Tcp));
    }

    #[test]
    fn test_browser_and_relay_addresses_rejected() {
        let wss: Multiaddr = "/ip4/10.0.0.1/tcp/443/wss".parse().unwrap();
        let udp: Multiaddr = "/ip4/10.0.0.1/udp/9000".parse().unwrap();
        let bare: Multiaddr = "/tcp/9000".parse().unwrap();
        assert_eq!(TransportType::from_multiaddr(&wss), None);
        assert_eq!(TransportType::from_multiaddr(&udp), None);
        assert_eq!(TransportType::from_multiaddr(&bare), None);
    }
}
