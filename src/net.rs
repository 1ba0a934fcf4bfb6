//! Send-only socket handles
//!
//! The UDP listener and datagram demultiplexer live outside the core. What
//! the core holds is a send-only handle bound to the current peer address;
//! on STUN migration the handle is cloned onto the new address while the
//! listener keeps receiving on the shared socket.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::{ErrorKind, Result, RtcError};

/// Send-only view of the session's UDP path
#[async_trait]
pub trait SendOnlySocket: Send + Sync {
    /// Write one datagram to the current peer
    async fn sendto(&self, data: &[u8]) -> Result<()>;

    /// Peer identity, `ip:port`
    fn peer_id(&self) -> String;

    /// Peer address
    fn peer_addr(&self) -> SocketAddr;

    /// Clone this handle onto a new peer address
    fn clone_to_peer(&self, peer: SocketAddr) -> Arc<dyn SendOnlySocket>;
}

/// Send-only handle over the shared UDP socket
pub struct UdpMuxSocket {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpMuxSocket {
    /// Create a handle for one peer over the shared socket
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl SendOnlySocket for UdpMuxSocket {
    async fn sendto(&self, data: &[u8]) -> Result<()> {
        self.socket
            .send_to(data, self.peer)
            .await
            .map_err(|e| RtcError::new(ErrorKind::Socket, format!("sendto {}: {}", self.peer, e)))?;
        Ok(())
    }

    fn peer_id(&self) -> String {
        self.peer.to_string()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn clone_to_peer(&self, peer: SocketAddr) -> Arc<dyn SendOnlySocket> {
        Arc::new(UdpMuxSocket {
            socket: Arc::clone(&self.socket),
            peer,
        })
    }
}
