//! # Transport & Collaborator Seams
//!
//! The core never opens sockets or touches the kernel. It talks to the
//! outside world through two traits:
//!
//! - [`Transport`] moves [`Packet`]s: per-interface broadcasts for the radar,
//!   unicasts for floods and map requests, and the inbound stream.
//! - [`Collaborators`] receives the side effects the protocol produces:
//!   kernel route changes, rehook requests, Internet-gateway blocks.
//!
//! The node binary provides UDP and logging implementations; the scenario
//! tests plug in in-memory ones.
//!
//! Request/response exchanges (map requests) are matched by `(peer, id)` in
//! a [`ReplyTable`] of oneshot channels; giving up is dropping the receiver.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::map::{NodeId, RouteUpdate};
use crate::tracer::BorderBlock;
use crate::wire::Packet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("interface {0} is not available")]
    NoInterface(String),

    #[error("send to {to} failed: {reason}")]
    Send { to: IpAddr, reason: String },

    #[error("request to {0} failed after reconnecting")]
    RequestFailed(IpAddr),

    #[error("no reply from {0} in time")]
    Timeout(IpAddr),

    #[error("transport closed")]
    Closed,
}

/// Packet I/O of a node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Interfaces the radar probes.
    fn interfaces(&self) -> Vec<String>;

    async fn broadcast(&self, iface: &str, packet: &Packet) -> Result<(), TransportError>;

    async fn send(&self, to: IpAddr, packet: &Packet) -> Result<(), TransportError>;

    /// Drops and re-creates whatever connection state exists towards `to`.
    async fn reconnect(&self, to: IpAddr) -> Result<(), TransportError>;

    /// Next inbound packet. [`TransportError::Closed`] ends the stream.
    async fn recv(&self) -> Result<Packet, TransportError>;
}

/// Side effects of the protocol, executed outside the core.
pub trait Collaborators: Send + Sync {
    /// The best route of a (g)node changed (or disappeared).
    fn kernel_route_update(&self, update: &RouteUpdate);

    /// Somebody else holds our address inside `gnode` at `level`.
    fn rehook(&self, gnode: NodeId, level: u8);

    fn internet_gateway_store(&self, block: &BorderBlock, level: u8);
}

/// Unicast with one retry: on failure the connection towards `to` is
/// re-created and the packet sent again.
pub async fn send_with_retry(
    transport: &dyn Transport,
    to: IpAddr,
    packet: &Packet,
) -> Result<(), TransportError> {
    let Err(first) = transport.send(to, packet).await else {
        return Ok(());
    };
    warn!(%to, op = %packet.op, error = %first, "send failed, reconnecting");
    transport
        .reconnect(to)
        .await
        .map_err(|_| TransportError::RequestFailed(to))?;
    transport
        .send(to, packet)
        .await
        .map_err(|_| TransportError::RequestFailed(to))
}

// ---------------------------------------------------------------------------
// Reply Table
// ---------------------------------------------------------------------------

/// Pending requests waiting for their reply.
#[derive(Debug)]
pub struct ReplyTable {
    pending: DashMap<(IpAddr, u32), oneshot::Sender<Packet>>,
    next_id: AtomicU32,
}

impl Default for ReplyTable {
    fn default() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }
}

impl ReplyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh request id.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a request `id` sent to `peer`.
    pub fn register(&self, peer: IpAddr, id: u32) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert((peer, id), tx);
        rx
    }

    /// Hands `packet` to the request waiting for it. False when nobody was.
    pub fn complete(&self, packet: Packet) -> bool {
        let Some((_, tx)) = self.pending.remove(&(packet.from, packet.id)) else {
            debug!(from = %packet.from, id = packet.id, "unsolicited reply dropped");
            return false;
        };
        tx.send(packet).is_ok()
    }

    pub fn cancel(&self, peer: IpAddr, id: u32) {
        self.pending.remove(&(peer, id));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Waits for the reply to `(peer, id)` at most `timeout`.
    pub async fn wait(
        &self,
        peer: IpAddr,
        id: u32,
        rx: oneshot::Receiver<Packet>,
        timeout: Duration,
    ) -> Result<Packet, TransportError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.cancel(peer, id);
                Err(TransportError::Timeout(peer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketOp;

    fn peer() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    #[tokio::test]
    async fn reply_reaches_its_request() {
        let table = ReplyTable::new();
        let id = table.next_id();
        let rx = table.register(peer(), id);
        assert!(table.complete(Packet::new(PacketOp::PutIntMap, id, peer(), vec![1u8])));
        let reply = table
            .wait(peer(), id, rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply.body[..], &[1]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reply_from_another_peer_is_not_matched() {
        let table = ReplyTable::new();
        let _rx = table.register(peer(), 7);
        let other: IpAddr = "10.0.0.3".parse().unwrap();
        assert!(!table.complete(Packet::new(PacketOp::PutIntMap, 7, other, Vec::<u8>::new())));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let table = ReplyTable::new();
        let rx = table.register(peer(), 3);
        let err = table
            .wait(peer(), 3, rx, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(peer()));
        assert!(table.is_empty());
    }
}
