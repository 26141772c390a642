//! # UDP Transport
//!
//! One UDP socket carries every packet of the node. Frames are the
//! [`Packet`] envelope as is; radar probes go to the limited broadcast
//! address once per configured interface.
//!
//! The socket is not bound to a device, so inbound packets are attributed
//! to the first configured interface.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use ntk_protocol::config::MAX_PACKET_SIZE;
use ntk_protocol::transport::{Transport, TransportError};
use ntk_protocol::wire::Packet;

/// All-nodes link-local multicast, the IPv6 stand-in for broadcast.
const IPV6_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

pub struct UdpTransport {
    socket: UdpSocket,
    port: u16,
    ifaces: Vec<String>,
    me: IpAddr,
}

impl UdpTransport {
    pub async fn bind(me: IpAddr, port: u16, ifaces: Vec<String>) -> std::io::Result<Self> {
        let any: IpAddr = match me {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(any, port)).await?;
        if me.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        debug!(addr = %socket.local_addr()?, ?ifaces, "udp transport bound");
        Ok(Self {
            socket,
            port,
            ifaces,
            me,
        })
    }

    fn broadcast_addr(&self) -> SocketAddr {
        let ip: IpAddr = match self.me {
            IpAddr::V4(_) => Ipv4Addr::BROADCAST.into(),
            IpAddr::V6(_) => IPV6_ALL_NODES.into(),
        };
        SocketAddr::new(ip, self.port)
    }

    async fn send_frame(&self, to: SocketAddr, packet: &Packet) -> Result<(), TransportError> {
        self.socket
            .send_to(&packet.to_frame(), to)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send {
                to: to.ip(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn interfaces(&self) -> Vec<String> {
        self.ifaces.clone()
    }

    async fn broadcast(&self, iface: &str, packet: &Packet) -> Result<(), TransportError> {
        if !self.ifaces.iter().any(|i| i == iface) {
            return Err(TransportError::NoInterface(iface.to_string()));
        }
        trace!(iface, op = %packet.op, "broadcast");
        self.send_frame(self.broadcast_addr(), packet).await
    }

    async fn send(&self, to: IpAddr, packet: &Packet) -> Result<(), TransportError> {
        trace!(%to, op = %packet.op, "unicast");
        self.send_frame(SocketAddr::new(to, self.port), packet).await
    }

    async fn reconnect(&self, to: IpAddr) -> Result<(), TransportError> {
        // Datagrams keep no per-peer state.
        debug!(%to, "reconnect requested");
        Ok(())
    }

    async fn recv(&self) -> Result<Packet, TransportError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 64];
        loop {
            let (len, src) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|_| TransportError::Closed)?;
            // Our own broadcasts come back.
            if src.ip() == self.me {
                continue;
            }
            let iface = self.ifaces.first().cloned();
            match Packet::from_frame(src.ip(), iface, &buf[..len]) {
                Ok(packet) => return Ok(packet),
                Err(e) => warn!(from = %src, error = %e, "undecodable datagram dropped"),
            }
        }
    }
}
