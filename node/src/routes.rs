//! # Route Collaborator
//!
//! Receives the side effects of the protocol core. Kernel programming is
//! out of reach of the daemon, so route changes are logged and kept in a
//! table served at `/routes`; a route-installing helper can follow the log.

use std::collections::BTreeMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use ntk_protocol::map::{NodeId, RouteUpdate, Rtt};
use ntk_protocol::tracer::BorderBlock;
use ntk_protocol::transport::Collaborators;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub level: u8,
    pub gateway: IpAddr,
    pub trtt: Option<Rtt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayEntry {
    pub level: u8,
    pub bnode: NodeId,
    pub links: usize,
}

/// Routes and Internet gateways as last reported by the core.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<BTreeMap<String, RouteEntry>>,
    gateways: RwLock<Vec<GatewayEntry>>,
    pending_rehook: RwLock<Option<(NodeId, u8)>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destination prefix to route.
    pub fn routes(&self) -> BTreeMap<String, RouteEntry> {
        self.routes.read().clone()
    }

    pub fn gateways(&self) -> Vec<GatewayEntry> {
        self.gateways.read().clone()
    }

    /// Collision waiting for an operator or a restart with a new address.
    pub fn pending_rehook(&self) -> Option<(NodeId, u8)> {
        *self.pending_rehook.read()
    }
}

impl Collaborators for RouteTable {
    fn kernel_route_update(&self, update: &RouteUpdate) {
        let prefix = update.prefix.to_string();
        match update.gateway {
            Some(gateway) => {
                info!(%prefix, %gateway, trtt = ?update.trtt, "route");
                self.routes.write().insert(
                    prefix,
                    RouteEntry {
                        level: update.level,
                        gateway,
                        trtt: update.trtt,
                    },
                );
            }
            None => {
                if self.routes.write().remove(&prefix).is_some() {
                    info!(%prefix, "route removed");
                }
            }
        }
    }

    fn rehook(&self, gnode: NodeId, level: u8) {
        warn!(gnode, level, "address collision, a rehook with a new address is needed");
        *self.pending_rehook.write() = Some((gnode, level));
    }

    fn internet_gateway_store(&self, block: &BorderBlock, level: u8) {
        let entry = GatewayEntry {
            level,
            bnode: block.bnode(),
            links: block.links.len(),
        };
        let mut gateways = self.gateways.write();
        if let Some(known) = gateways
            .iter_mut()
            .find(|g| g.level == level && g.bnode == entry.bnode)
        {
            *known = entry;
        } else {
            info!(level, bnode = entry.bnode, "internet gateway learned");
            gateways.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntk_protocol::map::QuadroGroup;

    fn update(gateway: Option<&str>) -> RouteUpdate {
        let me = QuadroGroup::from_ip("10.0.0.1".parse().unwrap());
        RouteUpdate {
            level: 0,
            pos: 7,
            prefix: me.prefix_of(0, 7),
            gateway: gateway.map(|g| g.parse().unwrap()),
            trtt: gateway.map(|_| 30),
        }
    }

    #[test]
    fn routes_are_replaced_then_removed() {
        let table = RouteTable::new();
        table.kernel_route_update(&update(Some("10.0.0.2")));
        table.kernel_route_update(&update(Some("10.0.0.3")));
        let routes = table.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes.values().next().unwrap().gateway,
            "10.0.0.3".parse::<IpAddr>().unwrap()
        );

        table.kernel_route_update(&update(None));
        assert!(table.routes().is_empty());
    }

    #[test]
    fn collision_is_kept_for_the_operator() {
        let table = RouteTable::new();
        assert_eq!(table.pending_rehook(), None);
        table.rehook(3, 1);
        assert_eq!(table.pending_rehook(), Some((3, 1)));
    }
}
