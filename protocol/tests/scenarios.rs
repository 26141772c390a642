//! Scenario tests driving whole daemons over an in-memory network.
//!
//! Every node gets a [`MemTransport`] plugged into a shared [`Hub`]:
//! broadcasts reach every other node on the hub, unicasts reach the
//! addressed node, and everything sent is recorded for inspection. Side
//! effects land in a [`Recorder`] instead of the kernel.
//!
//! Radar waits run on paused tokio time, so a full scan takes no wall time.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ntk_protocol::config::ProtocolConfig;
use ntk_protocol::daemon::{Daemon, DaemonError, FetchedMap, HookOutcome};
use ntk_protocol::map::{BnodeLink, NodeId, QuadroGroup, RnodeTarget, RouteUpdate, Rtt, Topology};
use ntk_protocol::qspn::Phase;
use ntk_protocol::radar::RlistEntry;
use ntk_protocol::store::MapStore;
use ntk_protocol::tracer::{BcastHeader, BorderBlock, TracerChunk, TracerPacket, BCAST_STARTER};
use ntk_protocol::transport::{Collaborators, Transport, TransportError};
use ntk_protocol::wire::{EchoFlags, MapKind, Packet, PacketOp};

// ---------------------------------------------------------------------------
// In-Memory Network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Hub {
    inboxes: DashMap<IpAddr, mpsc::UnboundedSender<Packet>>,
}

impl Hub {
    fn deliver(&self, to: IpAddr, packet: Packet) {
        if let Some(inbox) = self.inboxes.get(&to) {
            let _ = inbox.send(packet);
        }
    }
}

struct MemTransport {
    ip: IpAddr,
    hub: Arc<Hub>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    sent: Mutex<Vec<(IpAddr, Packet)>>,
    broadcasts: AtomicUsize,
}

impl MemTransport {
    fn join(hub: &Arc<Hub>, ip: IpAddr) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.inboxes.insert(ip, tx);
        Arc::new(Self {
            ip,
            hub: Arc::clone(hub),
            inbox: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            broadcasts: AtomicUsize::new(0),
        })
    }

    fn sent(&self) -> Vec<(IpAddr, Packet)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn interfaces(&self) -> Vec<String> {
        vec!["eth0".to_string()]
    }

    async fn broadcast(&self, iface: &str, packet: &Packet) -> Result<(), TransportError> {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let peers: Vec<IpAddr> = self
            .hub
            .inboxes
            .iter()
            .map(|e| *e.key())
            .filter(|ip| *ip != self.ip)
            .collect();
        for peer in peers {
            let mut copy = packet.clone();
            copy.from = self.ip;
            copy.iface = Some(iface.to_string());
            self.hub.deliver(peer, copy);
        }
        Ok(())
    }

    async fn send(&self, to: IpAddr, packet: &Packet) -> Result<(), TransportError> {
        self.sent.lock().push((to, packet.clone()));
        let mut copy = packet.clone();
        copy.from = self.ip;
        self.hub.deliver(to, copy);
        Ok(())
    }

    async fn reconnect(&self, _to: IpAddr) -> Result<(), TransportError> {
        Ok(())
    }

    async fn recv(&self) -> Result<Packet, TransportError> {
        self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
    }
}

#[derive(Default)]
struct Recorder {
    routes: Mutex<Vec<RouteUpdate>>,
    rehooks: Mutex<Vec<(NodeId, u8)>>,
    gateways: Mutex<Vec<(BorderBlock, u8)>>,
}

impl Collaborators for Recorder {
    fn kernel_route_update(&self, update: &RouteUpdate) {
        self.routes.lock().push(update.clone());
    }

    fn rehook(&self, gnode: NodeId, level: u8) {
        self.rehooks.lock().push((gnode, level));
    }

    fn internet_gateway_store(&self, block: &BorderBlock, level: u8) {
        self.gateways.lock().push((block.clone(), level));
    }
}

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct TestNode {
    daemon: Arc<Daemon>,
    transport: Arc<MemTransport>,
    recorder: Arc<Recorder>,
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn config() -> ProtocolConfig {
    ProtocolConfig {
        radar_scans: 2,
        ..ProtocolConfig::default()
    }
}

fn spawn_node(hub: &Arc<Hub>, addr: &str) -> TestNode {
    let transport = MemTransport::join(hub, ip(addr));
    let recorder = Arc::new(Recorder::default());
    let daemon = Daemon::new(
        config(),
        Arc::new(Topology::new(ip(addr))),
        transport.clone(),
        recorder.clone(),
    );
    TestNode {
        daemon: Arc::new(daemon),
        transport,
        recorder,
    }
}

/// Feeds every inbound packet of `node` to its daemon, one at a time.
fn pump(node: &TestNode) {
    let daemon = Arc::clone(&node.daemon);
    let transport = Arc::clone(&node.transport);
    tokio::spawn(async move {
        while let Ok(packet) = transport.recv().await {
            daemon.handle_packet(packet).await;
        }
    });
}

fn add_neighbor(node: &TestNode, addr: &str, rtt: Rtt) {
    let quadg = QuadroGroup::from_ip(ip(addr));
    node.daemon.rlist().upsert(RlistEntry {
        ip: quadg.ip(),
        target: RnodeTarget::Local(quadg.gid(0)),
        quadg,
        ifaces: vec!["eth0".into()],
        rtt,
        hooking: false,
        misses: 0,
    });
}

fn flood_packet(op: PacketOp, id: u32, from: &str, hops: &[(NodeId, Rtt)]) -> Packet {
    flood_packet_with_blocks(op, id, from, hops, Vec::new())
}

fn flood_packet_with_blocks(
    op: PacketOp,
    id: u32,
    from: &str,
    hops: &[(NodeId, Rtt)],
    blocks: Vec<BorderBlock>,
) -> Packet {
    let pkt = TracerPacket {
        bcast: BcastHeader {
            gnode_id: 0,
            level: 0,
            gnode_ttl: 20,
            sub_id: hops[0].0,
            flags: BCAST_STARTER,
        },
        first_open_chunk: 0,
        chunks: hops
            .iter()
            .map(|&(node, rtt)| TracerChunk { node, rtt, gcount: 1 })
            .collect(),
        blocks,
    };
    Packet::new(op, id, ip(from), pkt.encode(4))
}

fn int_map_bytes(node: &TestNode) -> Vec<u8> {
    node.daemon.topology().read().int_map.pack().to_vec()
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lonely_node_becomes_sole_seed() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    a.daemon.topology().set_identity(ip("10.0.0.1")).unwrap();
    assert!(a.daemon.topology().is_hooking());

    let report = a.daemon.bootstrap_scan().await.unwrap();

    assert!(report.alone);
    assert_eq!(report.replies, 0);
    assert!(!a.daemon.topology().is_hooking());
    assert_eq!(a.daemon.topology().summary().alive_nodes, 1);
    // Probes only: no round, no unicast.
    assert_eq!(a.transport.broadcasts.load(Ordering::Relaxed), 2);
    assert!(a.transport.sent().is_empty());
    assert_eq!(a.daemon.stats().snapshot().rounds_started, 0);
}

#[tokio::test(start_paused = true)]
async fn newcomer_hooks_through_its_neighbor() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    let b = spawn_node(&hub, "10.0.0.2");
    b.daemon.topology().set_identity(ip("10.0.0.2")).unwrap();
    pump(&a);
    pump(&b);

    let outcome = b.daemon.hook().await.unwrap();
    assert!(matches!(outcome, HookOutcome::Joined { via, .. } if via == ip("10.0.0.1")));
    assert!(!b.daemon.topology().is_hooking());

    // The connect announcement links the newcomer on the other side.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(a.daemon.rlist().contains(&ip("10.0.0.2")));
    assert!(!a.daemon.topology().read().node(0, 2).is_void());
    assert_eq!(b.daemon.stats().snapshot().tracers_started, 1);
}

// ---------------------------------------------------------------------------
// Discovery & Map Exchange
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn neighbors_find_each_other_and_exchange_maps() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    let b = spawn_node(&hub, "10.0.0.2");
    pump(&a);
    pump(&b);

    let (ra, rb) = tokio::join!(a.daemon.radar_scan(), b.daemon.radar_scan());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.new, vec![ip("10.0.0.2")]);
    assert_eq!(rb.new, vec![ip("10.0.0.1")]);
    assert!(ra.dirty_levels.contains(&0));

    // Let the spawned rounds run.
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(a.daemon.rlist().contains(&ip("10.0.0.2")));
    assert!(!a.daemon.topology().read().node(0, 2).is_void());
    assert!(a
        .recorder
        .routes
        .lock()
        .iter()
        .any(|r| r.level == 0 && r.pos == 2 && r.gateway == Some(ip("10.0.0.2"))));

    let fetched = a
        .daemon
        .request_map(MapKind::Internal, ip("10.0.0.2"))
        .await
        .unwrap();
    let FetchedMap::Internal(map) = fetched else {
        panic!("expected an internal map");
    };
    assert_eq!(map.me(), 2);
    assert!(!map.node(1).is_void());
}

#[tokio::test(start_paused = true)]
async fn silent_neighbor_map_request_times_out() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    let err = a
        .daemon
        .request_map(MapKind::External, ip("10.0.0.9"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Transport(TransportError::Timeout(peer)) if peer == ip("10.0.0.9")
    ));
}

// ---------------------------------------------------------------------------
// QSPN
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closing_neighbor_gets_an_open_back() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    add_neighbor(&a, "10.0.0.2", 10);

    a.daemon
        .handle_packet(flood_packet(PacketOp::QspnClose, 1, "10.0.0.2", &[(2, 10)]))
        .await;

    let node = a.daemon.topology().read().node(0, 2).clone();
    assert!(!node.is_void());
    assert_eq!(node.best().unwrap().trtt, 10);
    assert_eq!(a.daemon.qspn().phase(0), Phase::Open);

    let sent = a.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, ip("10.0.0.2"));
    assert_eq!(sent[0].1.op, PacketOp::QspnOpen);
    assert!(a
        .recorder
        .routes
        .lock()
        .iter()
        .any(|r| r.pos == 2 && r.trtt == Some(10)));
    assert!(a.recorder.gateways.lock().is_empty());
    assert_eq!(a.daemon.stats().snapshot().packets_dropped, 0);
}

#[tokio::test]
async fn older_qspn_round_is_ignored() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    add_neighbor(&a, "10.0.0.2", 10);
    add_neighbor(&a, "10.0.0.3", 10);

    a.daemon
        .handle_packet(flood_packet(PacketOp::QspnClose, 5, "10.0.0.2", &[(2, 10)]))
        .await;
    let before = int_map_bytes(&a);

    a.daemon
        .handle_packet(flood_packet(PacketOp::QspnClose, 4, "10.0.0.3", &[(3, 10)]))
        .await;

    assert_eq!(int_map_bytes(&a), before);
    assert!(a.daemon.topology().read().node(0, 3).is_void());
    assert_eq!(a.daemon.qspn().round(0), 5);
    assert_eq!(a.daemon.stats().snapshot().packets_dropped, 1);
}

// ---------------------------------------------------------------------------
// Tracer Packets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_tracer_changes_nothing() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    add_neighbor(&a, "10.0.0.2", 10);

    let first = flood_packet(PacketOp::TracerPkt, 1, "10.0.0.2", &[(3, 0), (2, 5)]);
    a.daemon.handle_packet(first.clone()).await;
    assert!(!a.daemon.topology().read().node(0, 3).is_void());
    let after_first = int_map_bytes(&a);

    // Same packet again.
    a.daemon.handle_packet(first).await;
    assert_eq!(int_map_bytes(&a), after_first);

    // Same broadcast id with other contents.
    a.daemon
        .handle_packet(flood_packet(PacketOp::TracerPkt, 1, "10.0.0.2", &[(3, 0), (2, 7)]))
        .await;
    assert_eq!(int_map_bytes(&a), after_first);
    assert_eq!(a.daemon.stats().snapshot().packets_dropped, 2);

    // A newer one goes through.
    a.daemon
        .handle_packet(flood_packet(PacketOp::TracerPkt, 2, "10.0.0.2", &[(3, 0), (2, 7)]))
        .await;
    assert_eq!(a.daemon.stats().snapshot().packets_dropped, 2);
}

#[tokio::test]
async fn internet_gateway_reaches_the_gateway_store() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    add_neighbor(&a, "10.0.0.2", 10);

    // Node 3 shares a link one level above the top of the network.
    let gateway = BorderBlock {
        gids: vec![3, 0, 0, 10],
        links: vec![BnodeLink {
            gnode: 0,
            level: 5,
            rtt: 12,
        }],
    };
    a.daemon
        .handle_packet(flood_packet_with_blocks(
            PacketOp::TracerPkt,
            1,
            "10.0.0.2",
            &[(3, 0), (2, 5)],
            vec![gateway.clone()],
        ))
        .await;

    assert_eq!(*a.recorder.gateways.lock(), vec![(gateway, 0)]);
    assert!(a.daemon.topology().read().bmap.entry(0, 3).is_none());
    assert_eq!(a.daemon.stats().snapshot().packets_dropped, 0);
}

#[tokio::test]
async fn our_address_inside_a_path_asks_for_one_rehook() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    add_neighbor(&a, "10.0.0.2", 10);

    a.daemon
        .handle_packet(flood_packet(PacketOp::TracerPkt, 9, "10.0.0.2", &[(1, 0), (2, 5)]))
        .await;

    assert_eq!(*a.recorder.rehooks.lock(), vec![(0, 0)]);
    assert_eq!(a.daemon.stats().snapshot().rehooks, 1);
    assert!(a.recorder.routes.lock().is_empty());
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_is_answered_with_the_hooking_flag() {
    let hub = Arc::new(Hub::default());
    let a = spawn_node(&hub, "10.0.0.1");
    a.daemon.topology().set_identity(ip("10.0.0.1")).unwrap();

    let mut probe = Packet::new(PacketOp::EchoMe, 77, ip("10.0.0.2"), EchoFlags::default().encode());
    probe.iface = Some("eth0".into());
    a.daemon.handle_packet(probe).await;

    let sent = a.transport.sent();
    assert_eq!(sent.len(), 1);
    let (to, reply) = &sent[0];
    assert_eq!(*to, ip("10.0.0.2"));
    assert_eq!(reply.op, PacketOp::EchoReply);
    assert_eq!(reply.id, 77);
    assert!(EchoFlags::decode(&reply.body).unwrap().hooking);
}

// ---------------------------------------------------------------------------
// Run Loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_saves_the_maps() {
    let hub = Arc::new(Hub::default());
    let store = MapStore::open_temporary().unwrap();
    let transport = MemTransport::join(&hub, ip("10.0.0.1"));
    let topology = Arc::new(Topology::new(ip("10.0.0.1")));
    let mut touched = Vec::new();
    topology
        .write()
        .link_neighbor(&QuadroGroup::from_ip(ip("10.0.0.2")), 20, 0, &mut touched);
    let daemon = Arc::new(
        Daemon::new(config(), topology, transport, Arc::new(Recorder::default()))
            .with_store(store.clone()),
    );

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&daemon).run(rx));
    tokio::task::yield_now().await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let loaded = store.load_topology(ip("10.0.0.1"));
    assert_eq!(loaded.summary().alive_nodes, 2);
}
