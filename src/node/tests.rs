use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use super::*;
use crate::controller::ControllerErrorCode;
use crate::dictionary::Dictionary;
use crate::host::VirtualNetworkStatus;
use crate::network::config::{NetworkConfig as MemberConfig, SPECIALIST_ANCHOR};
use crate::packet::{Reader, MAX_PACKET_PAYLOAD};
use crate::peer::PEER_ACTIVITY_TIMEOUT;
use crate::test_support::TestHost;
use crate::world::{Root, WorldType};

const NWID: u64 = 0xdead_beef_cafe_babe;

fn cc() -> CallContext {
    CallContext::default()
}

fn make_node_with_host(host: Arc<TestHost>, now: i64) -> Arc<Node> {
    Node::new(NodeCallbacks::new(host), UserTag(0), cc(), now).unwrap()
}

fn make_node(now: i64) -> (Arc<TestHost>, Arc<Node>) {
    let host = TestHost::new();
    let node = make_node_with_host(Arc::clone(&host), now);
    (host, node)
}

fn count_events(host: &TestHost, want: fn(&Event) -> bool) -> usize {
    host.events_snapshot().iter().filter(|e| want(e)).count()
}

/// Install a moon with one root and stamp its last receive time.
fn seed_upstream(node: &Arc<Node>, last_receive: i64) -> Identity {
    let signer = Identity::generate();
    let root = Identity::generate();
    let mut moon = World {
        id: 0x77,
        timestamp: 1,
        world_type: WorldType::Moon,
        roots: vec![Root {
            identity: root.to_public(),
            stable_endpoints: vec!["203.0.113.1:9993".parse().unwrap()],
        }],
        update_signer: None,
        signature: None,
    };
    moon.sign(&signer).unwrap();
    node.orbit(cc(), 0x77, Some(root.address())).unwrap();
    assert!(node.topology_for_tests().add_world(cc(), moon));

    let peer = node.topology_for_tests().get_peer(root.address()).unwrap();
    let path = node
        .topology_for_tests()
        .get_path(LocalSocket(1), &"203.0.113.1:9993".parse().unwrap());
    peer.received(&path, 0, true, last_receive);
    root
}

// === Construction and identity ===

#[test]
fn test_cold_start_generates_and_persists_identity() {
    let (host, node) = make_node(1000);

    assert_eq!(host.events_snapshot(), vec![Event::Up]);

    let secret = host
        .state_get_copy(StateObjectKind::IdentitySecret, 0)
        .expect("secret identity persisted");
    let secret_identity = Identity::from_str(std::str::from_utf8(&secret).unwrap()).unwrap();
    assert!(secret_identity.has_secret());
    assert_eq!(secret_identity.address(), node.address());

    let public = host
        .state_get_copy(StateObjectKind::IdentityPublic, node.address().to_u64())
        .expect("public identity persisted");
    assert_eq!(public, node.status().public_identity.as_bytes());
}

#[test]
fn test_identity_survives_restart() {
    let (host, node) = make_node(1000);
    let first_address = node.address();
    drop(node);

    let node = make_node_with_host(Arc::clone(&host), 2000);
    assert_eq!(node.address(), first_address);
    assert_eq!(count_events(&host, |e| matches!(e, Event::Up)), 2);
}

#[test]
fn test_corrupt_persisted_identity_regenerates() {
    let host = TestHost::new();
    host.state.lock().unwrap().insert(
        (StateObjectKind::IdentitySecret, 0),
        b"not an identity".to_vec(),
    );
    let node = make_node_with_host(Arc::clone(&host), 1000);

    let secret = host.state_get_copy(StateObjectKind::IdentitySecret, 0).unwrap();
    let parsed = Identity::from_str(std::str::from_utf8(&secret).unwrap()).unwrap();
    assert_eq!(parsed.address(), node.address());
}

#[test]
fn test_mismatched_public_identity_rewritten() {
    let (host, node) = make_node(1000);
    let scope = node.address().to_u64();
    host.state.lock().unwrap().insert(
        (StateObjectKind::IdentityPublic, scope),
        b"stale garbage".to_vec(),
    );
    drop(node);

    let node = make_node_with_host(Arc::clone(&host), 2000);
    let public = host
        .state_get_copy(StateObjectKind::IdentityPublic, scope)
        .unwrap();
    assert_eq!(public, node.status().public_identity.as_bytes());
}

#[test]
fn test_callback_version_mismatch_rejected() {
    let host = TestHost::new();
    let mut callbacks = NodeCallbacks::new(host);
    callbacks.version = 1;
    assert_eq!(
        Node::new(callbacks, UserTag(0), cc(), 0).err(),
        Some(NodeError::InvalidArgument("callback table version"))
    );
}

#[test]
fn test_configured_identity_wins() {
    let pinned = Identity::generate();
    let host = TestHost::new();
    let config = crate::config::NodeConfig {
        identity_secret: Some(pinned.to_secret_string().unwrap()),
        ..Default::default()
    };
    let node =
        Node::with_config(NodeCallbacks::new(host), config, UserTag(0), cc(), 0).unwrap();
    assert_eq!(node.address(), pinned.address());
}

// === Membership lifecycle ===

#[test]
fn test_join_is_idempotent_with_single_port_up() {
    let (host, node) = make_node(1000);
    node.join(NWID, UserTag(0x1), cc()).unwrap();
    node.join(NWID, UserTag(0x2), cc()).unwrap();

    let ups = host
        .ports_snapshot()
        .iter()
        .filter(|p| p.op == VirtualNetworkConfigOperation::Up)
        .count();
    assert_eq!(ups, 1);

    let networks = node.networks();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].nwid, NWID);

    // the original join's tag is retained
    assert_eq!(node.leave(NWID, cc()).unwrap(), Some(UserTag(0x1)));
}

#[test]
fn test_leave_tears_down_port_once() {
    let (host, node) = make_node(1000);
    node.join(NWID, UserTag(0x1), cc()).unwrap();
    assert!(node.network_config(NWID).is_some());

    assert_eq!(node.leave(NWID, cc()).unwrap(), Some(UserTag(0x1)));
    assert_eq!(node.leave(NWID, cc()).unwrap(), None);

    let destroys: Vec<_> = host
        .ports_snapshot()
        .into_iter()
        .filter(|p| p.op == VirtualNetworkConfigOperation::Destroy)
        .collect();
    assert_eq!(destroys.len(), 1);
    assert_eq!(destroys[0].nwid, NWID);
    assert_eq!(destroys[0].user, UserTag(0x1));
    assert!(node.networks().is_empty());
    assert!(node.network_config(NWID).is_none());
}

#[test]
fn test_leave_deletes_persisted_config() {
    let (host, node) = make_node(1000);
    node.join(NWID, UserTag(1), cc()).unwrap();
    let network = node.networks.get(NWID).unwrap();
    let mut config = MemberConfig::new(NWID, node.address());
    config.timestamp = 1000;
    network.set_configuration(cc(), config, true, 1000);
    assert!(host
        .state_get_copy(StateObjectKind::NetworkConfig, NWID)
        .is_some());

    node.leave(NWID, cc()).unwrap();
    assert!(host
        .state_get_copy(StateObjectKind::NetworkConfig, NWID)
        .is_none());
}

#[test]
fn test_drop_destroys_remaining_networks() {
    let (host, node) = make_node(1000);
    node.join(NWID, UserTag(9), cc()).unwrap();
    drop(node);

    let destroys = host
        .ports_snapshot()
        .iter()
        .filter(|p| p.op == VirtualNetworkConfigOperation::Destroy)
        .count();
    assert_eq!(destroys, 1);
}

#[test]
fn test_multicast_requires_joined_network() {
    let (_host, node) = make_node(1000);
    let mac = Mac::from_u64(0x0133_0000_0001);
    assert_eq!(
        node.multicast_subscribe(cc(), NWID, mac, 0).err(),
        Some(NodeError::NetworkNotFound)
    );
    node.join(NWID, UserTag(0), cc()).unwrap();
    node.multicast_subscribe(cc(), NWID, mac, 0).unwrap();
    assert_eq!(
        node.network_config(NWID).unwrap().multicast_subscriptions,
        vec![MulticastGroup::new(mac, 0)]
    );
    node.multicast_unsubscribe(NWID, mac, 0).unwrap();
    assert!(node
        .network_config(NWID)
        .unwrap()
        .multicast_subscriptions
        .is_empty());
}

#[test]
fn test_frame_for_unknown_network_fails() {
    let (_host, node) = make_node(1000);
    let result = node.process_virtual_network_frame(
        cc(),
        1100,
        NWID,
        Mac::from_u64(2),
        Mac::from_u64(3),
        0x0800,
        0,
        &[0u8; 20],
    );
    assert_eq!(result.err(), Some(NodeError::NetworkNotFound));
}

#[test]
fn test_garbage_wire_packets_are_not_errors() {
    let (_host, node) = make_node(1000);
    let remote = "198.51.100.1:9993".parse().unwrap();
    node.process_wire_packet(cc(), 1100, LocalSocket(1), &remote, &[])
        .unwrap();
    node.process_wire_packet(cc(), 1101, LocalSocket(1), &remote, &[0xff; 7])
        .unwrap();
    node.process_wire_packet(cc(), 1102, LocalSocket(1), &remote, &[0xff; 4096])
        .unwrap();
}

// === Background sweep ===

#[test]
fn test_background_deadline_has_granularity_floor() {
    let (_host, node) = make_node(1000);
    for now in [1000, 5000, 62_000, 62_100] {
        let deadline = node.process_background_tasks(cc(), now).unwrap();
        assert!(deadline >= now + CORE_TIMER_GRANULARITY, "deadline at {}", now);
    }
}

#[test]
fn test_online_then_offline_transitions() {
    let (host, node) = make_node(1000);
    seed_upstream(&node, 1000);

    // first ping sweep: upstream was heard from recently, we come online
    node.process_background_tasks(cc(), PING_CHECK_INTERVAL).unwrap();
    assert!(node.online());
    assert_eq!(count_events(&host, |e| matches!(e, Event::Online)), 1);
    assert_eq!(count_events(&host, |e| matches!(e, Event::Offline)), 0);

    // silence past the activity timeout flips us offline exactly once
    let later = PING_CHECK_INTERVAL + PEER_ACTIVITY_TIMEOUT + 1;
    node.process_background_tasks(cc(), later).unwrap();
    assert!(!node.online());
    assert_eq!(count_events(&host, |e| matches!(e, Event::Offline)), 1);
    assert_eq!(count_events(&host, |e| matches!(e, Event::Online)), 1);
}

#[test]
fn test_sweep_pings_active_upstream() {
    let (host, node) = make_node(1000);
    let root = seed_upstream(&node, 1000);
    host.clear_wire();

    // well past both the ping-check cadence and the per-path ping period
    node.process_background_tasks(cc(), 1000 + PING_CHECK_INTERVAL).unwrap();

    let hellos: Vec<_> = host
        .wire_snapshot()
        .iter()
        .filter(|w| !w.is_keepalive())
        .map(|w| w.packet())
        .filter(|p| p.verb() == crate::packet::Verb::Hello)
        .collect();
    assert!(!hellos.is_empty());
    assert!(hellos.iter().all(|p| p.dest() == root.address()));
}

#[test]
fn test_sweep_whois_for_unknown_upstream() {
    let (_host, node) = make_node(1000);
    let seed: Address = "0011223344".parse().unwrap();
    node.orbit(cc(), 0x99, Some(seed)).unwrap();

    node.process_background_tasks(cc(), PING_CHECK_INTERVAL).unwrap();
    let outstanding = node.switch_for_tests().whois_outstanding_for_tests();
    assert_eq!(outstanding.iter().filter(|a| **a == seed).count(), 1);

    // a second sweep does not duplicate the outstanding request
    node.process_background_tasks(cc(), PING_CHECK_INTERVAL * 2).unwrap();
    let outstanding = node.switch_for_tests().whois_outstanding_for_tests();
    assert_eq!(outstanding.iter().filter(|a| **a == seed).count(), 1);
}

#[test]
fn test_sweep_requests_stale_network_config() {
    let (_host, node) = make_node(1000);
    node.join(NWID, UserTag(0), cc()).unwrap();
    // join already asked once; the sweep asks again because nothing arrived
    node.process_background_tasks(cc(), PING_CHECK_INTERVAL).unwrap();

    let controller: Address = Address::from_u64(NWID >> 24).unwrap();
    assert!(node
        .switch_for_tests()
        .whois_outstanding_for_tests()
        .contains(&controller));
}

// === Messaging ===

#[test]
fn test_user_message_to_self_refused() {
    let (host, node) = make_node(1000);
    host.clear_wire();
    assert!(!node.send_user_message(cc(), node.address(), 42, b"nope"));
    assert!(host.wire_snapshot().is_empty());
    assert!(node.switch_for_tests().whois_outstanding_for_tests().is_empty());
}

#[test]
fn test_user_message_to_remote_accepted() {
    let (_host, node) = make_node(1000);
    let dest = Identity::generate().address();
    assert!(node.send_user_message(cc(), dest, 42, b"hello"));
}

// === Controller send paths ===

#[test]
fn test_config_chunking_partitions_exactly() {
    let (host, node) = make_node(1000);
    let dest = Identity::generate();
    let peer = Arc::new(Peer::new(&node.ctx.identity, dest.clone(), 1000).unwrap());
    let path = node
        .topology_for_tests()
        .get_path(LocalSocket(1), &"198.51.100.7:9993".parse().unwrap());
    peer.received(&path, 0, true, 1000);
    node.topology_for_tests().add_peer(peer);
    host.clear_wire();

    let chunk_max = MAX_PACKET_PAYLOAD - 256;
    let total = chunk_max * 2 + 7;
    let dict_bytes: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    node.nc_send_config_bytes(cc(), NWID, 0, dest.address(), &dict_bytes);

    let packets: Vec<_> = host
        .wire_snapshot()
        .iter()
        .filter(|w| !w.is_keepalive())
        .map(|w| w.packet())
        .collect();
    assert_eq!(packets.len(), 3);

    let mut update_ids = Vec::new();
    let mut reassembled = vec![0u8; total];
    let mut expected_lens = vec![chunk_max, chunk_max, 7];
    for packet in &packets {
        assert_eq!(packet.verb(), crate::packet::Verb::NetworkConfig);
        assert_eq!(packet.dest(), dest.address());

        let payload = packet.payload();
        let mut r = Reader::new(payload);
        assert_eq!(r.read_u64(), Some(NWID));
        let chunk = r.read_u16_prefixed().unwrap().to_vec();
        assert_eq!(r.read_u8(), Some(0));
        update_ids.push(r.read_u64().unwrap());
        assert_eq!(r.read_u32(), Some(total as u32));
        let index = r.read_u32().unwrap() as usize;
        let signed_len = payload.len() - r.remaining();

        // trailing signature covers everything from the network ID onward
        assert_eq!(r.read_u8(), Some(1));
        let signature = r.read_u16_prefixed().unwrap();
        assert!(node
            .ctx
            .identity
            .verify(&payload[..signed_len], signature));
        assert!(r.is_empty());

        let pos = expected_lens
            .iter()
            .position(|len| *len == chunk.len())
            .expect("unexpected chunk length");
        expected_lens.remove(pos);
        reassembled[index..index + chunk.len()].copy_from_slice(&chunk);
    }
    assert!(expected_lens.is_empty());
    assert_eq!(reassembled, dict_bytes);

    let update_id = update_ids[0];
    assert_ne!(update_id, 0);
    assert!(update_ids.iter().all(|id| *id == update_id));
}

#[test]
fn test_config_reply_chunks_carry_request_preamble() {
    let (host, node) = make_node(1000);
    let dest = Identity::generate();
    let peer = Arc::new(Peer::new(&node.ctx.identity, dest.clone(), 1000).unwrap());
    let path = node
        .topology_for_tests()
        .get_path(LocalSocket(1), &"198.51.100.7:9993".parse().unwrap());
    peer.received(&path, 0, true, 1000);
    node.topology_for_tests().add_peer(peer);
    host.clear_wire();

    node.nc_send_config_bytes(cc(), NWID, 0x1234, dest.address(), b"nwid=1\n");

    let packets: Vec<_> = host
        .wire_snapshot()
        .iter()
        .filter(|w| !w.is_keepalive())
        .map(|w| w.packet())
        .collect();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].verb(), crate::packet::Verb::Ok);
    let mut r = Reader::new(packets[0].payload());
    assert_eq!(r.read_u8(), Some(crate::packet::Verb::NetworkConfigRequest as u8));
    assert_eq!(r.read_u64(), Some(0x1234));
    assert_eq!(r.read_u64(), Some(NWID));
}

#[test]
fn test_nc_send_config_to_self_applies_directly() {
    let (host, node) = make_node(1000);
    node.join(NWID, UserTag(0), cc()).unwrap();
    host.clear_wire();

    let mut config = MemberConfig::new(NWID, node.address());
    config.timestamp = 1000;
    config.name = "self-issued".into();
    node.nc_send_config(cc(), NWID, 0, node.address(), &config);

    let external = node.network_config(NWID).unwrap();
    assert_eq!(external.status, VirtualNetworkStatus::Ok);
    assert_eq!(external.name, "self-issued");
    assert!(host.wire_snapshot().is_empty());
}

#[test]
fn test_nc_send_error_to_self_sets_network_state() {
    let (_host, node) = make_node(1000);
    node.join(NWID, UserTag(0), cc()).unwrap();

    node.nc_send_error(cc(), NWID, 0, node.address(), ControllerErrorCode::AccessDenied);
    assert_eq!(
        node.network_config(NWID).unwrap().status,
        VirtualNetworkStatus::AccessDenied
    );

    node.nc_send_error(cc(), NWID, 0, node.address(), ControllerErrorCode::ObjectNotFound);
    assert_eq!(
        node.network_config(NWID).unwrap().status,
        VirtualNetworkStatus::NotFound
    );
}

struct TestController {
    requests: Mutex<Vec<(u64, u64)>>,
    sender: Mutex<Option<Weak<dyn ControllerSender>>>,
    inited_as: Mutex<Option<Address>>,
}

impl TestController {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            inited_as: Mutex::new(None),
        })
    }
}

impl NetworkController for TestController {
    fn init(&self, signing_identity: &Identity, sender: Weak<dyn ControllerSender>) {
        *self.inited_as.lock().unwrap() = Some(signing_identity.address());
        *self.sender.lock().unwrap() = Some(sender);
    }

    fn request(
        &self,
        _cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        _from: &Identity,
        _metadata: &Dictionary,
    ) {
        self.requests.lock().unwrap().push((nwid, request_packet_id));
    }
}

#[test]
fn test_local_controller_round_trip() {
    let (_host, node) = make_node(1000);
    let controller = TestController::new();
    node.set_netconf_master(Some(controller.clone()));
    assert_eq!(*controller.inited_as.lock().unwrap(), Some(node.address()));

    // a network whose controller address is ours routes requests in-process
    let our_nwid = (node.address().to_u64() << 24) | 0x01;
    node.join(our_nwid, UserTag(0), cc()).unwrap();
    assert_eq!(*controller.requests.lock().unwrap(), vec![(our_nwid, 0)]);

    // the controller answers after the join completes
    let mut config = MemberConfig::new(our_nwid, node.address());
    config.timestamp = 1000;
    let sender = controller
        .sender
        .lock()
        .unwrap()
        .clone()
        .unwrap()
        .upgrade()
        .unwrap();
    sender.nc_send_config(cc(), our_nwid, 0, node.address(), &config);
    assert_eq!(
        node.network_config(our_nwid).unwrap().status,
        VirtualNetworkStatus::Ok
    );
}

#[test]
fn test_join_without_local_controller_is_not_found() {
    let (_host, node) = make_node(1000);
    let our_nwid = (node.address().to_u64() << 24) | 0x02;
    node.join(our_nwid, UserTag(0), cc()).unwrap();
    assert_eq!(
        node.network_config(our_nwid).unwrap().status,
        VirtualNetworkStatus::NotFound
    );
}

// === Path policy ===

#[test]
fn test_path_denied_inside_managed_range() {
    let (_host, node) = make_node(1000);
    node.join(NWID, UserTag(0), cc()).unwrap();
    let network = node.networks.get(NWID).unwrap();
    let mut config = MemberConfig::new(NWID, node.address());
    config.timestamp = 1000;
    config
        .static_ips
        .push(InetRange::new("10.144.0.0".parse().unwrap(), 16));
    network.set_configuration(cc(), config, false, 1000);

    let peer = Identity::generate().address();
    assert!(!node.should_use_path_for_overlay_traffic(
        cc(),
        peer,
        LocalSocket::ANY,
        &"10.144.3.4:9993".parse().unwrap()
    ));
    assert!(node.should_use_path_for_overlay_traffic(
        cc(),
        peer,
        LocalSocket::ANY,
        &"10.145.3.4:9993".parse().unwrap()
    ));
}

#[test]
fn test_path_denied_by_physical_rule() {
    let (_host, node) = make_node(1000);
    node.set_physical_path_configuration(
        InetRange::new("192.0.2.0".parse().unwrap(), 24),
        Some(PhysicalPathConfig {
            trusted_path_id: 0,
            enabled: false,
        }),
    )
    .unwrap();
    let peer = Identity::generate().address();
    assert!(!node.should_use_path_for_overlay_traffic(
        cc(),
        peer,
        LocalSocket::ANY,
        &"192.0.2.9:9993".parse().unwrap()
    ));
}

// === Queries and local state ===

#[test]
fn test_status_snapshot() {
    let (_host, node) = make_node(1000);
    let status = node.status();
    assert_eq!(status.address, node.address());
    assert!(!status.online);
    let parsed = Identity::from_str(&status.public_identity).unwrap();
    assert_eq!(parsed.address(), node.address());
    let secret = Identity::from_str(&status.secret_identity).unwrap();
    assert!(secret.has_secret());
}

#[test]
fn test_peers_query_sorted_with_one_preferred_path() {
    let (_host, node) = make_node(1000);
    let now = 100_000;
    node.now.store(now, std::sync::atomic::Ordering::Relaxed);

    for endpoint in ["198.51.100.1:9993", "198.51.100.2:9993"] {
        let identity = Identity::generate();
        let peer = Arc::new(Peer::new(&node.ctx.identity, identity, now).unwrap());
        let peer = node.topology_for_tests().add_peer(peer);
        // two paths, one alive and one dead
        let alive = node
            .topology_for_tests()
            .get_path(LocalSocket(1), &endpoint.parse().unwrap());
        peer.received(&alive, 0, true, now);
        let dead = node
            .topology_for_tests()
            .get_path(LocalSocket(2), &"203.0.113.200:9993".parse().unwrap());
        peer.learn_path(&dead, now);
    }

    let snapshots = node.peers();
    assert_eq!(snapshots.len(), 2);
    let mut sorted = snapshots.iter().map(|p| p.address).collect::<Vec<_>>();
    sorted.sort();
    assert_eq!(
        snapshots.iter().map(|p| p.address).collect::<Vec<_>>(),
        sorted
    );
    for snapshot in &snapshots {
        assert!(snapshot.paths.len() <= crate::peer::MAX_PEER_PATHS);
        assert_eq!(snapshot.paths.iter().filter(|p| p.preferred).count(), 1);
        assert!(snapshot.paths.iter().any(|p| p.expired));
        assert_eq!(snapshot.role, crate::topology::Role::Leaf);
    }
}

#[test]
fn test_local_interface_addresses() {
    let (_host, node) = make_node(1000);
    let addr: std::net::SocketAddr = "192.0.2.10:9993".parse().unwrap();
    assert!(node.add_local_interface_address(&addr));
    assert!(!node.add_local_interface_address(&addr)); // duplicate
    assert!(!node.add_local_interface_address(&"127.0.0.1:9993".parse().unwrap()));
    assert_eq!(node.local_interface_addresses(), vec![addr]);

    node.clear_local_interface_addresses();
    assert!(node.local_interface_addresses().is_empty());
}

#[test]
fn test_orbit_and_deorbit() {
    let (_host, node) = make_node(1000);
    assert_eq!(node.planet().id, 0); // fallback planet
    assert!(node.moons().is_empty());

    let root = seed_upstream(&node, 1000);
    assert_eq!(node.moons().len(), 1);
    assert_eq!(
        node.topology_for_tests().role(root.address()),
        crate::topology::Role::Moon
    );

    node.deorbit(cc(), 0x77).unwrap();
    assert!(node.moons().is_empty());
}

#[test]
fn test_contact_peer_at_emits_hello() {
    let (host, node) = make_node(1000);
    host.clear_wire();
    let target = Identity::generate();
    assert!(node.contact_peer_at(
        cc(),
        &target.to_public_string(),
        &"198.51.100.77:9993".parse().unwrap(),
        1000,
    ));

    let wire = host.wire_snapshot();
    assert_eq!(wire.len(), 1);
    let hello = wire[0].packet();
    assert_eq!(hello.verb(), crate::packet::Verb::Hello);
    assert_eq!(hello.dest(), target.address());
    assert!(!node.contact_peer_at(
        cc(),
        "garbage",
        &"198.51.100.77:9993".parse().unwrap(),
        1000
    ));
}

#[test]
fn test_startup_config_joins_networks() {
    let host = TestHost::new();
    let config = crate::config::NodeConfig {
        networks: vec![format!("{:016x}", NWID)],
        ..Default::default()
    };
    let node =
        Node::with_config(NodeCallbacks::new(host), config, UserTag(0), cc(), 1000).unwrap();
    assert_eq!(node.networks().len(), 1);
    assert_eq!(node.networks()[0].nwid, NWID);
}

#[test]
fn test_anchor_contact_from_network_config() {
    let (_host, node) = make_node(1000);
    node.join(NWID, UserTag(0), cc()).unwrap();
    let network = node.networks.get(NWID).unwrap();
    let anchor = Identity::generate().address();
    let mut config = MemberConfig::new(NWID, node.address());
    config.timestamp = PING_CHECK_INTERVAL;
    config.specialists.push(crate::network::config::Specialist {
        address: anchor,
        flags: SPECIALIST_ANCHOR,
    });
    network.set_configuration(cc(), config, false, 1000);

    node.process_background_tasks(cc(), PING_CHECK_INTERVAL).unwrap();
    assert!(node
        .switch_for_tests()
        .whois_outstanding_for_tests()
        .contains(&anchor));
}
