//! Shared test doubles.
//!
//! A recording host implementation plus context builders used by the
//! engine's unit and scenario tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::context::Context;
use crate::host::{
    CallContext, Event, NodeHost, StateObjectKind, UserTag, VirtualNetworkConfig,
    VirtualNetworkConfigOperation,
};
use crate::identity::Identity;
use crate::inet::{LocalSocket, Mac};
use crate::node::replies::ExpectedReplies;
use crate::packet::Packet;
use crate::sync::MutexExt;
use crate::trace::Trace;

/// One recorded wire send.
#[derive(Clone, Debug)]
pub(crate) struct WireSend {
    pub local_socket: LocalSocket,
    pub remote: SocketAddr,
    pub data: Vec<u8>,
}

impl WireSend {
    /// Parse the recorded bytes as a packet frame.
    pub fn packet(&self) -> Packet {
        Packet::from_bytes(&self.data).expect("recorded wire send is a valid packet")
    }

    /// Keepalives are sub-minimum single-byte sends, not packets.
    pub fn is_keepalive(&self) -> bool {
        self.data.len() < crate::packet::MIN_PACKET_LENGTH
    }
}

/// One recorded tap frame delivery.
#[derive(Clone, Debug)]
pub(crate) struct TapFrame {
    pub nwid: u64,
    pub source_mac: Mac,
    pub dest_mac: Mac,
    pub ether_type: u16,
    pub frame: Vec<u8>,
}

/// One recorded port-configure callback.
#[derive(Clone, Debug)]
pub(crate) struct PortOp {
    pub nwid: u64,
    pub user: UserTag,
    pub op: VirtualNetworkConfigOperation,
    pub config: VirtualNetworkConfig,
}

/// A host that records every callback and serves state from memory.
#[derive(Default)]
pub(crate) struct TestHost {
    pub events: Mutex<Vec<Event>>,
    pub wire: Mutex<Vec<WireSend>>,
    pub frames: Mutex<Vec<TapFrame>>,
    pub ports: Mutex<Vec<PortOp>>,
    pub state: Mutex<HashMap<(StateObjectKind, u64), Vec<u8>>>,
    /// When false, wire sends report failure.
    pub wire_ok: AtomicBool,
    /// When false, path_check vetoes everything.
    pub path_check_ok: AtomicBool,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            wire_ok: AtomicBool::new(true),
            path_check_ok: AtomicBool::new(true),
            ..Self::default()
        })
    }

    pub fn events_snapshot(&self) -> Vec<Event> {
        self.events.lock_unpoisoned().clone()
    }

    pub fn wire_snapshot(&self) -> Vec<WireSend> {
        self.wire.lock_unpoisoned().clone()
    }

    pub fn clear_wire(&self) {
        self.wire.lock_unpoisoned().clear();
    }

    pub fn ports_snapshot(&self) -> Vec<PortOp> {
        self.ports.lock_unpoisoned().clone()
    }

    pub fn frames_snapshot(&self) -> Vec<TapFrame> {
        self.frames.lock_unpoisoned().clone()
    }

    pub fn state_get_copy(&self, kind: StateObjectKind, scope: u64) -> Option<Vec<u8>> {
        self.state.lock_unpoisoned().get(&(kind, scope)).cloned()
    }
}

impl NodeHost for TestHost {
    fn state_object_get(
        &self,
        _cc: CallContext,
        kind: StateObjectKind,
        scope: u64,
    ) -> Option<Vec<u8>> {
        self.state_get_copy(kind, scope)
    }

    fn state_object_put(
        &self,
        _cc: CallContext,
        kind: StateObjectKind,
        scope: u64,
        data: &[u8],
    ) -> bool {
        self.state
            .lock_unpoisoned()
            .insert((kind, scope), data.to_vec());
        true
    }

    fn state_object_delete(&self, _cc: CallContext, kind: StateObjectKind, scope: u64) {
        self.state.lock_unpoisoned().remove(&(kind, scope));
    }

    fn wire_packet_send(
        &self,
        _cc: CallContext,
        local_socket: LocalSocket,
        remote: &SocketAddr,
        data: &[u8],
    ) -> bool {
        if !self.wire_ok.load(Ordering::Relaxed) {
            return false;
        }
        self.wire.lock_unpoisoned().push(WireSend {
            local_socket,
            remote: *remote,
            data: data.to_vec(),
        });
        true
    }

    fn virtual_network_frame(
        &self,
        _cc: CallContext,
        nwid: u64,
        _user: UserTag,
        source_mac: Mac,
        dest_mac: Mac,
        ether_type: u16,
        _vlan_id: u16,
        frame: &[u8],
    ) {
        self.frames.lock_unpoisoned().push(TapFrame {
            nwid,
            source_mac,
            dest_mac,
            ether_type,
            frame: frame.to_vec(),
        });
    }

    fn virtual_network_config(
        &self,
        _cc: CallContext,
        nwid: u64,
        user: UserTag,
        op: VirtualNetworkConfigOperation,
        config: &VirtualNetworkConfig,
    ) {
        self.ports.lock_unpoisoned().push(PortOp {
            nwid,
            user,
            op,
            config: config.clone(),
        });
    }

    fn path_check(
        &self,
        _cc: CallContext,
        _peer: crate::identity::Address,
        _local_socket: LocalSocket,
        _remote: &SocketAddr,
    ) -> bool {
        self.path_check_ok.load(Ordering::Relaxed)
    }

    fn event(&self, _cc: CallContext, event: &Event) {
        self.events.lock_unpoisoned().push(event.clone());
    }
}

/// Build a context around a recording host and a fresh identity.
pub(crate) fn make_ctx_with_host(host: Arc<TestHost>) -> Arc<Context> {
    let identity = Identity::generate();
    make_ctx_with_identity(host, identity)
}

/// Build a context around a recording host and an explicit identity.
pub(crate) fn make_ctx_with_identity(host: Arc<TestHost>, identity: Identity) -> Arc<Context> {
    Arc::new(Context {
        host,
        public_identity_str: identity.to_public_string(),
        secret_identity_str: identity.to_secret_string().expect("identity has secret"),
        identity,
        replies: ExpectedReplies::new(),
        controller: RwLock::new(None),
        trace: Trace::new(),
    })
}

/// Build a context with a host nobody inspects.
pub(crate) fn make_ctx() -> Arc<Context> {
    make_ctx_with_host(TestHost::new())
}

/// A fully wired set of engine subordinates around a recording host.
pub(crate) struct EngineParts {
    pub host: Arc<TestHost>,
    pub ctx: Arc<Context>,
    pub topology: Arc<crate::topology::Topology>,
    pub multicaster: Arc<crate::multicast::Multicaster>,
    pub self_awareness: Arc<crate::self_awareness::SelfAwareness>,
    pub networks: Arc<crate::network::NetworkRegistry>,
    pub switch: Arc<crate::switch::Switch>,
}

/// Wire up topology, caches, registry, and switch the way the engine does.
pub(crate) fn make_engine_parts() -> EngineParts {
    let host = TestHost::new();
    let ctx = make_ctx_with_host(Arc::clone(&host));
    let topology = Arc::new(crate::topology::Topology::new(
        Arc::clone(&ctx),
        CallContext::default(),
    ));
    let multicaster = Arc::new(crate::multicast::Multicaster::new());
    let self_awareness = Arc::new(crate::self_awareness::SelfAwareness::new());
    let networks = Arc::new(crate::network::NetworkRegistry::new());
    let switch = Arc::new(crate::switch::Switch::new(
        Arc::clone(&ctx),
        Arc::clone(&topology),
        Arc::clone(&multicaster),
        Arc::clone(&self_awareness),
        Arc::clone(&networks),
    ));
    EngineParts {
        host,
        ctx,
        topology,
        multicaster,
        self_awareness,
        networks,
        switch,
    }
}

/// Register a peer for `identity` with one alive path at `endpoint`.
pub(crate) fn seed_peer_with_path(
    parts: &EngineParts,
    identity: Identity,
    endpoint: &str,
    now: i64,
) -> Arc<crate::peer::Peer> {
    let peer = Arc::new(
        crate::peer::Peer::new(&parts.ctx.identity, identity, now).expect("valid identity"),
    );
    let peer = parts.topology.add_peer(peer);
    let path = parts
        .topology
        .get_path(LocalSocket(1), &endpoint.parse().expect("valid endpoint"));
    peer.received(&path, 0, true, now);
    peer
}
