//! The node engine.
//!
//! [`Node`] owns the long-lived identity, the topology, the joined
//! networks, the multicast and self-awareness caches, and the switch, and
//! exposes the host API: inbound datagrams, outbound tap frames, the
//! periodic background sweep, network membership lifecycle, and status
//! queries. It is a single logical instance, reentrant from multiple host
//! threads; every entry point takes its relevant lock and no internal
//! threads exist.
//!
//! Lock order, outermost first: the background-tasks lock, the networks
//! map, the direct-paths list, the controller-authorization cache. No entry
//! point holds two of these while calling into the switch or topology.

mod background;
mod netconf;
pub(crate) mod replies;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::config::NodeConfig;
use crate::context::Context;
use crate::controller::{ControllerSender, NetworkController};
use crate::host::{
    CallContext, Event, NodeCallbacks, NodeStatus, PathSnapshot, PeerSnapshot, StateObjectKind,
    UserTag, VirtualNetworkConfig, VirtualNetworkConfigOperation, NODE_CALLBACK_VERSION,
};
use crate::identity::{Address, Identity};
use crate::inet::{InetRange, LocalSocket, Mac};
use crate::multicast::{Multicaster, MulticastGroup};
use crate::network::{Network, NetworkRegistry};
use crate::packet::{Packet, Verb};
use crate::path::is_address_valid_for_path;
use crate::peer::Peer;
use crate::prng::XorShift128Plus;
use crate::self_awareness::SelfAwareness;
use crate::switch::Switch;
use crate::sync::{MutexExt, RwLockExt};
use crate::topology::{PhysicalPathConfig, Topology};
use crate::trace::Trace;
use crate::world::World;
use replies::ExpectedReplies;

/// How often the ping/contact pass of the background sweep runs (ms).
pub const PING_CHECK_INTERVAL: i64 = 62_000;

/// How often the slow housekeeping pass runs (ms).
pub const HOUSEKEEPING_PERIOD: i64 = 120_000;

/// Floor on the distance of the next background deadline (ms).
pub const CORE_TIMER_GRANULARITY: i64 = 500;

/// Errors surfaced across the host boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("network not found")]
    NetworkNotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("persistent data store failed")]
    DataStoreFailed,

    #[error("out of memory")]
    OutOfMemory,

    #[error("internal error")]
    Internal,
}

/// Result alias for the host API.
pub type NodeResult<T> = Result<T, NodeError>;

/// Timestamps driving the periodic sweep.
#[derive(Debug, Default)]
struct BackgroundState {
    last_ping_check: i64,
    last_housekeeping: i64,
    last_memoized_trace: i64,
}

/// Key of the local-controller authorization cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct LocalControllerAuth {
    nwid: u64,
    member: Address,
}

/// The engine.
pub struct Node {
    ctx: Arc<Context>,
    networks: Arc<NetworkRegistry>,
    topology: Arc<Topology>,
    multicaster: Arc<Multicaster>,
    self_awareness: Arc<SelfAwareness>,
    switch: Arc<Switch>,
    prng: Mutex<XorShift128Plus>,
    now: AtomicI64,
    online: AtomicBool,
    background_tasks: Mutex<BackgroundState>,
    direct_paths: Mutex<Vec<SocketAddr>>,
    local_controller_auth: Mutex<HashMap<LocalControllerAuth, i64>>,
    user: UserTag,
}

impl Node {
    /// Construct an engine with default configuration.
    pub fn new(
        callbacks: NodeCallbacks,
        user: UserTag,
        cc: CallContext,
        now: i64,
    ) -> NodeResult<Arc<Node>> {
        Self::with_config(callbacks, NodeConfig::default(), user, cc, now)
    }

    /// Construct an engine.
    ///
    /// Checks the callback table version, bootstraps the identity (load,
    /// else generate and persist), builds the subordinate components, emits
    /// the `Up` event, and applies the startup configuration.
    pub fn with_config(
        callbacks: NodeCallbacks,
        config: NodeConfig,
        user: UserTag,
        cc: CallContext,
        now: i64,
    ) -> NodeResult<Arc<Node>> {
        if callbacks.version != NODE_CALLBACK_VERSION {
            return Err(NodeError::InvalidArgument("callback table version"));
        }
        let host = callbacks.host;

        // identity bootstrap: explicit config wins, then the state store,
        // else generate fresh and persist both halves
        let mut loaded = match &config.identity_secret {
            Some(secret) => Some(
                Identity::from_str(secret)
                    .ok()
                    .filter(|id| id.has_secret())
                    .ok_or(NodeError::InvalidArgument("configured identity"))?,
            ),
            None => host
                .state_object_get(cc, StateObjectKind::IdentitySecret, 0)
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| Identity::from_str(&s).ok())
                .filter(|id| id.has_secret()),
        };

        let identity = match loaded.take() {
            Some(identity) => {
                // re-publish the public form if the store disagrees
                let public = identity.to_public_string();
                let scope = identity.address().to_u64();
                let stored =
                    host.state_object_get(cc, StateObjectKind::IdentityPublic, scope);
                if stored.as_deref() != Some(public.as_bytes()) {
                    host.state_object_put(
                        cc,
                        StateObjectKind::IdentityPublic,
                        scope,
                        public.as_bytes(),
                    );
                }
                identity
            }
            None => {
                let identity = Identity::generate();
                let secret = identity
                    .to_secret_string()
                    .map_err(|_| NodeError::Internal)?;
                let public = identity.to_public_string();
                if !host.state_object_put(
                    cc,
                    StateObjectKind::IdentitySecret,
                    0,
                    secret.as_bytes(),
                ) {
                    return Err(NodeError::DataStoreFailed);
                }
                if !host.state_object_put(
                    cc,
                    StateObjectKind::IdentityPublic,
                    identity.address().to_u64(),
                    public.as_bytes(),
                ) {
                    return Err(NodeError::DataStoreFailed);
                }
                identity
            }
        };

        // subordinates, in dependency order
        let ctx = Arc::new(Context {
            host,
            public_identity_str: identity.to_public_string(),
            secret_identity_str: identity
                .to_secret_string()
                .map_err(|_| NodeError::Internal)?,
            identity,
            replies: ExpectedReplies::new(),
            controller: RwLock::new(None),
            trace: Trace::new(),
        });
        let topology = Arc::new(Topology::new(Arc::clone(&ctx), cc));
        let multicaster = Arc::new(Multicaster::new());
        let self_awareness = Arc::new(SelfAwareness::new());
        let networks = Arc::new(NetworkRegistry::new());
        let switch = Arc::new(Switch::new(
            Arc::clone(&ctx),
            Arc::clone(&topology),
            Arc::clone(&multicaster),
            Arc::clone(&self_awareness),
            Arc::clone(&networks),
        ));

        let node = Arc::new(Node {
            ctx: Arc::clone(&ctx),
            networks,
            topology,
            multicaster,
            self_awareness,
            switch,
            prng: Mutex::new(XorShift128Plus::new()),
            now: AtomicI64::new(now),
            online: AtomicBool::new(false),
            background_tasks: Mutex::new(BackgroundState::default()),
            direct_paths: Mutex::new(Vec::new()),
            local_controller_auth: Mutex::new(HashMap::new()),
            user,
        });

        ctx.event(cc, &Event::Up);

        for nwid in config
            .network_ids()
            .map_err(|_| NodeError::InvalidArgument("configured network id"))?
        {
            node.join(nwid, UserTag::default(), cc)?;
        }
        for (world_id, seed) in config
            .moon_orbits()
            .map_err(|_| NodeError::InvalidArgument("configured moon"))?
        {
            node.orbit(cc, world_id, seed)?;
        }
        for address in &config.local_addresses {
            node.add_local_interface_address(address);
        }

        Ok(node)
    }

    // === Clocked entry points ===

    /// Hand the engine a raw inbound datagram.
    ///
    /// Invalid packets are silently dropped; they are not errors at this
    /// layer.
    pub fn process_wire_packet(
        &self,
        cc: CallContext,
        now: i64,
        local_socket: LocalSocket,
        remote: &SocketAddr,
        data: &[u8],
    ) -> NodeResult<()> {
        self.now.store(now, Ordering::Relaxed);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.switch.on_remote_packet(cc, local_socket, remote, data, now)
        }));
        Ok(())
    }

    /// Hand the engine an outbound Ethernet frame from a network's tap.
    #[allow(clippy::too_many_arguments)]
    pub fn process_virtual_network_frame(
        &self,
        cc: CallContext,
        now: i64,
        nwid: u64,
        source_mac: Mac,
        dest_mac: Mac,
        ether_type: u16,
        vlan_id: u16,
        frame: &[u8],
    ) -> NodeResult<()> {
        self.now.store(now, Ordering::Relaxed);
        let network = self.networks.get(nwid).ok_or(NodeError::NetworkNotFound)?;
        catch_unwind(AssertUnwindSafe(|| {
            self.switch.on_local_ethernet(
                cc, &network, source_mac, dest_mac, ether_type, vlan_id, frame, now,
            )
        }))
        .map_err(|_| NodeError::Internal)
    }

    // === Network membership ===

    /// Join a network. Idempotent.
    pub fn join(&self, nwid: u64, user: UserTag, cc: CallContext) -> NodeResult<()> {
        let now = self.now();
        self.networks.get_or_insert_with(nwid, || {
            Network::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.switch),
                nwid,
                user,
                cc,
                now,
            )
        });
        Ok(())
    }

    /// Leave a network.
    ///
    /// Returns the tag supplied at join, or `None` if the network was not
    /// joined (which is still success). Tears down the host port and
    /// deletes the persisted configuration.
    pub fn leave(&self, nwid: u64, cc: CallContext) -> NodeResult<Option<UserTag>> {
        self.switch.remove_network_qos_control_block(nwid);
        let Some(network) = self.networks.remove(nwid) else {
            return Ok(None);
        };
        let user = network.user();
        let external = network.external_config();
        network.destroy();
        self.ctx.host.virtual_network_config(
            cc,
            nwid,
            user,
            VirtualNetworkConfigOperation::Destroy,
            &external,
        );
        self.ctx
            .state_delete(cc, StateObjectKind::NetworkConfig, nwid);
        Ok(Some(user))
    }

    /// Subscribe a joined network to a multicast group.
    pub fn multicast_subscribe(
        &self,
        cc: CallContext,
        nwid: u64,
        group_mac: Mac,
        adi: u32,
    ) -> NodeResult<()> {
        let network = self.networks.get(nwid).ok_or(NodeError::NetworkNotFound)?;
        network.multicast_subscribe(cc, MulticastGroup::new(group_mac, adi), self.now());
        Ok(())
    }

    /// Unsubscribe a joined network from a multicast group.
    pub fn multicast_unsubscribe(&self, nwid: u64, group_mac: Mac, adi: u32) -> NodeResult<()> {
        let network = self.networks.get(nwid).ok_or(NodeError::NetworkNotFound)?;
        network.multicast_unsubscribe(MulticastGroup::new(group_mac, adi));
        Ok(())
    }

    // === Moons ===

    /// Begin orbiting a moon.
    pub fn orbit(&self, cc: CallContext, moon_world_id: u64, seed: Option<Address>) -> NodeResult<()> {
        self.topology.add_moon(cc, moon_world_id, seed);
        Ok(())
    }

    /// Stop orbiting a moon.
    pub fn deorbit(&self, cc: CallContext, moon_world_id: u64) -> NodeResult<()> {
        self.topology.remove_moon(cc, moon_world_id);
        Ok(())
    }

    /// The current planet document.
    pub fn planet(&self) -> World {
        self.topology.planet()
    }

    /// Currently orbited moons.
    pub fn moons(&self) -> Vec<World> {
        self.topology.moons()
    }

    // === Queries ===

    /// Our overlay address.
    pub fn address(&self) -> Address {
        self.ctx.address()
    }

    /// The opaque tag supplied at construction.
    pub fn user(&self) -> UserTag {
        self.user
    }

    /// Status snapshot.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.ctx.address(),
            public_identity: self.ctx.public_identity_str.clone(),
            secret_identity: self.ctx.secret_identity_str.clone(),
            online: self.online(),
        }
    }

    /// Whether an upstream has been heard from recently.
    pub fn online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Snapshot of all known peers, sorted by address.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let now = self.now();
        let mut peers = self.topology.all_peers();
        peers.sort_by_key(|p| p.address());
        peers
            .iter()
            .map(|peer| {
                let best = peer.get_appropriate_path(now, false);
                let paths = peer
                    .paths()
                    .iter()
                    .map(|path| PathSnapshot {
                        address: *path.address(),
                        local_socket: path.local_socket(),
                        last_send: path.last_out(),
                        last_receive: path.last_in(),
                        trusted_path_id: self.topology.get_outbound_path_trust(path.address()),
                        expired: !path.alive(now),
                        preferred: best
                            .as_ref()
                            .map(|b| Arc::ptr_eq(b, path))
                            .unwrap_or(false),
                    })
                    .collect();
                PeerSnapshot {
                    address: peer.address(),
                    version: peer.remote_version(),
                    latency_ms: peer.latency_ms(),
                    role: self.topology.role(peer.address()),
                    paths,
                }
            })
            .collect()
    }

    /// External config of one joined network.
    pub fn network_config(&self, nwid: u64) -> Option<VirtualNetworkConfig> {
        self.networks.get(nwid).map(|n| n.external_config())
    }

    /// External configs of all joined networks.
    pub fn networks(&self) -> Vec<VirtualNetworkConfig> {
        self.networks.all().iter().map(|n| n.external_config()).collect()
    }

    // === Local interfaces ===

    /// Register a locally bound address. Returns whether it was added.
    pub fn add_local_interface_address(&self, address: &SocketAddr) -> bool {
        if !is_address_valid_for_path(address) {
            return false;
        }
        let mut direct = self.direct_paths.lock_unpoisoned();
        if direct.contains(address) {
            return false;
        }
        direct.push(*address);
        true
    }

    /// Forget all locally bound addresses.
    pub fn clear_local_interface_addresses(&self) {
        self.direct_paths.lock_unpoisoned().clear();
    }

    /// Snapshot of locally bound addresses.
    pub fn local_interface_addresses(&self) -> Vec<SocketAddr> {
        self.direct_paths.lock_unpoisoned().clone()
    }

    // === Messaging and policy ===

    /// Send a user-defined message. Self-sends are refused.
    pub fn send_user_message(
        &self,
        cc: CallContext,
        dest: Address,
        type_id: u64,
        data: &[u8],
    ) -> bool {
        if dest == self.ctx.address() {
            return false;
        }
        let mut packet = Packet::outgoing(dest, self.ctx.address(), Verb::UserMessage);
        packet.append_u64(type_id);
        packet.append_bytes(data);
        self.ctx.replies.expect(packet.packet_id());
        self.switch.send(cc, packet, true, self.now());
        true
    }

    /// Install (or clear) an in-process network controller.
    pub fn set_netconf_master(
        self: &Arc<Self>,
        controller: Option<Arc<dyn NetworkController>>,
    ) {
        *self.ctx.controller.write_unpoisoned() = controller.clone();
        if let Some(controller) = controller {
            let sender_weak = Arc::downgrade(self);
            let sender: std::sync::Weak<dyn ControllerSender> = sender_weak;
            controller.init(&self.ctx.identity, sender);
        }
    }

    /// Install, replace, or remove a physical path rule.
    pub fn set_physical_path_configuration(
        &self,
        range: InetRange,
        config: Option<PhysicalPathConfig>,
    ) -> NodeResult<()> {
        self.topology.set_physical_path_configuration(range, config);
        Ok(())
    }

    /// Whether overlay traffic may use a candidate physical path.
    pub fn should_use_path_for_overlay_traffic(
        &self,
        cc: CallContext,
        peer: Address,
        local_socket: LocalSocket,
        remote: &SocketAddr,
    ) -> bool {
        self.switch.should_use_path(cc, peer, local_socket, remote)
    }

    // === Diagnostics ===

    /// Diagnostic side door: HELLO an explicit identity at an explicit
    /// endpoint, bypassing topology. Not a production path.
    pub fn contact_peer_at(
        &self,
        cc: CallContext,
        identity: &str,
        at_address: &SocketAddr,
        now: i64,
    ) -> bool {
        let Ok(identity) = Identity::from_str(identity) else {
            return false;
        };
        let Ok(peer) = Peer::new(&self.ctx.identity, identity, now) else {
            return false;
        };
        peer.attempt_to_contact_at(&self.ctx, cc, LocalSocket::ANY, at_address, now)
    }

    /// Diagnostic side door: HELLO every root of every orbited moon at its
    /// stable endpoints, bypassing topology. Not a production path.
    pub fn contact_orbits(&self, cc: CallContext) -> NodeResult<()> {
        let now = self.now();
        for moon in self.topology.moons() {
            for root in &moon.roots {
                if root.identity.address() == self.ctx.address() {
                    continue;
                }
                let Ok(peer) = Peer::new(&self.ctx.identity, root.identity.clone(), now) else {
                    continue;
                };
                for endpoint in &root.stable_endpoints {
                    peer.attempt_to_contact_at(&self.ctx, cc, LocalSocket::ANY, endpoint, now);
                }
            }
        }
        Ok(())
    }

    // === Internals ===

    /// Most recent clock value any entry point saw.
    pub(crate) fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Next value from the jitter PRNG.
    pub(crate) fn prng_next(&self) -> u64 {
        self.prng.lock_unpoisoned().next_u64()
    }

    #[cfg(test)]
    pub(crate) fn switch_for_tests(&self) -> &Arc<Switch> {
        &self.switch
    }

    #[cfg(test)]
    pub(crate) fn topology_for_tests(&self) -> &Arc<Topology> {
        &self.topology
    }
}

impl Drop for Node {
    /// Tear down every joined network (notifying the host) before the
    /// subordinates go away with the struct.
    fn drop(&mut self) {
        let cc = CallContext::default();
        for network in self.networks.clear() {
            let nwid = network.network_id();
            let user = network.user();
            let external = network.external_config();
            network.destroy();
            self.ctx.host.virtual_network_config(
                cc,
                nwid,
                user,
                VirtualNetworkConfigOperation::Destroy,
                &external,
            );
        }
    }
}
