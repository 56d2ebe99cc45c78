//! Joined virtual networks.
//!
//! A [`Network`] is one virtual Ethernet segment this node participates
//! in: its controller-issued configuration, the membership credentials we
//! hold and have seen, our multicast subscriptions, and the bridge to the
//! host's tap port. Networks are reference-counted because packet handlers
//! may hold one while the registry is mutated; the registry lock protects
//! only the map itself.

pub mod config;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::context::Context;
use crate::dictionary::{Dictionary, DICTIONARY_MAX_SIZE};
use crate::host::{
    CallContext, StateObjectKind, UserTag, VirtualNetworkConfig, VirtualNetworkConfigOperation,
    VirtualNetworkStatus, VirtualNetworkType,
};
use crate::identity::{Address, Identity};
use crate::inet::Mac;
use crate::multicast::MulticastGroup;
use crate::packet::{Packet, Reader, Verb};
use crate::switch::Switch;
use crate::sync::{MutexExt, RwLockExt};

pub use config::{NetworkConfig, NETWORK_AUTOCONF_DELAY};
use config::{controller_address_of, CertificateOfMembership, Revocation};

/// How often multicast subscriptions are re-announced (ms).
const MULTICAST_ANNOUNCE_PERIOD: i64 = 60_000;

/// A terminal controller answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NetconfFailure {
    AccessDenied,
    NotFound,
}

/// What we know about another member of this network.
#[derive(Clone, Debug, Default)]
struct Membership {
    /// Their certificate of membership, verified at acceptance.
    com: Option<CertificateOfMembership>,
    /// When we last pushed our own credentials to them.
    last_pushed: i64,
}

/// Reassembly state for a chunked configuration update.
#[derive(Debug)]
struct IncomingConfig {
    update_id: u64,
    total: u32,
    /// Byte offset -> chunk bytes.
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl IncomingConfig {
    fn received_bytes(&self) -> usize {
        self.chunks.values().map(|c| c.len()).sum()
    }

    /// Assemble if the chunks tile `[0, total)` contiguously.
    fn assemble(&self) -> Option<Vec<u8>> {
        if self.received_bytes() != self.total as usize {
            return None;
        }
        let mut out = Vec::with_capacity(self.total as usize);
        let mut expected = 0u32;
        for (offset, chunk) in &self.chunks {
            if *offset != expected {
                return None;
            }
            out.extend_from_slice(chunk);
            expected = expected.saturating_add(chunk.len() as u32);
        }
        (expected == self.total).then_some(out)
    }
}

#[derive(Debug, Default)]
struct NetworkInner {
    config: Option<NetworkConfig>,
    failure: Option<NetconfFailure>,
    last_config_update: i64,
    last_config_request: i64,
    incoming: Option<IncomingConfig>,
    multicast_groups: Vec<MulticastGroup>,
    membership: HashMap<Address, Membership>,
    last_multicast_announce: i64,
}

/// One joined virtual network.
pub struct Network {
    ctx: Arc<Context>,
    switch: Arc<Switch>,
    network_id: u64,
    mac: Mac,
    user: Mutex<UserTag>,
    inner: Mutex<NetworkInner>,
    destroyed: AtomicBool,
}

impl Network {
    /// Join-time construction: reload any persisted configuration, bring
    /// the host port up, and kick off a configuration request if we have no
    /// fresh config.
    pub(crate) fn new(
        ctx: Arc<Context>,
        switch: Arc<Switch>,
        network_id: u64,
        user: UserTag,
        cc: CallContext,
        now: i64,
    ) -> Arc<Network> {
        let mac = Mac::from_address(ctx.address(), network_id);
        let network = Arc::new(Network {
            ctx,
            switch,
            network_id,
            mac,
            user: Mutex::new(user),
            inner: Mutex::new(NetworkInner::default()),
            destroyed: AtomicBool::new(false),
        });

        if let Some(config) = network
            .ctx
            .state_get(cc, StateObjectKind::NetworkConfig, network_id)
            .and_then(|bytes| Dictionary::from_bytes(&bytes).ok())
            .and_then(|dict| NetworkConfig::from_dictionary(&dict).ok())
        {
            // persisted config must still be ours
            if config.network_id == network_id && config.issued_to == network.ctx.address() {
                let mut inner = network.inner.lock_unpoisoned();
                inner.config = Some(config);
                inner.last_config_update = now;
            }
        }

        network.port_event(cc, VirtualNetworkConfigOperation::Up);
        if !network.has_config() {
            network.request_configuration(cc, now);
        }
        network
    }

    /// The 64-bit network ID.
    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    /// Our MAC on this network.
    pub fn mac(&self) -> Mac {
        self.mac
    }

    /// The opaque tag supplied at join.
    pub fn user(&self) -> UserTag {
        *self.user.lock_unpoisoned()
    }

    /// Whether a configuration is installed.
    pub fn has_config(&self) -> bool {
        self.inner.lock_unpoisoned().config.is_some()
    }

    /// Clone of the current configuration.
    pub fn config_snapshot(&self) -> Option<NetworkConfig> {
        self.inner.lock_unpoisoned().config.clone()
    }

    /// When the configuration last changed.
    pub fn last_config_update(&self) -> i64 {
        self.inner.lock_unpoisoned().last_config_update
    }

    /// Membership state as visible to the host.
    pub fn status(&self) -> VirtualNetworkStatus {
        let inner = self.inner.lock_unpoisoned();
        match (inner.failure, &inner.config) {
            (Some(NetconfFailure::AccessDenied), _) => VirtualNetworkStatus::AccessDenied,
            (Some(NetconfFailure::NotFound), _) => VirtualNetworkStatus::NotFound,
            (None, Some(_)) => VirtualNetworkStatus::Ok,
            (None, None) => VirtualNetworkStatus::RequestingConfiguration,
        }
    }

    /// Whether `destroy` has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    // === Configuration lifecycle ===

    /// Ask the controller for a (new) configuration.
    ///
    /// Networks whose controller address is our own are served by the
    /// in-process controller, if any.
    pub fn request_configuration(&self, cc: CallContext, now: i64) {
        if self.is_destroyed() {
            return;
        }
        let Ok(controller) = controller_address_of(self.network_id) else {
            return;
        };
        self.inner.lock_unpoisoned().last_config_request = now;
        self.ctx.trace.network_config_requested(self.network_id);

        let mut metadata = Dictionary::new();
        metadata.set_u64("vProto", u64::from(crate::packet::PROTO_VERSION));
        metadata.set_u64("vMajor", u64::from(crate::VERSION_MAJOR));
        metadata.set_u64("vMinor", u64::from(crate::VERSION_MINOR));
        metadata.set_u64("vRev", u64::from(crate::VERSION_REVISION));

        if controller == self.ctx.address() {
            match self.ctx.controller() {
                Some(local) => {
                    local.request(cc, self.network_id, 0, &self.ctx.identity, &metadata)
                }
                None => self.set_not_found(),
            }
            return;
        }

        let (have_revision, have_timestamp) = {
            let inner = self.inner.lock_unpoisoned();
            inner
                .config
                .as_ref()
                .map(|c| (c.revision, c.timestamp))
                .unwrap_or((0, 0))
        };

        let mut packet = Packet::outgoing(controller, self.ctx.address(), Verb::NetworkConfigRequest);
        packet.append_u64(self.network_id);
        packet.append_u16_prefixed(&metadata.to_bytes());
        packet.append_u64(have_revision);
        packet.append_i64(have_timestamp);
        self.ctx.replies.expect(packet.packet_id());
        self.switch.send(cc, packet, true, now);
    }

    /// Ingest one configuration chunk.
    ///
    /// `chunk_region` starts at the network-ID field and runs to the end of
    /// the payload; the trailing signature, when present, covers everything
    /// before itself. Unsolicited chunks (`trusted_reply` false) must come
    /// from the controller address. Returns the config update ID when the
    /// chunk was accepted, zero otherwise.
    pub fn handle_config_chunk(
        &self,
        cc: CallContext,
        _packet_id: u64,
        source: Address,
        chunk_region: &[u8],
        trusted_reply: bool,
        controller_identity: Option<&Identity>,
        now: i64,
    ) -> u64 {
        if self.is_destroyed() {
            return 0;
        }
        let Ok(controller) = controller_address_of(self.network_id) else {
            return 0;
        };
        if !trusted_reply && source != controller {
            return 0;
        }

        let mut r = Reader::new(chunk_region);
        let Some(nwid) = r.read_u64() else { return 0 };
        if nwid != self.network_id {
            return 0;
        }
        let Some(chunk) = r.read_u16_prefixed().map(|c| c.to_vec()) else {
            return 0;
        };
        let Some(_flags) = r.read_u8() else { return 0 };
        let Some(update_id) = r.read_u64() else { return 0 };
        let Some(total) = r.read_u32() else { return 0 };
        let Some(index) = r.read_u32() else { return 0 };
        let signature_offset = chunk_region.len() - r.remaining();

        if update_id == 0 || total as usize > DICTIONARY_MAX_SIZE {
            return 0;
        }
        if index as usize + chunk.len() > total as usize {
            return 0;
        }

        // verify the chunk signature when the controller's identity is known
        match r.read_u8() {
            Some(1) => {
                let Some(signature) = r.read_u16_prefixed() else {
                    return 0;
                };
                if let Some(controller_identity) = controller_identity {
                    if !controller_identity.verify(&chunk_region[..signature_offset], signature) {
                        return 0;
                    }
                }
            }
            Some(_) => return 0,
            // unsigned chunks are tolerated only straight from the controller
            None => {
                if source != controller {
                    return 0;
                }
            }
        }

        let assembled = {
            let mut inner = self.inner.lock_unpoisoned();
            let restart = match &inner.incoming {
                Some(incoming) => incoming.update_id != update_id,
                None => true,
            };
            if restart {
                inner.incoming = Some(IncomingConfig {
                    update_id,
                    total,
                    chunks: BTreeMap::new(),
                });
            }
            let incoming = inner.incoming.as_mut().expect("just installed");
            if incoming.total != total {
                return 0;
            }
            incoming.chunks.insert(index, chunk);
            let assembled = incoming.assemble();
            if assembled.is_some() {
                inner.incoming = None;
            }
            assembled
        };

        if let Some(bytes) = assembled {
            let Ok(dict) = Dictionary::from_bytes(&bytes) else {
                return 0;
            };
            let Ok(config) = NetworkConfig::from_dictionary(&dict) else {
                return 0;
            };
            if !self.set_configuration(cc, config, true, now) {
                return 0;
            }
        }
        update_id
    }

    /// Install a configuration.
    ///
    /// Rejects configs for other networks or other members. Persists via
    /// the state-object callback when `save` is set and notifies the host
    /// port.
    pub fn set_configuration(
        &self,
        cc: CallContext,
        config: NetworkConfig,
        save: bool,
        now: i64,
    ) -> bool {
        if config.network_id != self.network_id || config.issued_to != self.ctx.address() {
            return false;
        }
        let dict_bytes = save.then(|| config.to_dictionary().to_bytes());
        {
            let mut inner = self.inner.lock_unpoisoned();
            inner.config = Some(config);
            inner.failure = None;
            inner.last_config_update = now;
        }
        if let Some(bytes) = dict_bytes {
            self.ctx
                .state_put(cc, StateObjectKind::NetworkConfig, self.network_id, &bytes);
        }
        self.port_event(cc, VirtualNetworkConfigOperation::ConfigUpdate);
        true
    }

    /// Controller says we are not authorized.
    pub fn set_access_denied(&self) {
        self.inner.lock_unpoisoned().failure = Some(NetconfFailure::AccessDenied);
    }

    /// Controller does not know this network.
    pub fn set_not_found(&self) {
        self.inner.lock_unpoisoned().failure = Some(NetconfFailure::NotFound);
    }

    // === Membership ===

    /// Whether traffic from this member may pass to the tap.
    ///
    /// Public networks admit anyone once we are configured; private
    /// networks require a fresh certificate of membership from the member.
    pub fn gate_peer(&self, member: Address, _now: i64) -> bool {
        let inner = self.inner.lock_unpoisoned();
        let Some(config) = &inner.config else {
            return false;
        };
        if config.is_public() {
            return true;
        }
        let Some(membership) = inner.membership.get(&member) else {
            return false;
        };
        let Some(com) = &membership.com else {
            return false;
        };
        com.network_id == self.network_id
            && (config.timestamp - com.timestamp).abs() <= config.credential_time_max_delta
    }

    /// Accept a member's certificate of membership.
    ///
    /// The certificate must name its presenter, and must verify against the
    /// controller's identity; without the controller's identity at hand we
    /// refuse rather than trust.
    pub fn add_credential_com(
        &self,
        source: Address,
        com: CertificateOfMembership,
        controller_identity: Option<&Identity>,
        _now: i64,
    ) -> bool {
        if com.network_id != self.network_id || com.issued_to != source {
            return false;
        }
        match controller_identity {
            Some(id) if com.verify(id) => {
                let mut inner = self.inner.lock_unpoisoned();
                inner.membership.entry(source).or_default().com = Some(com);
                true
            }
            _ => false,
        }
    }

    /// Apply a credential revocation from the controller.
    pub fn add_credential_revocation(
        &self,
        rev: &Revocation,
        controller_identity: Option<&Identity>,
        _now: i64,
    ) -> bool {
        if rev.network_id != self.network_id {
            return false;
        }
        let Some(controller_identity) = controller_identity else {
            return false;
        };
        if !rev.verify(controller_identity) {
            return false;
        }
        let mut inner = self.inner.lock_unpoisoned();
        if let Some(membership) = inner.membership.get_mut(&rev.target) {
            let dead = membership
                .com
                .as_ref()
                .map(|com| com.timestamp < rev.threshold)
                .unwrap_or(false);
            if dead {
                membership.com = None;
            }
            return dead;
        }
        false
    }

    // === Multicast ===

    /// Subscribe to a group. Announces immediately when newly added.
    pub fn multicast_subscribe(&self, cc: CallContext, group: MulticastGroup, now: i64) -> bool {
        let added = {
            let mut inner = self.inner.lock_unpoisoned();
            match inner.multicast_groups.binary_search(&group) {
                Ok(_) => false,
                Err(pos) => {
                    inner.multicast_groups.insert(pos, group);
                    true
                }
            }
        };
        if added {
            self.announce_multicast_groups(cc, now);
        }
        added
    }

    /// Drop a subscription.
    pub fn multicast_unsubscribe(&self, group: MulticastGroup) -> bool {
        let mut inner = self.inner.lock_unpoisoned();
        match inner.multicast_groups.binary_search(&group) {
            Ok(pos) => {
                inner.multicast_groups.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Current subscriptions.
    pub fn multicast_groups(&self) -> Vec<MulticastGroup> {
        self.inner.lock_unpoisoned().multicast_groups.clone()
    }

    /// Whether inbound multicast to this group should reach the tap.
    pub fn is_subscribed(&self, group: MulticastGroup) -> bool {
        if group.mac.is_broadcast() {
            return self
                .config_snapshot()
                .map(|c| c.broadcast_enabled)
                .unwrap_or(false);
        }
        self.inner
            .lock_unpoisoned()
            .multicast_groups
            .binary_search(&group)
            .is_ok()
    }

    /// Announce our subscriptions to the controller and anchors.
    fn announce_multicast_groups(&self, cc: CallContext, now: i64) {
        let groups = self.multicast_groups();
        if groups.is_empty() {
            return;
        }
        let mut targets: Vec<Address> = Vec::new();
        if let Ok(controller) = controller_address_of(self.network_id) {
            if controller != self.ctx.address() {
                targets.push(controller);
            }
        }
        if let Some(config) = self.config_snapshot() {
            for anchor in config.anchors() {
                if anchor != self.ctx.address() && !targets.contains(&anchor) {
                    targets.push(anchor);
                }
            }
        }
        for target in targets {
            let mut packet = Packet::outgoing(target, self.ctx.address(), Verb::MulticastLike);
            for group in &groups {
                packet.append_u64(self.network_id);
                packet.append_mac(group.mac);
                packet.append_u32(group.adi);
            }
            self.switch.send(cc, packet, true, now);
        }
        self.inner.lock_unpoisoned().last_multicast_announce = now;
    }

    // === Periodic work ===

    /// Whether the periodic sweep should request a new configuration.
    pub fn config_is_stale(&self, now: i64) -> bool {
        let inner = self.inner.lock_unpoisoned();
        inner.config.is_none()
            || now - inner.last_config_update >= NETWORK_AUTOCONF_DELAY
    }

    /// Push credential updates to members and refresh multicast announces.
    pub fn send_updates_to_members(&self, cc: CallContext, now: i64) {
        if self.is_destroyed() {
            return;
        }
        let (com, push_to) = {
            let mut inner = self.inner.lock_unpoisoned();
            let Some(config) = &inner.config else {
                return;
            };
            let Some(com) = config.com.clone() else {
                // public networks push nothing
                return;
            };
            let refresh = config.credential_time_max_delta / 3;
            let mut push_to = Vec::new();
            let members: Vec<Address> = inner.membership.keys().copied().collect();
            for member in members {
                let m = inner.membership.get_mut(&member).expect("key just listed");
                if now - m.last_pushed >= refresh {
                    m.last_pushed = now;
                    push_to.push(member);
                }
            }
            (com, push_to)
        };

        for member in push_to {
            let mut packet = Packet::outgoing(member, self.ctx.address(), Verb::NetworkCredentials);
            packet.append_u8(1); // COM count
            {
                let mut bytes = Vec::new();
                com.marshal(&mut bytes);
                packet.append_bytes(&bytes);
            }
            packet.append_u16(0); // capabilities
            packet.append_u16(0); // tags
            packet.append_u16(0); // revocations
            packet.append_u16(0); // certificates of ownership
            self.switch.send(cc, packet, true, now);
        }

        let announce_due =
            now - self.inner.lock_unpoisoned().last_multicast_announce >= MULTICAST_ANNOUNCE_PERIOD;
        if announce_due {
            self.announce_multicast_groups(cc, now);
        }
    }

    /// Add this network's anchors to the always-contact set.
    pub fn always_contact_addresses(&self, out: &mut HashMap<Address, Vec<SocketAddr>>) {
        if let Some(config) = self.config_snapshot() {
            for anchor in config.anchors() {
                if anchor != self.ctx.address() {
                    out.entry(anchor).or_default();
                }
            }
        }
    }

    // === Host port ===

    /// External snapshot for the host.
    pub fn external_config(&self) -> VirtualNetworkConfig {
        let inner = self.inner.lock_unpoisoned();
        let status = match (inner.failure, &inner.config) {
            (Some(NetconfFailure::AccessDenied), _) => VirtualNetworkStatus::AccessDenied,
            (Some(NetconfFailure::NotFound), _) => VirtualNetworkStatus::NotFound,
            (None, Some(_)) => VirtualNetworkStatus::Ok,
            (None, None) => VirtualNetworkStatus::RequestingConfiguration,
        };
        let config = inner.config.as_ref();
        VirtualNetworkConfig {
            nwid: self.network_id,
            mac: self.mac,
            name: config.map(|c| c.name.clone()).unwrap_or_default(),
            status,
            net_type: config
                .map(|c| c.net_type)
                .unwrap_or(VirtualNetworkType::Private),
            mtu: config.map(|c| c.mtu).unwrap_or(config::DEFAULT_MTU),
            broadcast_enabled: config.map(|c| c.broadcast_enabled).unwrap_or(false),
            netconf_revision: config.map(|c| c.revision).unwrap_or(0),
            assigned_addresses: config.map(|c| c.static_ips.clone()).unwrap_or_default(),
            multicast_subscriptions: inner.multicast_groups.clone(),
        }
    }

    fn port_event(&self, cc: CallContext, op: VirtualNetworkConfigOperation) {
        let snapshot = self.external_config();
        self.ctx
            .host
            .virtual_network_config(cc, self.network_id, self.user(), op, &snapshot);
    }

    /// Tear down membership state. The port DESTROY callback is issued by
    /// the engine's leave path, which also erases the persisted config.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        let mut inner = self.inner.lock_unpoisoned();
        inner.membership.clear();
        inner.incoming = None;
    }
}

/// The map of joined networks, shared between the engine and the switch.
#[derive(Default)]
pub struct NetworkRegistry {
    networks: RwLock<HashMap<u64, Arc<Network>>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a network by ID.
    pub fn get(&self, nwid: u64) -> Option<Arc<Network>> {
        self.networks.read_unpoisoned().get(&nwid).cloned()
    }

    /// Whether a network is joined.
    pub fn contains(&self, nwid: u64) -> bool {
        self.networks.read_unpoisoned().contains_key(&nwid)
    }

    /// Number of joined networks.
    pub fn len(&self) -> usize {
        self.networks.read_unpoisoned().len()
    }

    /// Whether no networks are joined.
    pub fn is_empty(&self) -> bool {
        self.networks.read_unpoisoned().is_empty()
    }

    /// Snapshot of all joined networks.
    pub fn all(&self) -> Vec<Arc<Network>> {
        self.networks.read_unpoisoned().values().cloned().collect()
    }

    /// Get the existing entry or construct-and-insert under the map lock.
    ///
    /// The constructor runs while the lock is held so a concurrent join of
    /// the same network cannot double-construct; host callbacks fired
    /// during construction must therefore not re-enter the engine.
    pub(crate) fn get_or_insert_with(
        &self,
        nwid: u64,
        construct: impl FnOnce() -> Arc<Network>,
    ) -> (Arc<Network>, bool) {
        let mut networks = self.networks.write_unpoisoned();
        if let Some(existing) = networks.get(&nwid) {
            return (existing.clone(), false);
        }
        let network = construct();
        networks.insert(nwid, network.clone());
        (network, true)
    }

    /// Remove a network from the map.
    pub(crate) fn remove(&self, nwid: u64) -> Option<Arc<Network>> {
        self.networks.write_unpoisoned().remove(&nwid)
    }

    /// Remove every network, returning them for teardown.
    pub(crate) fn clear(&self) -> Vec<Arc<Network>> {
        self.networks.write_unpoisoned().drain().map(|(_, n)| n).collect()
    }
}
