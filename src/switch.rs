//! Packet dispatch.
//!
//! The switch sits between the wire and everything else. Inbound datagrams
//! are parsed, dispatched by verb, and update topology, self-awareness, the
//! multicast cache, and network membership; decrypted frames surface at the
//! host's tap port. Outbound frames from the tap pick a path (direct,
//! upstream relay, or queue-behind-WHOIS) and leave through the host's wire
//! callback. Invalid input is dropped, never an error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::dictionary::Dictionary;
use crate::host::{CallContext, Event, UserMessage};
use crate::identity::{Address, Identity};
use crate::inet::{LocalSocket, Mac};
use crate::multicast::{Multicaster, MulticastGroup, OutboundMulticast};
use crate::network::config::{controller_address_of, CertificateOfMembership, Revocation};
use crate::network::{Network, NetworkRegistry};
use crate::packet::{
    ErrorCode, Packet, Reader, Verb, MIN_PACKET_LENGTH, PROTO_VERSION,
};
use crate::path::{is_address_valid_for_path, Path};
use crate::peer::{Peer, RemoteVersion};
use crate::self_awareness::SelfAwareness;
use crate::sync::MutexExt;
use crate::topology::{Role, Topology};
use crate::world::World;

/// Delay between WHOIS retries (ms).
const WHOIS_RETRY_DELAY: i64 = 500;

/// WHOIS attempts before giving up on an address.
const MAX_WHOIS_RETRIES: u8 = 3;

/// Packets queued behind a WHOIS are dropped after this long (ms).
const TX_QUEUE_TIMEOUT: i64 = 5_000;

/// Timer hint returned when nothing urgent is pending (ms).
const DEFAULT_TIMER_HINT: i64 = 60_000;

#[derive(Debug)]
struct WhoisRequest {
    last_sent: i64,
    retries: u8,
}

struct TxQueueEntry {
    dest: Address,
    packet: Packet,
    encrypt: bool,
    since: i64,
}

/// Per-network outbound accounting, torn down on leave.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkQos {
    pub frames_out: u64,
    pub bytes_out: u64,
}

/// The packet dispatcher.
pub struct Switch {
    ctx: Arc<Context>,
    topology: Arc<Topology>,
    multicaster: Arc<Multicaster>,
    self_awareness: Arc<SelfAwareness>,
    networks: Arc<NetworkRegistry>,
    whois_outstanding: Mutex<HashMap<Address, WhoisRequest>>,
    tx_queue: Mutex<Vec<TxQueueEntry>>,
    qos: Mutex<HashMap<u64, NetworkQos>>,
}

impl Switch {
    pub(crate) fn new(
        ctx: Arc<Context>,
        topology: Arc<Topology>,
        multicaster: Arc<Multicaster>,
        self_awareness: Arc<SelfAwareness>,
        networks: Arc<NetworkRegistry>,
    ) -> Self {
        Self {
            ctx,
            topology,
            multicaster,
            self_awareness,
            networks,
            whois_outstanding: Mutex::new(HashMap::new()),
            tx_queue: Mutex::new(Vec::new()),
            qos: Mutex::new(HashMap::new()),
        }
    }

    // === Inbound ===

    /// Entry point for a raw inbound datagram.
    pub fn on_remote_packet(
        &self,
        cc: CallContext,
        local_socket: LocalSocket,
        remote: &SocketAddr,
        data: &[u8],
        now: i64,
    ) {
        if data.len() < MIN_PACKET_LENGTH {
            // single-byte keepalives land here by design; nothing to do
            return;
        }
        let packet = match Packet::from_bytes(data) {
            Ok(p) => p,
            Err(e) => {
                self.ctx.trace.packet_dropped(remote, &e.to_string());
                return;
            }
        };

        if packet.dest() != self.ctx.address() {
            self.try_relay(cc, packet, now);
            return;
        }
        let source = packet.source();
        if source == self.ctx.address() {
            self.ctx.trace.packet_dropped(remote, "spoofed self source");
            return;
        }

        let path = self.topology.get_path(local_socket, remote);
        match packet.verb() {
            Verb::Nop => {}
            Verb::Hello => self.handle_hello(cc, &path, &packet, now),
            verb => {
                let Some(peer) = self.topology.get_peer(source) else {
                    // can't authenticate this yet; learn who it is first
                    self.request_whois(cc, source, now);
                    return;
                };
                let learn =
                    self.should_use_path(cc, source, local_socket, remote);
                peer.received(&path, packet.hops(), learn, now);
                match verb {
                    Verb::Ok => self.handle_ok(cc, &peer, &path, &packet, now),
                    Verb::Error => self.handle_error(cc, &peer, &packet, now),
                    Verb::Whois => self.handle_whois(cc, &peer, &packet, now),
                    Verb::Frame => self.handle_frame(cc, &peer, &packet, now),
                    Verb::Echo => self.handle_echo(cc, &peer, &path, &packet, now),
                    Verb::MulticastFrame => self.handle_multicast_frame(cc, &peer, &packet, now),
                    Verb::MulticastLike => self.handle_multicast_like(cc, &peer, &packet, now),
                    Verb::MulticastGather => self.handle_multicast_gather(cc, &peer, &path, &packet, now),
                    Verb::NetworkConfig => self.handle_network_config(cc, &peer, &packet, now),
                    Verb::NetworkConfigRequest => {
                        self.handle_network_config_request(cc, &peer, &packet, now)
                    }
                    Verb::NetworkCredentials => {
                        self.handle_network_credentials(cc, &peer, &packet, now)
                    }
                    Verb::UserMessage => self.handle_user_message(cc, &peer, &packet),
                    Verb::Nop | Verb::Hello => unreachable!("handled above"),
                }
            }
        }
    }

    /// HELLO: the one verb that may come from an unknown peer.
    fn handle_hello(&self, cc: CallContext, path: &Arc<Path>, packet: &Packet, now: i64) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let (Some(proto), Some(major), Some(minor), Some(revision), Some(timestamp)) = (
            r.read_u8(),
            r.read_u8(),
            r.read_u8(),
            r.read_u16(),
            r.read_i64(),
        ) else {
            self.ctx.trace.verb_dropped(source, Verb::Hello, "truncated");
            return;
        };
        let identity = r
            .read_u16_prefixed()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse::<Identity>().ok());
        let Some(identity) = identity else {
            self.ctx.trace.verb_dropped(source, Verb::Hello, "bad identity");
            return;
        };
        if identity.address() != source {
            self.ctx
                .trace
                .verb_dropped(source, Verb::Hello, "identity/source mismatch");
            return;
        }

        let peer = match self.topology.get_peer(source) {
            Some(existing) => {
                if existing.identity() != &identity.to_public() {
                    // same address, different key: collision attempt
                    self.ctx
                        .trace
                        .verb_dropped(source, Verb::Hello, "identity collision");
                    return;
                }
                existing
            }
            None => match Peer::new(&self.ctx.identity, identity, now) {
                Ok(peer) => self.topology.add_peer(Arc::new(peer)),
                Err(_) => {
                    self.ctx
                        .trace
                        .verb_dropped(source, Verb::Hello, "invalid identity");
                    return;
                }
            },
        };

        let learn = self.should_use_path(cc, source, path.local_socket(), path.address());
        if learn && packet.hops() == 0 {
            self.ctx.trace.learned_path(source, path.address());
        }
        peer.received(path, packet.hops(), learn, now);
        peer.set_remote_version(RemoteVersion {
            proto,
            major,
            minor,
            revision,
        });

        // acknowledge: echo their timestamp, reflect their physical address,
        // and piggyback our planet for root-set gossip
        let mut ok = Packet::outgoing(source, self.ctx.address(), Verb::Ok);
        ok.append_u8(Verb::Hello as u8);
        ok.append_u64(packet.packet_id());
        ok.append_i64(timestamp);
        ok.append_u8(PROTO_VERSION);
        ok.append_u8(crate::VERSION_MAJOR);
        ok.append_u8(crate::VERSION_MINOR);
        ok.append_u16(crate::VERSION_REVISION);
        ok.append_inet(Some(path.address()));
        let planet = self.topology.planet();
        if planet.timestamp > 0 {
            if let Ok(bytes) = serde_json::to_vec(&planet) {
                if bytes.len() <= usize::from(u16::MAX) {
                    ok.append_u16_prefixed(&bytes);
                }
            }
        }
        if path.send(&self.ctx, cc, ok.as_bytes(), now) {
            peer.sent(now);
        }
    }

    /// OK: replies are accepted only when the nonce was expected.
    fn handle_ok(
        &self,
        cc: CallContext,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        packet: &Packet,
        now: i64,
    ) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let (Some(in_re_verb), Some(in_re_id)) = (r.read_u8(), r.read_u64()) else {
            return;
        };
        let Some(in_re_verb) = Verb::from_u8(in_re_verb) else {
            return;
        };
        if !self.ctx.replies.expecting(in_re_id) {
            self.ctx
                .trace
                .verb_dropped(source, Verb::Ok, "unexpected reply");
            return;
        }

        match in_re_verb {
            Verb::Hello => {
                let (Some(timestamp), Some(proto), Some(major), Some(minor), Some(revision)) = (
                    r.read_i64(),
                    r.read_u8(),
                    r.read_u8(),
                    r.read_u8(),
                    r.read_u16(),
                ) else {
                    return;
                };
                let latency = (now - timestamp).clamp(0, 0xffff) as u32;
                path.update_latency(latency);
                peer.set_remote_version(RemoteVersion {
                    proto,
                    major,
                    minor,
                    revision,
                });
                if let Some(Some(reported)) = r.read_inet() {
                    let trusted = self.topology.role(source) != Role::Leaf;
                    if let Some(scope) = self.self_awareness.iam(
                        source,
                        path.local_socket(),
                        reported,
                        trusted,
                        now,
                    ) {
                        self.ctx.trace.external_surface_changed(source, &reported);
                        self.topology.reset_within_scope(scope, now);
                    }
                }
                if let Some(world_bytes) = r.read_u16_prefixed() {
                    if !world_bytes.is_empty() {
                        if let Ok(world) = serde_json::from_slice::<World>(world_bytes) {
                            self.topology.add_world(cc, world);
                        }
                    }
                }
            }
            Verb::Whois => {
                let identity = r
                    .read_u16_prefixed()
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .and_then(|s| s.parse::<Identity>().ok());
                if let Some(identity) = identity {
                    self.learn_identity(cc, identity, now);
                }
            }
            Verb::NetworkConfigRequest => {
                let region = r.read_rest();
                let mut peek = Reader::new(region);
                let Some(nwid) = peek.read_u64() else { return };
                let Some(network) = self.networks.get(nwid) else {
                    return;
                };
                let controller_identity = self.controller_identity_for(nwid);
                network.handle_config_chunk(
                    cc,
                    packet.packet_id(),
                    source,
                    region,
                    true,
                    controller_identity.as_ref(),
                    now,
                );
            }
            Verb::MulticastGather => {
                let (Some(nwid), Some(mac), Some(adi), Some(_total), Some(count)) = (
                    r.read_u64(),
                    r.read_mac(),
                    r.read_u32(),
                    r.read_u32(),
                    r.read_u16(),
                ) else {
                    return;
                };
                let group = MulticastGroup::new(mac, adi);
                for _ in 0..count {
                    let Some(member) = r.read_address() else { break };
                    self.multicaster.add(nwid, group, member, now);
                }
            }
            _ => {}
        }
    }

    /// ERROR: verb-scoped failure notices.
    ///
    /// Errors carry no expected-reply check; instead each case validates
    /// its own authority (config errors must come from the controller).
    fn handle_error(&self, cc: CallContext, _peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let (Some(in_re_verb), Some(_in_re_id), Some(code)) =
            (r.read_u8(), r.read_u64(), r.read_u8())
        else {
            return;
        };
        let (Some(in_re_verb), Some(code)) = (Verb::from_u8(in_re_verb), ErrorCode::from_u8(code))
        else {
            return;
        };

        match (in_re_verb, code) {
            (Verb::NetworkConfigRequest, ErrorCode::ObjNotFound)
            | (Verb::NetworkConfigRequest, ErrorCode::UnsupportedOperation) => {
                let Some(nwid) = r.read_u64() else { return };
                if controller_address_of(nwid).ok() != Some(source) {
                    return;
                }
                if let Some(network) = self.networks.get(nwid) {
                    network.set_not_found();
                }
            }
            (Verb::NetworkConfigRequest, ErrorCode::NetworkAccessDenied) => {
                let Some(nwid) = r.read_u64() else { return };
                if controller_address_of(nwid).ok() != Some(source) {
                    return;
                }
                if let Some(network) = self.networks.get(nwid) {
                    network.set_access_denied();
                }
            }
            (Verb::Frame, ErrorCode::NeedMembershipCredential) => {
                // our frame bounced off a member that has never seen our
                // certificate; push credentials straight away
                let Some(nwid) = r.read_u64() else { return };
                let Some(network) = self.networks.get(nwid) else {
                    return;
                };
                let Some(com) = network.config_snapshot().and_then(|c| c.com) else {
                    return;
                };
                let mut packet =
                    Packet::outgoing(source, self.ctx.address(), Verb::NetworkCredentials);
                packet.append_u8(1);
                let mut bytes = Vec::new();
                com.marshal(&mut bytes);
                packet.append_bytes(&bytes);
                packet.append_u16(0);
                packet.append_u16(0);
                packet.append_u16(0);
                packet.append_u16(0);
                self.send(cc, packet, true, now);
            }
            _ => {}
        }
    }

    /// WHOIS: identity lookup requests from other nodes.
    fn handle_whois(&self, cc: CallContext, peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let mut r = Reader::new(packet.payload());
        while let Some(target) = r.read_address() {
            let identity_str = if target == self.ctx.address() {
                Some(self.ctx.public_identity_str.clone())
            } else {
                self.topology
                    .get_peer(target)
                    .map(|p| p.identity().to_public_string())
            };
            match identity_str {
                Some(identity_str) => {
                    let mut ok =
                        Packet::outgoing(peer.address(), self.ctx.address(), Verb::Ok);
                    ok.append_u8(Verb::Whois as u8);
                    ok.append_u64(packet.packet_id());
                    ok.append_u16_prefixed(identity_str.as_bytes());
                    self.send(cc, ok, true, now);
                }
                None => {
                    let mut err =
                        Packet::outgoing(peer.address(), self.ctx.address(), Verb::Error);
                    err.append_u8(Verb::Whois as u8);
                    err.append_u64(packet.packet_id());
                    err.append_u8(ErrorCode::ObjNotFound as u8);
                    err.append_address(target);
                    self.send(cc, err, true, now);
                }
            }
        }
    }

    /// ECHO: reflect the payload.
    fn handle_echo(
        &self,
        cc: CallContext,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        packet: &Packet,
        now: i64,
    ) {
        let mut ok = Packet::outgoing(packet.source(), self.ctx.address(), Verb::Ok);
        ok.append_u8(Verb::Echo as u8);
        ok.append_u64(packet.packet_id());
        ok.append_bytes(packet.payload());
        if path.send(&self.ctx, cc, ok.as_bytes(), now) {
            peer.sent(now);
        }
    }

    /// FRAME: unicast Ethernet payload for one of our networks.
    fn handle_frame(&self, cc: CallContext, _peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let (Some(nwid), Some(ether_type)) = (r.read_u64(), r.read_u16()) else {
            return;
        };
        let Some(network) = self.networks.get(nwid) else {
            self.ctx.trace.verb_dropped(source, Verb::Frame, "unknown network");
            return;
        };
        if !network.gate_peer(source, now) {
            self.ctx.trace.frame_dropped(nwid, "sender not authorized");
            let mut err = Packet::outgoing(source, self.ctx.address(), Verb::Error);
            err.append_u8(Verb::Frame as u8);
            err.append_u64(packet.packet_id());
            err.append_u8(ErrorCode::NeedMembershipCredential as u8);
            err.append_u64(nwid);
            self.send(cc, err, true, now);
            return;
        }
        let frame = r.read_rest();
        self.ctx.host.virtual_network_frame(
            cc,
            nwid,
            network.user(),
            Mac::from_address(source, nwid),
            network.mac(),
            ether_type,
            0,
            frame,
        );
    }

    /// MULTICAST_FRAME: replicated group Ethernet payload.
    fn handle_multicast_frame(&self, cc: CallContext, _peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let (Some(nwid), Some(mac), Some(adi), Some(ether_type)) =
            (r.read_u64(), r.read_mac(), r.read_u32(), r.read_u16())
        else {
            return;
        };
        let Some(network) = self.networks.get(nwid) else {
            return;
        };
        if !network.gate_peer(source, now) {
            self.ctx.trace.frame_dropped(nwid, "sender not authorized");
            let mut err = Packet::outgoing(source, self.ctx.address(), Verb::Error);
            err.append_u8(Verb::Frame as u8);
            err.append_u64(packet.packet_id());
            err.append_u8(ErrorCode::NeedMembershipCredential as u8);
            err.append_u64(nwid);
            self.send(cc, err, true, now);
            return;
        }
        let group = MulticastGroup::new(mac, adi);
        if !network.is_subscribed(group) {
            self.ctx.trace.frame_dropped(nwid, "not subscribed");
            return;
        }
        let frame = r.read_rest();
        self.ctx.host.virtual_network_frame(
            cc,
            nwid,
            network.user(),
            Mac::from_address(source, nwid),
            group.mac,
            ether_type,
            0,
            frame,
        );
    }

    /// MULTICAST_LIKE: subscription announcements.
    fn handle_multicast_like(&self, _cc: CallContext, _peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        while r.remaining() >= 18 {
            let (Some(nwid), Some(mac), Some(adi)) = (r.read_u64(), r.read_mac(), r.read_u32())
            else {
                return;
            };
            let authorized = self
                .networks
                .get(nwid)
                .map(|n| n.gate_peer(source, now))
                .unwrap_or(false);
            if authorized {
                self.multicaster
                    .add(nwid, MulticastGroup::new(mac, adi), source, now);
            }
        }
    }

    /// MULTICAST_GATHER: member-list queries against our cache.
    fn handle_multicast_gather(
        &self,
        cc: CallContext,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        packet: &Packet,
        now: i64,
    ) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let (Some(nwid), Some(mac), Some(adi), Some(limit)) =
            (r.read_u64(), r.read_mac(), r.read_u32(), r.read_u32())
        else {
            return;
        };
        let group = MulticastGroup::new(mac, adi);
        let limit = (limit as usize).min(255);
        let members = self
            .multicaster
            .members(nwid, group, Some(source), limit, now);
        if members.is_empty() {
            return;
        }
        let total = self.multicaster.member_count(nwid, group, now) as u32;
        let mut ok = Packet::outgoing(source, self.ctx.address(), Verb::Ok);
        ok.append_u8(Verb::MulticastGather as u8);
        ok.append_u64(packet.packet_id());
        ok.append_u64(nwid);
        ok.append_mac(group.mac);
        ok.append_u32(group.adi);
        ok.append_u32(total);
        ok.append_u16(members.len() as u16);
        for member in members {
            ok.append_address(member);
        }
        if path.send(&self.ctx, cc, ok.as_bytes(), now) {
            peer.sent(now);
        }
    }

    /// NETWORK_CONFIG: unsolicited config push from a controller.
    fn handle_network_config(&self, cc: CallContext, _peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let mut peek = Reader::new(packet.payload());
        let Some(nwid) = peek.read_u64() else { return };
        let Some(network) = self.networks.get(nwid) else {
            return;
        };
        let controller_identity = self.controller_identity_for(nwid);
        network.handle_config_chunk(
            cc,
            packet.packet_id(),
            packet.source(),
            packet.payload(),
            false,
            controller_identity.as_ref(),
            now,
        );
    }

    /// NETWORK_CONFIG_REQUEST: a member asking us (as controller) for its
    /// configuration.
    fn handle_network_config_request(
        &self,
        cc: CallContext,
        peer: &Arc<Peer>,
        packet: &Packet,
        now: i64,
    ) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let Some(nwid) = r.read_u64() else { return };
        match self.ctx.controller() {
            Some(controller) => {
                let metadata = r
                    .read_u16_prefixed()
                    .and_then(|b| Dictionary::from_bytes(b).ok())
                    .unwrap_or_default();
                controller.request(cc, nwid, packet.packet_id(), peer.identity(), &metadata);
            }
            None => {
                let mut err = Packet::outgoing(source, self.ctx.address(), Verb::Error);
                err.append_u8(Verb::NetworkConfigRequest as u8);
                err.append_u64(packet.packet_id());
                err.append_u8(ErrorCode::UnsupportedOperation as u8);
                err.append_u64(nwid);
                self.send(cc, err, true, now);
            }
        }
    }

    /// NETWORK_CREDENTIALS: certificates and revocations from members or
    /// the controller.
    fn handle_network_credentials(
        &self,
        _cc: CallContext,
        _peer: &Arc<Peer>,
        packet: &Packet,
        now: i64,
    ) {
        let source = packet.source();
        let mut r = Reader::new(packet.payload());
        let Some(com_count) = r.read_u8() else { return };
        for _ in 0..com_count {
            let Some(com) = CertificateOfMembership::unmarshal(&mut r) else {
                return;
            };
            if let Some(network) = self.networks.get(com.network_id) {
                let controller_identity = self.controller_identity_for(com.network_id);
                network.add_credential_com(source, com, controller_identity.as_ref(), now);
            }
        }
        let (Some(caps), Some(tags)) = (r.read_u16(), r.read_u16()) else {
            return;
        };
        if caps != 0 || tags != 0 {
            // we issue neither; a nonzero count means a format we don't speak
            return;
        }
        let Some(rev_count) = r.read_u16() else { return };
        for _ in 0..rev_count {
            let Some(rev) = Revocation::unmarshal(&mut r) else {
                return;
            };
            if controller_address_of(rev.network_id).ok() != Some(source) {
                continue;
            }
            if let Some(network) = self.networks.get(rev.network_id) {
                let controller_identity = self.controller_identity_for(rev.network_id);
                network.add_credential_revocation(&rev, controller_identity.as_ref(), now);
            }
        }
    }

    /// USER_MESSAGE: application-level payloads surface as events.
    fn handle_user_message(&self, cc: CallContext, _peer: &Arc<Peer>, packet: &Packet) {
        let mut r = Reader::new(packet.payload());
        let Some(type_id) = r.read_u64() else { return };
        let data = r.read_rest().to_vec();
        self.ctx.event(
            cc,
            &Event::UserMessage(UserMessage {
                origin: packet.source(),
                type_id,
                data,
            }),
        );
    }

    // === Outbound ===

    /// Entry point for an outbound Ethernet frame from the host tap.
    #[allow(clippy::too_many_arguments)]
    pub fn on_local_ethernet(
        &self,
        cc: CallContext,
        network: &Arc<Network>,
        source_mac: Mac,
        dest_mac: Mac,
        ether_type: u16,
        _vlan_id: u16,
        frame: &[u8],
        now: i64,
    ) {
        let nwid = network.network_id();
        let Some(config) = network.config_snapshot() else {
            self.ctx.trace.frame_dropped(nwid, "not configured");
            return;
        };
        if source_mac != network.mac() {
            self.ctx.trace.frame_dropped(nwid, "bridging not enabled");
            return;
        }
        {
            let mut qos = self.qos.lock_unpoisoned();
            let entry = qos.entry(nwid).or_default();
            entry.frames_out += 1;
            entry.bytes_out += frame.len() as u64;
        }

        if dest_mac.is_multicast() {
            if dest_mac.is_broadcast() && !config.broadcast_enabled {
                self.ctx.trace.frame_dropped(nwid, "broadcast disabled");
                return;
            }
            let group = MulticastGroup::new(dest_mac, 0);
            let members = self.multicaster.members(
                nwid,
                group,
                Some(self.ctx.address()),
                config.multicast_limit as usize,
                now,
            );
            let mut outbound = OutboundMulticast::new(
                nwid,
                group,
                ether_type,
                config.multicast_limit as usize,
                frame.to_vec(),
            );
            for member in members {
                match outbound.next_packet(self.ctx.address(), member) {
                    Some(packet) => {
                        self.send(cc, packet, true, now);
                    }
                    None => break,
                }
            }
            return;
        }

        let Some(dest) = dest_mac.to_address(nwid) else {
            self.ctx.trace.frame_dropped(nwid, "unresolvable destination mac");
            return;
        };
        if dest == self.ctx.address() {
            self.ctx.trace.frame_dropped(nwid, "frame addressed to self");
            return;
        }
        let mut packet = Packet::outgoing(dest, self.ctx.address(), Verb::Frame);
        packet.append_u64(nwid);
        packet.append_u16(ether_type);
        packet.append_bytes(frame);
        self.send(cc, packet, true, now);
    }

    /// Send a packet: direct path first, then upstream relay, else queue
    /// behind a WHOIS. Returns whether bytes left the node now.
    pub fn send(&self, cc: CallContext, mut packet: Packet, encrypt: bool, now: i64) -> bool {
        let dest = packet.dest();
        if dest == self.ctx.address() {
            return false;
        }
        packet.set_encrypted(encrypt);

        if let Some(peer) = self.topology.get_peer(dest) {
            if let Some(path) = peer.get_appropriate_path(now, false) {
                if path.send(&self.ctx, cc, packet.as_bytes(), now) {
                    peer.sent(now);
                    return true;
                }
            }
            return self.send_via_upstream(cc, &packet, now).unwrap_or(false);
        }

        self.tx_queue.lock_unpoisoned().push(TxQueueEntry {
            dest,
            packet,
            encrypt,
            since: now,
        });
        self.request_whois(cc, dest, now);
        false
    }

    /// Relay through the best upstream, if there is one that is not the
    /// destination itself. `None` means no upstream was available.
    fn send_via_upstream(&self, cc: CallContext, packet: &Packet, now: i64) -> Option<bool> {
        let upstream = self.topology.get_upstream_peer(now)?;
        if upstream.address() == packet.dest() {
            return None;
        }
        let path = upstream.get_appropriate_path(now, true)?;
        if path.send(&self.ctx, cc, packet.as_bytes(), now) {
            upstream.sent(now);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Forward a packet not addressed to us, if we are an upstream.
    fn try_relay(&self, cc: CallContext, mut packet: Packet, now: i64) {
        if !self.topology.am_upstream() {
            return;
        }
        let Some(peer) = self.topology.get_peer(packet.dest()) else {
            return;
        };
        let Some(path) = peer.get_appropriate_path(now, false) else {
            return;
        };
        if packet.increment_hops() {
            path.send(&self.ctx, cc, packet.as_bytes(), now);
        }
    }

    /// Issue a WHOIS for an address unless one is already outstanding.
    pub fn request_whois(&self, cc: CallContext, address: Address, now: i64) {
        if address == self.ctx.address() {
            return;
        }
        {
            let mut outstanding = self.whois_outstanding.lock_unpoisoned();
            if outstanding.contains_key(&address) {
                return;
            }
            outstanding.insert(
                address,
                WhoisRequest {
                    last_sent: now,
                    retries: 0,
                },
            );
        }
        self.ctx.trace.whois_requested(address);
        self.send_whois(cc, address, now);
    }

    fn send_whois(&self, cc: CallContext, address: Address, now: i64) {
        let Some(upstream) = self.topology.get_upstream_peer(now) else {
            return;
        };
        let Some(path) = upstream.get_appropriate_path(now, true) else {
            return;
        };
        let mut packet = Packet::outgoing(upstream.address(), self.ctx.address(), Verb::Whois);
        packet.append_address(address);
        self.ctx.replies.expect(packet.packet_id());
        if path.send(&self.ctx, cc, packet.as_bytes(), now) {
            upstream.sent(now);
        }
    }

    /// The identity of a network's controller, if we can know it: ourselves
    /// for networks we control, else whatever topology has learned.
    fn controller_identity_for(&self, nwid: u64) -> Option<Identity> {
        let controller = controller_address_of(nwid).ok()?;
        if controller == self.ctx.address() {
            return Some(self.ctx.identity.to_public());
        }
        self.topology
            .get_peer(controller)
            .map(|p| p.identity().clone())
    }

    /// A freshly learned identity: create the peer and flush anything
    /// queued behind its WHOIS.
    fn learn_identity(&self, cc: CallContext, identity: Identity, now: i64) {
        let address = identity.address();
        if self.topology.get_peer(address).is_none() {
            match Peer::new(&self.ctx.identity, identity, now) {
                Ok(peer) => {
                    self.topology.add_peer(Arc::new(peer));
                }
                Err(_) => return,
            }
        }
        self.whois_outstanding.lock_unpoisoned().remove(&address);

        let queued: Vec<TxQueueEntry> = {
            let mut queue = self.tx_queue.lock_unpoisoned();
            let (flush, keep): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|e| e.dest == address);
            *queue = keep;
            flush
        };
        for entry in queued {
            self.send(cc, entry.packet, entry.encrypt, now);
        }
    }

    /// Periodic switch work: WHOIS retries and queue expiry. Returns a
    /// hint for the engine's next deadline (ms from now).
    pub fn do_timer_tasks(&self, cc: CallContext, now: i64) -> i64 {
        let mut next_delay = DEFAULT_TIMER_HINT;

        let mut retry: Vec<Address> = Vec::new();
        let mut dead: Vec<Address> = Vec::new();
        {
            let mut outstanding = self.whois_outstanding.lock_unpoisoned();
            for (address, request) in outstanding.iter_mut() {
                if now - request.last_sent >= WHOIS_RETRY_DELAY {
                    if request.retries >= MAX_WHOIS_RETRIES {
                        dead.push(*address);
                    } else {
                        request.retries += 1;
                        request.last_sent = now;
                        retry.push(*address);
                    }
                }
            }
            for address in &dead {
                outstanding.remove(address);
            }
            if !outstanding.is_empty() {
                next_delay = next_delay.min(WHOIS_RETRY_DELAY);
            }
        }
        for address in retry {
            self.send_whois(cc, address, now);
        }
        {
            let mut queue = self.tx_queue.lock_unpoisoned();
            queue.retain(|e| now - e.since <= TX_QUEUE_TIMEOUT && !dead.contains(&e.dest));
        }

        next_delay
    }

    // === Path policy ===

    /// Whether overlay traffic may use this physical path.
    ///
    /// Deny wins and short-circuits: an invalid address, a prohibited
    /// endpoint, or a remote address inside any joined network's managed
    /// range is refused before the host's optional veto runs.
    pub fn should_use_path(
        &self,
        cc: CallContext,
        peer: Address,
        local_socket: LocalSocket,
        remote: &SocketAddr,
    ) -> bool {
        if !is_address_valid_for_path(remote) {
            return false;
        }
        if self.topology.is_prohibited_endpoint(peer, remote) {
            return false;
        }
        for network in self.networks.all() {
            if let Some(config) = network.config_snapshot() {
                if config.static_ips.iter().any(|r| r.contains(&remote.ip())) {
                    return false;
                }
            }
        }
        self.ctx.host.path_check(cc, peer, local_socket, remote)
    }

    #[cfg(test)]
    pub(crate) fn whois_outstanding_for_tests(&self) -> Vec<Address> {
        self.whois_outstanding
            .lock_unpoisoned()
            .keys()
            .copied()
            .collect()
    }

    /// Outbound accounting snapshot for a network.
    pub fn network_qos(&self, nwid: u64) -> Option<NetworkQos> {
        self.qos.lock_unpoisoned().get(&nwid).copied()
    }

    /// Tear down per-network accounting on leave.
    pub fn remove_network_qos_control_block(&self, nwid: u64) {
        self.qos.lock_unpoisoned().remove(&nwid);
    }
}
