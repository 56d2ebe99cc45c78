//! Peer records.
//!
//! A peer is a remote node we have exchanged (or are trying to exchange)
//! packets with: its verified identity, an ordered set of candidate
//! physical paths, activity timestamps, and the remote software version
//! once a handshake has told us. Peers are shared between the topology map
//! and in-flight packet handling, so mutable state is internally locked.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::context::Context;
use crate::host::CallContext;
use crate::identity::{Address, Identity, IdentityError};
use crate::inet::LocalSocket;
use crate::packet::{Packet, Verb, PROTO_VERSION};
use crate::path::Path;
use crate::sync::MutexExt;

/// How often an active peer is re-HELLOed per path (ms).
pub const PEER_PING_PERIOD: i64 = 60_000;

/// A peer (or upstream) counts as active iff heard from within this window
/// (ms). Also the node-level offline threshold.
pub const PEER_ACTIVITY_TIMEOUT: i64 = 500_000;

/// Ceiling on candidate paths kept per peer.
pub const MAX_PEER_PATHS: usize = 16;

/// Remote software version announced in a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteVersion {
    /// Overlay protocol version.
    pub proto: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

impl fmt::Display for RemoteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Which address families a keepalive pass actually sent HELLO on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SentFamilies {
    pub v4: bool,
    pub v6: bool,
}

impl SentFamilies {
    /// Whether anything was sent at all.
    pub fn any(&self) -> bool {
        self.v4 || self.v6
    }

    fn mark(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(_) => self.v4 = true,
            SocketAddr::V6(_) => self.v6 = true,
        }
    }
}

/// A remote node with verified identity.
pub struct Peer {
    identity: Identity,
    address: Address,
    /// Key agreement output with our identity. This is the seam where the
    /// external packet-armor collaborator picks up; the engine itself never
    /// uses it.
    shared_key: Zeroizing<[u8; 32]>,
    created_at: i64,
    paths: Mutex<Vec<Arc<Path>>>,
    last_receive: AtomicI64,
    last_send: AtomicI64,
    version: Mutex<Option<RemoteVersion>>,
}

impl Peer {
    /// Create a peer record from a verified remote identity.
    ///
    /// Fails if the remote identity's address does not match its key
    /// material, or if our identity lacks its secret half.
    pub fn new(our_identity: &Identity, their_identity: Identity, now: i64) -> Result<Self, IdentityError> {
        if !their_identity.locally_validate() {
            return Err(IdentityError::AddressMismatch);
        }
        let shared_key = Zeroizing::new(our_identity.agree(&their_identity)?);
        let address = their_identity.address();
        Ok(Self {
            identity: their_identity.to_public(),
            address,
            shared_key,
            created_at: now,
            paths: Mutex::new(Vec::new()),
            last_receive: AtomicI64::new(0),
            last_send: AtomicI64::new(0),
            version: Mutex::new(None),
        })
    }

    /// The peer's verified identity (public halves only).
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The peer's overlay address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Key agreement output shared with this peer.
    pub fn shared_key(&self) -> &[u8; 32] {
        &self.shared_key
    }

    /// When this record was created (ms clock).
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last receive across all paths.
    pub fn last_receive(&self) -> i64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    /// Last send across all paths.
    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    /// A peer is active iff heard from within the activity window.
    pub fn is_active(&self, now: i64) -> bool {
        let lr = self.last_receive();
        lr > 0 && now - lr < PEER_ACTIVITY_TIMEOUT
    }

    /// Remote software version, if announced.
    pub fn remote_version(&self) -> Option<RemoteVersion> {
        *self.version.lock_unpoisoned()
    }

    /// Record the remote software version from a handshake.
    pub fn set_remote_version(&self, v: RemoteVersion) {
        *self.version.lock_unpoisoned() = Some(v);
    }

    /// Best measured latency across current paths.
    pub fn latency_ms(&self) -> Option<u32> {
        self.paths
            .lock_unpoisoned()
            .iter()
            .filter_map(|p| p.latency_ms())
            .min()
    }

    /// Snapshot of current paths.
    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.paths.lock_unpoisoned().clone()
    }

    /// Record an inbound packet arriving over a path.
    ///
    /// `learn` is decided by the caller (path admission policy); direct
    /// packets over admitted endpoints add the path to the candidate set.
    pub fn received(&self, path: &Arc<Path>, hops: u8, learn: bool, now: i64) {
        self.last_receive.store(now, Ordering::Relaxed);
        path.received(now);
        if learn && hops == 0 {
            self.learn_path(path, now);
        }
    }

    /// Record an outbound packet.
    pub fn sent(&self, now: i64) {
        self.last_send.store(now, Ordering::Relaxed);
    }

    /// Add a path to the candidate set if it is new.
    ///
    /// When the set is full, the worst non-alive path is replaced; a full
    /// set of alive paths rejects newcomers.
    pub fn learn_path(&self, path: &Arc<Path>, now: i64) {
        let mut paths = self.paths.lock_unpoisoned();
        if paths
            .iter()
            .any(|p| p.address() == path.address() && p.local_socket() == path.local_socket())
        {
            return;
        }
        if paths.len() < MAX_PEER_PATHS {
            paths.push(Arc::clone(path));
            return;
        }
        if let Some((worst_idx, worst)) = paths
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.quality(now))
            .map(|(i, p)| (i, Arc::clone(p)))
        {
            if !worst.alive(now) {
                paths[worst_idx] = Arc::clone(path);
            }
        }
    }

    /// Drop all paths whose remote endpoint falls in an IP scope.
    ///
    /// Called when our external surface in that scope moves; the old paths
    /// point at mappings that no longer exist.
    pub fn reset_paths_within_scope(&self, scope: crate::inet::IpScope, _now: i64) {
        self.paths
            .lock_unpoisoned()
            .retain(|p| p.scope() != scope);
    }

    /// Drop paths that have been silent for several liveness windows.
    pub fn prune_dead_paths(&self, now: i64) {
        self.paths.lock_unpoisoned().retain(|p| {
            let best = p.last_in().max(p.last_out());
            best > 0 && now - best < PEER_ACTIVITY_TIMEOUT
        });
    }

    /// Pick the path to use for traffic right now.
    ///
    /// Alive paths win on quality; with `include_expired`, the least-bad
    /// dead path is returned as a last resort.
    pub fn get_appropriate_path(&self, now: i64, include_expired: bool) -> Option<Arc<Path>> {
        let paths = self.paths.lock_unpoisoned();
        let best_alive = paths
            .iter()
            .filter(|p| p.alive(now))
            .min_by_key(|p| p.quality(now))
            .map(Arc::clone);
        if best_alive.is_some() {
            return best_alive;
        }
        if include_expired {
            return paths.iter().min_by_key(|p| p.quality(now)).map(Arc::clone);
        }
        None
    }

    /// Send a HELLO handshake/keepalive to an explicit endpoint.
    ///
    /// HELLO carries our protocol and software version, our public
    /// identity, a timestamp echoed back for latency measurement, and the
    /// destination address as we see it (external-surface feedback for the
    /// far side).
    pub(crate) fn send_hello(
        &self,
        ctx: &Context,
        cc: CallContext,
        local_socket: LocalSocket,
        at_address: &SocketAddr,
        now: i64,
    ) -> bool {
        let mut packet = Packet::outgoing(self.address, ctx.address(), Verb::Hello);
        packet.append_u8(PROTO_VERSION);
        packet.append_u8(crate::VERSION_MAJOR);
        packet.append_u8(crate::VERSION_MINOR);
        packet.append_u16(crate::VERSION_REVISION);
        packet.append_i64(now);
        packet.append_u16_prefixed(ctx.public_identity_str.as_bytes());
        packet.append_inet(Some(at_address));

        ctx.replies.expect(packet.packet_id());
        if ctx.wire_send(cc, local_socket, at_address, packet.as_bytes()) {
            self.sent(now);
            true
        } else {
            false
        }
    }

    /// Try to open a direct path by HELLOing an endpoint.
    pub(crate) fn attempt_to_contact_at(
        &self,
        ctx: &Context,
        cc: CallContext,
        local_socket: LocalSocket,
        at_address: &SocketAddr,
        now: i64,
    ) -> bool {
        self.send_hello(ctx, cc, local_socket, at_address, now)
    }

    /// Per-path ping/keepalive pass.
    ///
    /// Paths that have gone a full ping period without traffic get a HELLO;
    /// merely idle paths get a single-byte keepalive to hold NAT mappings
    /// open. Returns which address families a HELLO actually went out on.
    pub(crate) fn do_ping_and_keepalive(
        &self,
        ctx: &Context,
        cc: CallContext,
        now: i64,
    ) -> SentFamilies {
        let mut sent = SentFamilies::default();
        for path in self.paths() {
            let last_in = path.last_in();
            if last_in <= 0 || now - last_in >= PEER_ACTIVITY_TIMEOUT {
                continue;
            }
            if now - last_in >= PEER_PING_PERIOD || now - path.last_out() >= PEER_PING_PERIOD {
                if self.send_hello(ctx, cc, path.local_socket(), path.address(), now) {
                    sent.mark(path.address());
                }
            } else if path.needs_keepalive(now) {
                path.send(ctx, cc, &[0u8], now);
            }
        }
        sent
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("paths", &self.paths.lock_unpoisoned().len())
            .field("last_receive", &self.last_receive())
            .finish_non_exhaustive()
    }
}
