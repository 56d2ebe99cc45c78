//! Peer and root registry.
//!
//! Topology owns the set of known peers (keyed by overlay address), the
//! canonical physical path map, the planet and moon root sets, and the
//! host-supplied physical path rules (trust and blacklisting). It has its
//! own internal locking; callers never hold engine locks while calling in.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::host::{CallContext, StateObjectKind};
use crate::identity::Address;
use crate::inet::{InetRange, IpScope, LocalSocket};
use crate::path::Path;
use crate::peer::{Peer, PEER_ACTIVITY_TIMEOUT};
use crate::sync::MutexExt;
use crate::world::{World, WorldType};

/// A peer's role in the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// An ordinary node.
    Leaf,
    /// A root of a moon we orbit.
    Moon,
    /// A root of the planet.
    Planet,
}

/// Host-supplied configuration for a physical path range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalPathConfig {
    /// Nonzero marks packets on these endpoints as riding a trusted path.
    pub trusted_path_id: u64,
    /// False blacklists the range for overlay traffic entirely.
    pub enabled: bool,
}

#[derive(Debug)]
struct Worlds {
    planet: World,
    moons: Vec<World>,
    /// Moons we have been told to orbit but have no document for yet; the
    /// seed address is WHOISed until the world arrives.
    moon_seeds: Vec<(u64, Address)>,
}

/// Registry of peers, paths, worlds, and physical path rules.
pub struct Topology {
    ctx: Arc<Context>,
    peers: Mutex<HashMap<Address, Arc<Peer>>>,
    paths: Mutex<HashMap<(LocalSocket, SocketAddr), Arc<Path>>>,
    worlds: Mutex<Worlds>,
    /// Memoized root addresses across all worlds (excluding ourselves).
    upstream_addresses: Mutex<Vec<Address>>,
    am_upstream: AtomicBool,
    physical_paths: Mutex<Vec<(InetRange, PhysicalPathConfig)>>,
}

impl Topology {
    /// Create the registry, loading the persisted planet if one exists.
    pub(crate) fn new(ctx: Arc<Context>, cc: CallContext) -> Self {
        let planet = ctx
            .state_get(cc, StateObjectKind::Planet, 0)
            .and_then(|bytes| serde_json::from_slice::<World>(&bytes).ok())
            .filter(|w| w.world_type == WorldType::Planet && w.verify())
            .unwrap_or_else(World::fallback_planet);

        let topology = Self {
            ctx,
            peers: Mutex::new(HashMap::new()),
            paths: Mutex::new(HashMap::new()),
            worlds: Mutex::new(Worlds {
                planet,
                moons: Vec::new(),
                moon_seeds: Vec::new(),
            }),
            upstream_addresses: Mutex::new(Vec::new()),
            am_upstream: AtomicBool::new(false),
            physical_paths: Mutex::new(Vec::new()),
        };
        topology.memoize_upstreams();
        topology
    }

    fn memoize_upstreams(&self) {
        let ours = self.ctx.address();
        let worlds = self.worlds.lock_unpoisoned();
        let mut addresses = Vec::new();
        let mut root_identities = Vec::new();
        let mut am_upstream = false;
        for world in std::iter::once(&worlds.planet).chain(worlds.moons.iter()) {
            for root in &world.roots {
                let a = root.identity.address();
                if a == ours {
                    am_upstream = true;
                } else if !addresses.contains(&a) {
                    addresses.push(a);
                    root_identities.push(root.identity.clone());
                }
            }
        }
        for (_, seed) in &worlds.moon_seeds {
            if *seed != ours && !addresses.contains(seed) {
                addresses.push(*seed);
            }
        }
        drop(worlds);
        *self.upstream_addresses.lock_unpoisoned() = addresses;
        self.am_upstream.store(am_upstream, Ordering::Relaxed);

        // worlds carry full root identities, so root peers exist from the
        // moment a world is installed; the contact sweep can HELLO them at
        // their stable endpoints without a WHOIS bootstrap
        for identity in root_identities {
            let address = identity.address();
            let mut peers = self.peers.lock_unpoisoned();
            if !peers.contains_key(&address) {
                if let Ok(peer) = Peer::new(&self.ctx.identity, identity, 0) {
                    peers.insert(address, Arc::new(peer));
                }
            }
        }
    }

    // === Peers ===

    /// Look up a peer by address. Pure map lookup; never creates.
    pub fn get_peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.lock_unpoisoned().get(&address).cloned()
    }

    /// Insert a peer, returning the canonical record.
    ///
    /// A peer that already exists wins; identities are immutable per
    /// address, so the first verified record stays authoritative.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer> {
        let mut peers = self.peers.lock_unpoisoned();
        peers.entry(peer.address()).or_insert(peer).clone()
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock_unpoisoned().len()
    }

    /// Visit every peer. The map is snapshotted first; the visitor runs
    /// without topology locks held.
    pub fn each_peer(&self, mut f: impl FnMut(&Arc<Peer>)) {
        for peer in self.all_peers() {
            f(&peer);
        }
    }

    /// Snapshot of all peers.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock_unpoisoned().values().cloned().collect()
    }

    /// Get or create the canonical path object for an endpoint.
    pub fn get_path(&self, local_socket: LocalSocket, remote: &SocketAddr) -> Arc<Path> {
        self.paths
            .lock_unpoisoned()
            .entry((local_socket, *remote))
            .or_insert_with(|| Arc::new(Path::new(local_socket, *remote)))
            .clone()
    }

    // === Roles and upstreams ===

    /// A peer's role as defined by the current worlds.
    pub fn role(&self, address: Address) -> Role {
        let worlds = self.worlds.lock_unpoisoned();
        if worlds.planet.is_root(address) {
            Role::Planet
        } else if worlds.moons.iter().any(|m| m.is_root(address)) {
            Role::Moon
        } else {
            Role::Leaf
        }
    }

    /// Whether we ourselves are a root in any current world.
    pub fn am_upstream(&self) -> bool {
        self.am_upstream.load(Ordering::Relaxed)
    }

    /// Whether an address is one of our upstreams (or a pending moon seed).
    pub fn is_upstream(&self, address: Address) -> bool {
        self.upstream_addresses.lock_unpoisoned().contains(&address)
    }

    /// Memoized upstream addresses.
    pub fn upstream_addresses(&self) -> Vec<Address> {
        self.upstream_addresses.lock_unpoisoned().clone()
    }

    /// Collect every upstream we should keep contact with, mapped to its
    /// stable endpoints. Pending moon seeds appear with no endpoints, which
    /// forces a WHOIS through whatever upstreams we do have.
    pub fn get_upstreams_to_contact(&self, out: &mut HashMap<Address, Vec<SocketAddr>>) {
        let ours = self.ctx.address();
        let worlds = self.worlds.lock_unpoisoned();
        for world in std::iter::once(&worlds.planet).chain(worlds.moons.iter()) {
            for root in &world.roots {
                let a = root.identity.address();
                if a == ours {
                    continue;
                }
                let endpoints = out.entry(a).or_default();
                for ep in &root.stable_endpoints {
                    if !endpoints.contains(ep) {
                        endpoints.push(*ep);
                    }
                }
            }
        }
        for (_, seed) in &worlds.moon_seeds {
            if *seed != ours {
                out.entry(*seed).or_default();
            }
        }
    }

    /// The best upstream peer to relay through right now.
    pub fn get_upstream_peer(&self, now: i64) -> Option<Arc<Peer>> {
        let addresses = self.upstream_addresses();
        let mut best: Option<(i64, Arc<Peer>)> = None;
        for address in addresses {
            let Some(peer) = self.get_peer(address) else {
                continue;
            };
            let Some(path) = peer.get_appropriate_path(now, true) else {
                continue;
            };
            let quality = path.quality(now);
            if best.as_ref().map(|(q, _)| quality < *q).unwrap_or(true) {
                best = Some((quality, peer));
            }
        }
        best.map(|(_, p)| p)
    }

    // === Worlds ===

    /// The current planet.
    pub fn planet(&self) -> World {
        self.worlds.lock_unpoisoned().planet.clone()
    }

    /// All currently orbited moons.
    pub fn moons(&self) -> Vec<World> {
        self.worlds.lock_unpoisoned().moons.clone()
    }

    /// Begin orbiting a moon.
    ///
    /// If the moon's document is already persisted it is installed
    /// immediately; otherwise the seed address is remembered and WHOISed
    /// until a valid document arrives over the wire. Returns false when
    /// there is neither a document nor a seed to chase.
    pub fn add_moon(&self, cc: CallContext, world_id: u64, seed: Option<Address>) -> bool {
        if let Some(world) = self
            .ctx
            .state_get(cc, StateObjectKind::Moon, world_id)
            .and_then(|bytes| serde_json::from_slice::<World>(&bytes).ok())
            .filter(|w| w.id == world_id && w.world_type == WorldType::Moon && w.verify())
        {
            let mut worlds = self.worlds.lock_unpoisoned();
            worlds.moons.retain(|m| m.id != world_id);
            worlds.moons.push(world);
            drop(worlds);
            self.memoize_upstreams();
            return true;
        }
        match seed {
            Some(seed) => {
                let mut worlds = self.worlds.lock_unpoisoned();
                if !worlds.moon_seeds.iter().any(|(id, _)| *id == world_id) {
                    worlds.moon_seeds.push((world_id, seed));
                }
                drop(worlds);
                self.memoize_upstreams();
                true
            }
            None => false,
        }
    }

    /// Stop orbiting a moon and delete its persisted document.
    pub fn remove_moon(&self, cc: CallContext, world_id: u64) {
        let mut worlds = self.worlds.lock_unpoisoned();
        worlds.moons.retain(|m| m.id != world_id);
        worlds.moon_seeds.retain(|(id, _)| *id != world_id);
        drop(worlds);
        self.ctx.state_delete(cc, StateObjectKind::Moon, world_id);
        self.memoize_upstreams();
    }

    /// Offer a world document learned from the wire.
    ///
    /// Planets replace the current planet under the update rules. Moon
    /// documents replace an orbited moon under the same rules, or satisfy a
    /// pending seed if self-consistent. Returns true if anything changed.
    pub fn add_world(&self, cc: CallContext, world: World) -> bool {
        let mut worlds = self.worlds.lock_unpoisoned();
        let installed = match world.world_type {
            WorldType::Planet => {
                if worlds.planet.should_be_replaced_by(&world) {
                    worlds.planet = world.clone();
                    drop(worlds);
                    if let Ok(bytes) = serde_json::to_vec(&world) {
                        self.ctx.state_put(cc, StateObjectKind::Planet, 0, &bytes);
                    }
                    true
                } else {
                    false
                }
            }
            WorldType::Moon => {
                let has_existing = worlds.moons.iter().any(|m| m.id == world.id);
                let replaced = if has_existing {
                    match worlds.moons.iter_mut().find(|m| m.id == world.id) {
                        Some(existing) if existing.should_be_replaced_by(&world) => {
                            *existing = world.clone();
                            true
                        }
                        _ => false,
                    }
                } else if worlds.moon_seeds.iter().any(|(id, _)| *id == world.id)
                    && world.verify()
                {
                    worlds.moon_seeds.retain(|(id, _)| *id != world.id);
                    worlds.moons.push(world.clone());
                    true
                } else {
                    false
                };
                drop(worlds);
                if replaced {
                    if let Ok(bytes) = serde_json::to_vec(&world) {
                        self.ctx
                            .state_put(cc, StateObjectKind::Moon, world.id, &bytes);
                    }
                }
                replaced
            }
        };
        if installed {
            self.memoize_upstreams();
        }
        installed
    }

    // === Physical path rules ===

    /// Install, replace, or remove (`None`) the rule for a range.
    pub fn set_physical_path_configuration(
        &self,
        range: InetRange,
        config: Option<PhysicalPathConfig>,
    ) {
        let mut rules = self.physical_paths.lock_unpoisoned();
        rules.retain(|(r, _)| *r != range);
        if let Some(config) = config {
            rules.push((range, config));
        }
    }

    /// Whether a rule blacklists this endpoint for overlay traffic.
    pub fn is_prohibited_endpoint(&self, _peer: Address, remote: &SocketAddr) -> bool {
        self.physical_paths
            .lock_unpoisoned()
            .iter()
            .any(|(range, config)| !config.enabled && range.contains(&remote.ip()))
    }

    /// Trusted path ID covering an endpoint, or zero.
    pub fn get_outbound_path_trust(&self, remote: &SocketAddr) -> u64 {
        self.physical_paths
            .lock_unpoisoned()
            .iter()
            .find(|(range, config)| config.enabled && range.contains(&remote.ip()))
            .map(|(_, config)| config.trusted_path_id)
            .unwrap_or(0)
    }

    // === Maintenance ===

    /// Drop all peers' paths within an IP scope (our surface there moved).
    pub fn reset_within_scope(&self, scope: IpScope, now: i64) {
        self.each_peer(|peer| peer.reset_paths_within_scope(scope, now));
    }

    /// Periodic housekeeping: evict idle leaf peers, prune dead paths, and
    /// drop canonical path entries nothing references anymore.
    pub fn do_periodic_tasks(&self, _cc: CallContext, now: i64) {
        let upstreams = self.upstream_addresses();
        {
            let mut peers = self.peers.lock_unpoisoned();
            peers.retain(|address, peer| {
                if upstreams.contains(address) {
                    return true;
                }
                let last_used = peer.last_receive().max(peer.created_at());
                now - last_used < PEER_ACTIVITY_TIMEOUT
            });
        }
        self.each_peer(|peer| peer.prune_dead_paths(now));
        self.paths
            .lock_unpoisoned()
            .retain(|_, path| Arc::strong_count(path) > 1 || path.alive(now));
    }
}
