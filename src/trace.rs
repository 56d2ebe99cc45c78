//! Diagnostics sink.
//!
//! All engine diagnostics flow through here onto the `tracing` crate, so
//! hosts pick verbosity with an ordinary subscriber. Per-network trace
//! levels come from network configs and are memoized on a slow cadence so
//! the hot paths never walk the networks map just to decide whether to log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::identity::Address;
use crate::network::NetworkRegistry;
use crate::packet::Verb;
use crate::sync::RwLockExt;

/// Memoized per-network diagnostics settings.
#[derive(Clone, Debug, Default)]
struct TraceSettings {
    /// Networks whose config requests verbose tracing, by trace level.
    network_levels: HashMap<u64, u8>,
}

/// Diagnostics sink with memoized per-network settings.
#[derive(Debug, Default)]
pub struct Trace {
    settings: RwLock<TraceSettings>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read trace levels from all current network configs.
    pub fn update_memoized_settings(&self, networks: &NetworkRegistry) {
        let mut levels = HashMap::new();
        for network in networks.all() {
            if let Some(config) = network.config_snapshot() {
                if config.trace_level > 0 {
                    levels.insert(config.network_id, config.trace_level);
                }
            }
        }
        self.settings.write_unpoisoned().network_levels = levels;
    }

    /// Whether a network asked for verbose tracing.
    pub fn verbose(&self, nwid: u64) -> bool {
        self.settings
            .read_unpoisoned()
            .network_levels
            .get(&nwid)
            .copied()
            .unwrap_or(0)
            > 0
    }

    pub fn packet_dropped(&self, from: &SocketAddr, reason: &str) {
        debug!(%from, reason, "dropping wire packet");
    }

    pub fn verb_dropped(&self, source: Address, verb: Verb, reason: &str) {
        debug!(%source, %verb, reason, "dropping packet");
    }

    pub fn frame_dropped(&self, nwid: u64, reason: &str) {
        let nwid_hex = format!("{:016x}", nwid);
        if self.verbose(nwid) {
            debug!(nwid = %nwid_hex, reason, "dropping frame");
        } else {
            trace!(nwid = %nwid_hex, reason, "dropping frame");
        }
    }

    pub fn learned_path(&self, peer: Address, endpoint: &SocketAddr) {
        debug!(%peer, %endpoint, "learned new path");
    }

    pub fn online_state(&self, online: bool) {
        debug!(online, "online state changed");
    }

    pub fn whois_requested(&self, address: Address) {
        trace!(%address, "requesting identity lookup");
    }

    pub fn network_config_requested(&self, nwid: u64) {
        let nwid_hex = format!("{:016x}", nwid);
        debug!(nwid = %nwid_hex, "requesting network config");
    }

    pub fn external_surface_changed(&self, reporter: Address, surface: &SocketAddr) {
        debug!(%reporter, %surface, "external address surface changed");
    }
}
