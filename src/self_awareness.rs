//! External-surface awareness.
//!
//! Peers echo back the physical address they see us at. This cache
//! aggregates those observations, keyed by who reported, through which of
//! our sockets, and in which IP scope. When a trusted reporter disagrees
//! with what it told us before, our surface in that scope has genuinely
//! moved (new NAT mapping, new uplink) and paths in that scope must be
//! reset so they re-establish against the new surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::identity::Address;
use crate::inet::{ip_scope, IpScope, LocalSocket};
use crate::sync::MutexExt;

/// Observations older than this are discarded (ms).
pub const SURFACE_ENTRY_TIMEOUT: i64 = 600_000;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct SurfaceKey {
    reporter: Address,
    receiving_socket: LocalSocket,
    scope: IpScope,
}

#[derive(Clone, Debug)]
struct SurfaceEntry {
    surface: SocketAddr,
    timestamp: i64,
}

/// Cache of observations of our own external address.
#[derive(Debug, Default)]
pub struct SelfAwareness {
    surfaces: Mutex<HashMap<SurfaceKey, SurfaceEntry>>,
}

impl SelfAwareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `reporter` sees us as `reported_surface` on packets
    /// received through `receiving_socket`.
    ///
    /// Returns the scope whose surface changed when a trusted reporter
    /// contradicts its previous observation; the caller resets paths within
    /// that scope. Untrusted disagreement is ignored (address spoofing must
    /// not reset our world).
    pub fn iam(
        &self,
        reporter: Address,
        receiving_socket: LocalSocket,
        reported_surface: SocketAddr,
        trusted: bool,
        now: i64,
    ) -> Option<IpScope> {
        let scope = ip_scope(&reported_surface.ip());
        if scope == IpScope::None || scope == IpScope::Loopback || scope == IpScope::Multicast {
            return None;
        }
        let key = SurfaceKey {
            reporter,
            receiving_socket,
            scope,
        };
        let mut surfaces = self.surfaces.lock_unpoisoned();
        if let Some(entry) = surfaces.get_mut(&key) {
            return if entry.surface == reported_surface {
                entry.timestamp = now;
                None
            } else if trusted {
                entry.surface = reported_surface;
                entry.timestamp = now;
                Some(scope)
            } else {
                None
            };
        }
        surfaces.insert(
            key,
            SurfaceEntry {
                surface: reported_surface,
                timestamp: now,
            },
        );
        None
    }

    /// Drop stale observations.
    pub fn clean(&self, now: i64) {
        self.surfaces
            .lock_unpoisoned()
            .retain(|_, e| now - e.timestamp < SURFACE_ENTRY_TIMEOUT);
    }

    /// Current believed external addresses with observer counts,
    /// most-corroborated first.
    pub fn external_addresses(&self, now: i64) -> Vec<(SocketAddr, usize)> {
        let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
        for entry in self.surfaces.lock_unpoisoned().values() {
            if now - entry.timestamp < SURFACE_ENTRY_TIMEOUT {
                *counts.entry(entry.surface).or_insert(0) += 1;
            }
        }
        let mut out: Vec<(SocketAddr, usize)> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}
