//! Physical paths.
//!
//! A path is one way to reach a peer: a local socket handle paired with a
//! remote physical endpoint. Paths collect liveness timestamps and a
//! latency estimate; the selection policy in [`crate::peer`] picks among
//! them. Paths are shared (`Arc`) between the topology's canonical path map
//! and the peers using them, so timestamps use atomics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::context::Context;
use crate::host::CallContext;
use crate::inet::{ip_scope, IpScope, LocalSocket};

/// A path is alive iff it received a valid packet within this window (ms).
pub const PATH_ALIVE_TIMEOUT: i64 = 45_000;

/// Idle send interval after which a keepalive byte goes out (ms).
pub const PATH_KEEPALIVE_PERIOD: i64 = 20_000;

/// Latency value meaning "not yet measured".
const LATENCY_UNKNOWN: u32 = u32::MAX;

/// Check whether a physical endpoint may carry overlay traffic at all.
///
/// Loopback, multicast, unspecified, and otherwise unusable addresses are
/// rejected; link-local is allowed only for IPv6 (v4 link-local breaks NAT
/// traversal assumptions). Port zero is never valid.
pub fn is_address_valid_for_path(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match ip_scope(&addr.ip()) {
        IpScope::None | IpScope::Multicast | IpScope::Loopback => false,
        IpScope::LinkLocal => addr.is_ipv6(),
        IpScope::Private | IpScope::Shared | IpScope::Global => true,
    }
}

/// One physical route to a peer.
#[derive(Debug)]
pub struct Path {
    local_socket: LocalSocket,
    address: SocketAddr,
    last_in: AtomicI64,
    last_out: AtomicI64,
    latency: AtomicU32,
}

impl Path {
    /// Create a path. Timestamps start at zero (never used).
    pub fn new(local_socket: LocalSocket, address: SocketAddr) -> Self {
        Self {
            local_socket,
            address,
            last_in: AtomicI64::new(0),
            last_out: AtomicI64::new(0),
            latency: AtomicU32::new(LATENCY_UNKNOWN),
        }
    }

    /// Remote physical endpoint.
    pub fn address(&self) -> &SocketAddr {
        &self.address
    }

    /// Local socket handle.
    pub fn local_socket(&self) -> LocalSocket {
        self.local_socket
    }

    /// Scope of the remote endpoint.
    pub fn scope(&self) -> IpScope {
        ip_scope(&self.address.ip())
    }

    /// Last receive timestamp.
    pub fn last_in(&self) -> i64 {
        self.last_in.load(Ordering::Relaxed)
    }

    /// Last send timestamp.
    pub fn last_out(&self) -> i64 {
        self.last_out.load(Ordering::Relaxed)
    }

    /// Record an inbound packet.
    pub fn received(&self, now: i64) {
        self.last_in.store(now, Ordering::Relaxed);
    }

    /// Record an outbound packet.
    pub fn sent(&self, now: i64) {
        self.last_out.store(now, Ordering::Relaxed);
    }

    /// A path is alive iff it received a valid packet recently.
    pub fn alive(&self, now: i64) -> bool {
        let li = self.last_in();
        li > 0 && now - li < PATH_ALIVE_TIMEOUT
    }

    /// Whether the idle-send keepalive is due.
    pub fn needs_keepalive(&self, now: i64) -> bool {
        now - self.last_out() >= PATH_KEEPALIVE_PERIOD
    }

    /// Fold a new round-trip sample into the latency estimate.
    pub fn update_latency(&self, sample_ms: u32) {
        let prev = self.latency.load(Ordering::Relaxed);
        let next = if prev == LATENCY_UNKNOWN {
            sample_ms
        } else {
            // 3/4 old, 1/4 new
            (prev - (prev / 4)) + (sample_ms / 4)
        };
        self.latency.store(next, Ordering::Relaxed);
    }

    /// Estimated round-trip latency, if measured.
    pub fn latency_ms(&self) -> Option<u32> {
        match self.latency.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            v => Some(v),
        }
    }

    /// Relative desirability for path selection; lower is better.
    ///
    /// Unmeasured paths rank behind measured ones, dead paths behind alive
    /// ones, by large fixed penalties.
    pub fn quality(&self, now: i64) -> i64 {
        let latency = i64::from(self.latency_ms().unwrap_or(0xffff));
        let staleness = if self.alive(now) { 0 } else { 0x10_0000 };
        latency + staleness
    }

    /// Send bytes out this path and stamp the send time.
    pub(crate) fn send(&self, ctx: &Context, cc: CallContext, data: &[u8], now: i64) -> bool {
        if ctx.wire_send(cc, self.local_socket, &self.address, data) {
            self.sent(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(addr: &str) -> Path {
        Path::new(LocalSocket(1), addr.parse().unwrap())
    }

    #[test]
    fn test_address_validity() {
        let valid = |s: &str| is_address_valid_for_path(&s.parse().unwrap());
        assert!(valid("8.8.8.8:9993"));
        assert!(valid("10.0.0.1:9993"));
        assert!(valid("[2001:db8::1]:9993"));
        assert!(valid("[fe80::1]:9993"));
        assert!(!valid("169.254.1.1:9993"));
        assert!(!valid("127.0.0.1:9993"));
        assert!(!valid("224.0.0.1:9993"));
        assert!(!valid("0.0.0.0:9993"));
        assert!(!valid("8.8.8.8:0"));
    }

    #[test]
    fn test_liveness_window() {
        let p = path("1.2.3.4:9993");
        assert!(!p.alive(1000));
        p.received(1000);
        assert!(p.alive(1000 + PATH_ALIVE_TIMEOUT - 1));
        assert!(!p.alive(1000 + PATH_ALIVE_TIMEOUT));
    }

    #[test]
    fn test_latency_ewma() {
        let p = path("1.2.3.4:9993");
        assert_eq!(p.latency_ms(), None);
        p.update_latency(100);
        assert_eq!(p.latency_ms(), Some(100));
        p.update_latency(200);
        let l = p.latency_ms().unwrap();
        assert!(l > 100 && l < 200);
    }

    #[test]
    fn test_quality_ordering() {
        let now = 100_000;
        let alive = path("1.2.3.4:9993");
        alive.received(now - 1000);
        alive.update_latency(300);

        let dead = path("5.6.7.8:9993");
        dead.update_latency(5);

        assert!(alive.quality(now) < dead.quality(now));
    }

    #[test]
    fn test_keepalive_due() {
        let p = path("1.2.3.4:9993");
        p.sent(1000);
        assert!(!p.needs_keepalive(1000 + PATH_KEEPALIVE_PERIOD - 1));
        assert!(p.needs_keepalive(1000 + PATH_KEEPALIVE_PERIOD));
    }
}
