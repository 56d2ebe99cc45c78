//! Physical addressing helpers.
//!
//! The overlay rides on ordinary UDP-style sockets, so physical endpoints are
//! plain `SocketAddr` values. This module adds the pieces the engine needs on
//! top of them: IP scope classification (used by the external-surface cache
//! and by path admission), CIDR range matching (managed addresses and
//! physical-path rules), local socket handles, and virtual MAC addresses
//! derived from overlay addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::identity::Address;

/// Classification of an IP address by reachability scope.
///
/// Scope drives two decisions: whether an address may carry overlay traffic
/// at all, and which external-surface bucket an observation of our own
/// address falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpScope {
    /// Unusable (unspecified, reserved, documentation ranges).
    None,
    /// Multicast or broadcast.
    Multicast,
    /// Loopback.
    Loopback,
    /// Link-local (169.254/16, fe80::/10).
    LinkLocal,
    /// RFC 1918 / ULA private space.
    Private,
    /// Carrier-grade shared space (100.64/10).
    Shared,
    /// Globally routable.
    Global,
}

/// Classify an IP address into its reachability scope.
pub fn ip_scope(ip: &IpAddr) -> IpScope {
    match ip {
        IpAddr::V4(v4) => ipv4_scope(v4),
        IpAddr::V6(v6) => ipv6_scope(v6),
    }
}

fn ipv4_scope(ip: &Ipv4Addr) -> IpScope {
    let o = ip.octets();
    if ip.is_unspecified()
        || (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] >= 240 && !ip.is_broadcast())
    {
        IpScope::None
    } else if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_multicast() || ip.is_broadcast() {
        IpScope::Multicast
    } else if ip.is_link_local() {
        IpScope::LinkLocal
    } else if ip.is_private() {
        IpScope::Private
    } else if o[0] == 100 && (o[1] & 0xc0) == 64 {
        IpScope::Shared
    } else {
        IpScope::Global
    }
}

fn ipv6_scope(ip: &Ipv6Addr) -> IpScope {
    let s = ip.segments();
    if ip.is_unspecified() {
        IpScope::None
    } else if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if (s[0] & 0xffc0) == 0xfe80 {
        IpScope::LinkLocal
    } else if (s[0] & 0xfe00) == 0xfc00 {
        IpScope::Private
    } else {
        IpScope::Global
    }
}

/// A CIDR range over either address family.
///
/// Used for managed (static) network addresses and for physical-path rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InetRange {
    /// Network address.
    pub ip: IpAddr,
    /// Prefix length in bits.
    pub bits: u8,
}

impl InetRange {
    /// Create a range, clamping the prefix to the family's width.
    pub fn new(ip: IpAddr, bits: u8) -> Self {
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { ip, bits: bits.min(max) }
    }

    /// Check whether an address falls within this range.
    ///
    /// Cross-family comparisons are always false.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = if self.bits == 0 { 0 } else { u32::MAX << (32 - u32::from(self.bits)) };
                (u32::from(net) & mask) == (u32::from(*a) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = if self.bits == 0 { 0 } else { u128::MAX << (128 - u32::from(self.bits)) };
                (u128::from(net) & mask) == (u128::from(*a) & mask)
            }
            _ => false,
        }
    }
}

impl fmt::Display for InetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.bits)
    }
}

/// Handle identifying the host socket a datagram arrived on or should leave
/// through. Opaque to the engine; `ANY` lets the host pick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalSocket(pub i64);

impl LocalSocket {
    /// Sentinel meaning "any local socket the host sees fit".
    pub const ANY: LocalSocket = LocalSocket(-1);

    /// Check whether this handle names a specific socket.
    pub fn is_specified(&self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for LocalSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_specified() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "any")
        }
    }
}

/// A 48-bit virtual Ethernet MAC address.
///
/// Unicast MACs on an overlay network are a reversible function of the
/// member's overlay address and the network ID, so the switch can recover
/// the destination overlay address from a frame's destination MAC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mac(u64);

impl Mac {
    /// Broadcast MAC (ff:ff:ff:ff:ff:ff).
    pub const BROADCAST: Mac = Mac(0xffff_ffff_ffff);

    /// Wrap a raw 48-bit value (upper 16 bits are discarded).
    pub fn from_u64(v: u64) -> Self {
        Mac(v & 0xffff_ffff_ffff)
    }

    /// Raw 48-bit value.
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// First octet for a member MAC on the given network.
    ///
    /// Always locally administered and unicast; 0x52 is remapped because it
    /// collides with a common virtualization prefix.
    fn first_octet_for_network(nwid: u64) -> u8 {
        let o = ((nwid & 0xfe) | 0x02) as u8;
        if o == 0x52 {
            0x32
        } else {
            o
        }
    }

    /// Derive the member MAC for an overlay address on a network.
    pub fn from_address(addr: Address, nwid: u64) -> Self {
        let mut m = u64::from(Self::first_octet_for_network(nwid)) << 40;
        m |= addr.to_u64();
        m ^= ((nwid >> 8) & 0xff) << 32;
        m ^= ((nwid >> 16) & 0xff) << 24;
        m ^= ((nwid >> 24) & 0xff) << 16;
        m ^= ((nwid >> 32) & 0xff) << 8;
        m ^= (nwid >> 40) & 0xff;
        Mac(m & 0xffff_ffff_ffff)
    }

    /// Recover the overlay address this MAC encodes on a network.
    ///
    /// Returns `None` for group-addressed MACs.
    pub fn to_address(self, nwid: u64) -> Option<Address> {
        if self.is_multicast() {
            return None;
        }
        let mut a = self.0 & 0xff_ffff_ffff;
        a ^= ((nwid >> 8) & 0xff) << 32;
        a ^= ((nwid >> 16) & 0xff) << 24;
        a ^= ((nwid >> 24) & 0xff) << 16;
        a ^= ((nwid >> 32) & 0xff) << 8;
        a ^= (nwid >> 40) & 0xff;
        Address::from_u64(a).ok()
    }

    /// Check the group (multicast/broadcast) bit.
    pub fn is_multicast(&self) -> bool {
        (self.0 & 0x0100_0000_0000) != 0
    }

    /// Check for the all-ones broadcast MAC.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self)
    }
}

/// Append a socket address to a wire buffer.
///
/// Encoding: family byte (0 = absent, 4 = IPv4, 6 = IPv6), address bytes,
/// big-endian port.
pub(crate) fn write_inet(buf: &mut Vec<u8>, addr: Option<&SocketAddr>) {
    match addr {
        None => buf.push(0),
        Some(SocketAddr::V4(a)) => {
            buf.push(4);
            buf.extend_from_slice(&a.ip().octets());
            buf.extend_from_slice(&a.port().to_be_bytes());
        }
        Some(SocketAddr::V6(a)) => {
            buf.push(6);
            buf.extend_from_slice(&a.ip().octets());
            buf.extend_from_slice(&a.port().to_be_bytes());
        }
    }
}

/// Read a socket address previously written by [`write_inet`].
///
/// Returns `(value, bytes consumed)`, or `None` on truncation or an unknown
/// family byte.
pub(crate) fn read_inet(data: &[u8]) -> Option<(Option<SocketAddr>, usize)> {
    match *data.first()? {
        0 => Some((None, 1)),
        4 => {
            if data.len() < 7 {
                return None;
            }
            let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
            let port = u16::from_be_bytes([data[5], data[6]]);
            Some((Some(SocketAddr::new(IpAddr::V4(ip), port)), 7))
        }
        6 => {
            if data.len() < 19 {
                return None;
            }
            let mut o = [0u8; 16];
            o.copy_from_slice(&data[1..17]);
            let port = u16::from_be_bytes([data[17], data[18]]);
            Some((Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(o)), port)), 19))
        }
        _ => None,
    }
}
