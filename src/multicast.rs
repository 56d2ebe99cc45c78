//! Multicast group cache and outbound replication.
//!
//! Overlay multicast is gossip-fed: members announce their subscriptions
//! with LIKE packets, the cache remembers who liked which (network, group)
//! recently, and outbound multicast frames replicate point-to-point to the
//! cached members up to the network's multicast limit. GATHER queries let a
//! member with a cold cache ask a better-connected node for members.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::identity::Address;
use crate::inet::Mac;
use crate::packet::{Packet, Verb};
use crate::sync::MutexExt;

/// Subscriptions not re-announced within this window are dropped (ms).
pub const MULTICAST_LIKE_EXPIRE: i64 = 600_000;

/// A multicast group: a 48-bit MAC plus a 32-bit additional distinguishing
/// identifier (nonzero for things like per-address broadcast scoping).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

impl MulticastGroup {
    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The Ethernet broadcast group.
    pub fn broadcast() -> Self {
        Self {
            mac: Mac::BROADCAST,
            adi: 0,
        }
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac, self.adi)
    }
}

impl fmt::Debug for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MulticastGroup({})", self)
    }
}

#[derive(Clone, Debug)]
struct GroupMember {
    address: Address,
    last_like: i64,
}

/// Cache of recently announced group memberships across all networks.
#[derive(Debug, Default)]
pub struct Multicaster {
    groups: Mutex<HashMap<(u64, MulticastGroup), Vec<GroupMember>>>,
}

impl Multicaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a LIKE: `member` subscribes to `group` on `nwid`.
    pub fn add(&self, nwid: u64, group: MulticastGroup, member: Address, now: i64) {
        let mut groups = self.groups.lock_unpoisoned();
        let members = groups.entry((nwid, group)).or_default();
        if let Some(m) = members.iter_mut().find(|m| m.address == member) {
            m.last_like = now;
            return;
        }
        members.push(GroupMember {
            address: member,
            last_like: now,
        });
    }

    /// Fresh members of a group, excluding `skip`, at most `limit`.
    pub fn members(
        &self,
        nwid: u64,
        group: MulticastGroup,
        skip: Option<Address>,
        limit: usize,
        now: i64,
    ) -> Vec<Address> {
        let groups = self.groups.lock_unpoisoned();
        let Some(members) = groups.get(&(nwid, group)) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|m| now - m.last_like < MULTICAST_LIKE_EXPIRE)
            .map(|m| m.address)
            .filter(|a| Some(*a) != skip)
            .take(limit)
            .collect()
    }

    /// Total fresh member count for a group (for GATHER responses).
    pub fn member_count(&self, nwid: u64, group: MulticastGroup, now: i64) -> usize {
        let groups = self.groups.lock_unpoisoned();
        groups
            .get(&(nwid, group))
            .map(|members| {
                members
                    .iter()
                    .filter(|m| now - m.last_like < MULTICAST_LIKE_EXPIRE)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop expired subscriptions and empty groups.
    pub fn clean(&self, now: i64) {
        let mut groups = self.groups.lock_unpoisoned();
        for members in groups.values_mut() {
            members.retain(|m| now - m.last_like < MULTICAST_LIKE_EXPIRE);
        }
        groups.retain(|_, members| !members.is_empty());
    }
}

/// One outbound multicast in flight: the frame plus a replication budget.
///
/// The switch walks cached members and pulls one point-to-point packet per
/// destination until the budget is spent.
#[derive(Debug)]
pub struct OutboundMulticast {
    nwid: u64,
    group: MulticastGroup,
    ether_type: u16,
    frame: Vec<u8>,
    limit: usize,
    sent: usize,
}

impl OutboundMulticast {
    pub fn new(
        nwid: u64,
        group: MulticastGroup,
        ether_type: u16,
        limit: usize,
        frame: Vec<u8>,
    ) -> Self {
        Self {
            nwid,
            group,
            ether_type,
            frame,
            limit,
            sent: 0,
        }
    }

    /// How many destinations have been produced so far.
    pub fn sent_count(&self) -> usize {
        self.sent
    }

    /// Produce the packet for one more destination, or `None` once the
    /// replication budget is spent.
    pub fn next_packet(&mut self, source: Address, dest: Address) -> Option<Packet> {
        if self.sent >= self.limit {
            return None;
        }
        self.sent += 1;
        let mut packet = Packet::outgoing(dest, source, Verb::MulticastFrame);
        packet.append_u64(self.nwid);
        packet.append_mac(self.group.mac);
        packet.append_u32(self.group.adi);
        packet.append_u16(self.ether_type);
        packet.append_bytes(&self.frame);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u64) -> Address {
        Address::from_u64(v).unwrap()
    }

    fn group() -> MulticastGroup {
        MulticastGroup::new(Mac::from_u64(0x0133_0000_0001), 0)
    }

    #[test]
    fn test_add_and_expire() {
        let mc = Multicaster::new();
        mc.add(1, group(), addr(10), 1000);
        mc.add(1, group(), addr(11), 2000);
        assert_eq!(mc.member_count(1, group(), 2000), 2);

        // re-like refreshes; the other member ages out
        mc.add(1, group(), addr(10), 500_000);
        let later = 2000 + MULTICAST_LIKE_EXPIRE + 1;
        assert_eq!(mc.members(1, group(), None, 10, later), vec![addr(10)]);

        mc.clean(500_000 + MULTICAST_LIKE_EXPIRE + 1);
        assert_eq!(mc.member_count(1, group(), 500_000 + MULTICAST_LIKE_EXPIRE + 1), 0);
    }

    #[test]
    fn test_members_skip_and_limit() {
        let mc = Multicaster::new();
        for i in 1..=5 {
            mc.add(1, group(), addr(i), 1000);
        }
        let m = mc.members(1, group(), Some(addr(3)), 3, 1000);
        assert_eq!(m.len(), 3);
        assert!(!m.contains(&addr(3)));
    }

    #[test]
    fn test_groups_scoped_by_network() {
        let mc = Multicaster::new();
        mc.add(1, group(), addr(10), 1000);
        assert_eq!(mc.member_count(2, group(), 1000), 0);
    }

    #[test]
    fn test_outbound_respects_limit() {
        let mut om = OutboundMulticast::new(1, group(), 0x0800, 2, vec![0xaa; 64]);
        assert!(om.next_packet(addr(1), addr(2)).is_some());
        assert!(om.next_packet(addr(1), addr(3)).is_some());
        assert!(om.next_packet(addr(1), addr(4)).is_none());
        assert_eq!(om.sent_count(), 2);
    }

    #[test]
    fn test_outbound_packet_shape() {
        let mut om = OutboundMulticast::new(0xabcd, group(), 0x86dd, 8, vec![1, 2, 3]);
        let p = om.next_packet(addr(1), addr(2)).unwrap();
        assert_eq!(p.verb(), Verb::MulticastFrame);
        let mut r = crate::packet::Reader::new(p.payload());
        assert_eq!(r.read_u64(), Some(0xabcd));
        assert_eq!(r.read_mac(), Some(group().mac));
        assert_eq!(r.read_u32(), Some(0));
        assert_eq!(r.read_u16(), Some(0x86dd));
        assert_eq!(r.read_rest(), &[1, 2, 3]);
    }
}
