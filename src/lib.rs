//! VEON: Virtual Ethernet Overlay Node
//!
//! The embeddable core of a peer-to-peer virtual-network endpoint: a
//! single-threaded reentrant engine that joins cryptographically identified
//! overlay networks, exchanges Ethernet frames over an authenticated
//! UDP-style transport, and stays reachable through NAT traversal assisted
//! by upstream root servers.
//!
//! The engine performs no I/O of its own. The host supplies sockets, tap
//! devices, persistent storage, and a monotonic millisecond clock through
//! the [`host::NodeHost`] callback table, and drives the engine with
//! inbound datagrams, outbound tap frames, and periodic background ticks.

pub mod config;
pub mod controller;
pub mod dictionary;
pub mod host;
pub mod identity;
pub mod inet;
pub mod multicast;
pub mod network;
pub mod node;
pub mod packet;
pub mod path;
pub mod peer;
pub mod prng;
pub mod self_awareness;
pub mod switch;
pub mod topology;
pub mod trace;
pub mod world;

mod context;
mod sync;
#[cfg(test)]
pub(crate) mod test_support;

// Re-export identity types
pub use identity::{Address, Identity, IdentityError};

// Re-export host boundary types
pub use host::{
    CallContext, Event, NodeCallbacks, NodeHost, NodeStatus, PathSnapshot, PeerSnapshot,
    StateObjectKind, UserMessage, UserTag, VirtualNetworkConfig, VirtualNetworkConfigOperation,
    VirtualNetworkStatus, VirtualNetworkType, NODE_CALLBACK_VERSION,
};

// Re-export the engine
pub use node::{
    Node, NodeError, NodeResult, CORE_TIMER_GRANULARITY, HOUSEKEEPING_PERIOD, PING_CHECK_INTERVAL,
};

// Re-export configuration types
pub use config::{ConfigError, MoonConfig, NodeConfig};

// Re-export addressing types
pub use inet::{InetRange, IpScope, LocalSocket, Mac};

// Re-export overlay collaborator types
pub use controller::{ControllerErrorCode, ControllerSender, NetworkController};
pub use multicast::MulticastGroup;
pub use network::config::{CertificateOfMembership, NetworkConfig, Revocation};
pub use network::NETWORK_AUTOCONF_DELAY;
pub use peer::{RemoteVersion, SentFamilies, MAX_PEER_PATHS, PEER_ACTIVITY_TIMEOUT};
pub use topology::{PhysicalPathConfig, Role};
pub use world::{Root, World, WorldType};

/// Software version reported in handshakes.
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 3;
pub const VERSION_REVISION: u16 = 0;

/// The software version triple.
pub fn version() -> (u8, u8, u16) {
    (VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION)
}
