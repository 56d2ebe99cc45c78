//! Host boundary.
//!
//! The engine performs no I/O and keeps no files: everything it needs from
//! the outside world goes through the [`NodeHost`] callback table. The host
//! owns the sockets, the tap devices, and the persistent store; the engine
//! calls out for wire sends, frame delivery, port lifecycle, state objects,
//! and event notification.
//!
//! Callbacks must not block: wire sends are best-effort datagram semantics,
//! and every callback runs on whichever host thread entered the engine.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::identity::Address;
use crate::inet::{InetRange, LocalSocket, Mac};
use crate::multicast::MulticastGroup;
use crate::peer::RemoteVersion;
use crate::topology::Role;

/// Fixed version of the callback table. Construction fails with
/// `InvalidArgument` for any other value.
pub const NODE_CALLBACK_VERSION: u32 = 0;

/// Opaque per-call context, forwarded verbatim to every host callback.
///
/// Hosts typically use it to route callbacks back to the thread or request
/// that entered the engine. The engine never interprets it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CallContext(pub u64);

/// Opaque per-network tag supplied at join and handed back on every port
/// callback and at leave. The engine never interprets it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserTag(pub u64);

/// Kinds of persisted state objects.
///
/// Each object is addressed by `(kind, scope)`; the scope is the overlay
/// address for identity objects, the network ID for network configs, and
/// the world ID for moons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateObjectKind {
    /// Our secret identity, canonical string form. Scope 0.
    IdentitySecret,
    /// Our public identity, canonical string form. Scope = address.
    IdentityPublic,
    /// The primary root set. Scope 0.
    Planet,
    /// An additional root set. Scope = world ID.
    Moon,
    /// A network configuration dictionary. Scope = network ID.
    NetworkConfig,
}

/// A user-defined message delivered over the overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserMessage {
    /// Sending node.
    pub origin: Address,
    /// Application-defined type tag.
    pub type_id: u64,
    /// Message payload.
    pub data: Vec<u8>,
}

/// Engine state-change events, posted synchronously through the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The engine constructed successfully and is ready for calls.
    Up,
    /// No upstream has been heard from within the activity timeout.
    Offline,
    /// At least one upstream is reachable (or we are one).
    Online,
    /// A user-defined message arrived.
    UserMessage(UserMessage),
}

/// Port lifecycle operations passed to the virtual-network-config callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualNetworkConfigOperation {
    /// The network was joined; bring the port up.
    Up,
    /// The network's configuration changed.
    ConfigUpdate,
    /// The port should stop passing traffic but may come back.
    Down,
    /// The network was left; tear the port down for good.
    Destroy,
}

/// Membership state of a joined network, as visible to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualNetworkStatus {
    /// Waiting for the controller to answer a configuration request.
    RequestingConfiguration,
    /// Configured and authorized.
    Ok,
    /// The controller denied membership.
    AccessDenied,
    /// The controller does not know this network.
    NotFound,
}

/// Access model of a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtualNetworkType {
    /// Certificate-gated membership.
    Private,
    /// Anyone may participate.
    Public,
}

/// External snapshot of one joined network, handed to the host on port
/// callbacks and from status queries.
#[derive(Clone, Debug)]
pub struct VirtualNetworkConfig {
    /// 64-bit network ID.
    pub nwid: u64,
    /// Our MAC on this network.
    pub mac: Mac,
    /// Network short name, empty until configured.
    pub name: String,
    /// Membership state.
    pub status: VirtualNetworkStatus,
    /// Access model.
    pub net_type: VirtualNetworkType,
    /// Network MTU.
    pub mtu: u32,
    /// Whether Ethernet broadcast is enabled.
    pub broadcast_enabled: bool,
    /// Config revision counter from the controller.
    pub netconf_revision: u64,
    /// Managed addresses assigned to this node.
    pub assigned_addresses: Vec<InetRange>,
    /// Current multicast subscriptions.
    pub multicast_subscriptions: Vec<MulticastGroup>,
}

/// Snapshot of the node's own status.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    /// Our overlay address.
    pub address: Address,
    /// Public identity string.
    pub public_identity: String,
    /// Secret identity string.
    pub secret_identity: String,
    /// Whether an upstream was heard from recently.
    pub online: bool,
}

/// One physical path in a peer snapshot.
#[derive(Clone, Debug)]
pub struct PathSnapshot {
    /// Remote physical endpoint.
    pub address: SocketAddr,
    /// Local socket the path is bound through.
    pub local_socket: LocalSocket,
    /// Last send on this path (ms clock).
    pub last_send: i64,
    /// Last receive on this path (ms clock).
    pub last_receive: i64,
    /// Nonzero if the endpoint falls in a trusted physical path.
    pub trusted_path_id: u64,
    /// Whether the path has gone silent past the liveness window.
    pub expired: bool,
    /// Whether path selection currently prefers this path.
    pub preferred: bool,
}

/// One peer in a peers query.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    /// Peer overlay address.
    pub address: Address,
    /// Remote software version, if the peer announced one.
    pub version: Option<RemoteVersion>,
    /// Measured round-trip latency in milliseconds.
    pub latency_ms: Option<u32>,
    /// Topology role.
    pub role: Role,
    /// Known physical paths.
    pub paths: Vec<PathSnapshot>,
}

/// The host callback table contract.
///
/// All methods may be called concurrently from any thread that enters the
/// engine. Implementations must not call back into the engine.
pub trait NodeHost: Send + Sync {
    /// Fetch a persisted state object, or `None` if absent.
    fn state_object_get(&self, cc: CallContext, kind: StateObjectKind, scope: u64)
        -> Option<Vec<u8>>;

    /// Persist a state object. Returns false if the store failed.
    fn state_object_put(&self, cc: CallContext, kind: StateObjectKind, scope: u64, data: &[u8])
        -> bool;

    /// Delete a persisted state object.
    fn state_object_delete(&self, cc: CallContext, kind: StateObjectKind, scope: u64);

    /// Send a datagram. Must not block; returns false on immediate failure.
    fn wire_packet_send(
        &self,
        cc: CallContext,
        local_socket: LocalSocket,
        remote: &SocketAddr,
        data: &[u8],
    ) -> bool;

    /// Deliver a decrypted Ethernet frame to the network's tap port.
    #[allow(clippy::too_many_arguments)]
    fn virtual_network_frame(
        &self,
        cc: CallContext,
        nwid: u64,
        user: UserTag,
        source_mac: Mac,
        dest_mac: Mac,
        ether_type: u16,
        vlan_id: u16,
        frame: &[u8],
    );

    /// Apply a port lifecycle operation for a joined network.
    fn virtual_network_config(
        &self,
        cc: CallContext,
        nwid: u64,
        user: UserTag,
        op: VirtualNetworkConfigOperation,
        config: &VirtualNetworkConfig,
    );

    /// Optional veto over candidate physical paths. The default allows
    /// everything; engine-side checks run first and deny wins.
    fn path_check(
        &self,
        cc: CallContext,
        peer: Address,
        local_socket: LocalSocket,
        remote: &SocketAddr,
    ) -> bool {
        let _ = (cc, peer, local_socket, remote);
        true
    }

    /// Receive an engine event.
    fn event(&self, cc: CallContext, event: &Event);
}

/// The versioned callback table handed to the engine at construction.
#[derive(Clone)]
pub struct NodeCallbacks {
    /// Must equal [`NODE_CALLBACK_VERSION`].
    pub version: u32,
    /// The host implementation.
    pub host: Arc<dyn NodeHost>,
}

impl NodeCallbacks {
    /// Build a table at the current version.
    pub fn new(host: Arc<dyn NodeHost>) -> Self {
        Self {
            version: NODE_CALLBACK_VERSION,
            host,
        }
    }
}

impl fmt::Debug for NodeCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCallbacks")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
