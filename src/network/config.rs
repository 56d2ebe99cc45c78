//! Network configuration and membership credentials.
//!
//! A network's controller issues each member a signed configuration: the
//! network's parameters, the member's managed addresses, and a certificate
//! of membership the member shows to other members. Configurations travel
//! as a [`Dictionary`] so controllers can add fields without breaking old
//! members.

use std::fmt;

use thiserror::Error;

use crate::dictionary::{Dictionary, DictionaryError};
use crate::host::VirtualNetworkType;
use crate::identity::{Address, Identity, IdentityError};
use crate::inet::InetRange;
use crate::packet::Reader;

/// How long a configuration stays fresh before the member re-requests (ms).
pub const NETWORK_AUTOCONF_DELAY: i64 = 60_000;

/// Default network MTU.
pub const DEFAULT_MTU: u32 = 2800;

/// Default outbound multicast replication budget.
pub const DEFAULT_MULTICAST_LIMIT: u32 = 32;

/// Specialist flag: member should always be kept in contact (an anchor).
pub const SPECIALIST_ANCHOR: u64 = 1 << 0;

/// Errors from configuration decoding and credential handling.
#[derive(Debug, Error)]
pub enum NetworkConfigError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("bad field: {0}")]
    BadField(&'static str),

    #[error(transparent)]
    Dictionary(#[from] DictionaryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// A certificate of membership: the controller's signed statement that an
/// address belonged to a network at a point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateOfMembership {
    pub network_id: u64,
    pub timestamp: i64,
    pub issued_to: Address,
    pub signature: Vec<u8>,
}

impl CertificateOfMembership {
    /// Issue and sign a certificate.
    pub fn new_signed(
        controller: &Identity,
        network_id: u64,
        timestamp: i64,
        issued_to: Address,
    ) -> Result<Self, IdentityError> {
        let mut com = Self {
            network_id,
            timestamp,
            issued_to,
            signature: Vec::new(),
        };
        com.signature = controller.sign(&com.signing_payload())?.to_vec();
        Ok(com)
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21);
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.issued_to.to_bytes());
        out
    }

    /// Verify against the controller's identity.
    pub fn verify(&self, controller: &Identity) -> bool {
        controller.verify(&self.signing_payload(), &self.signature)
    }

    /// Append the wire form.
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.issued_to.to_bytes());
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
    }

    /// Read the wire form.
    pub fn unmarshal(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            network_id: r.read_u64()?,
            timestamp: r.read_i64()?,
            issued_to: r.read_address()?,
            signature: r.read_u16_prefixed()?.to_vec(),
        })
    }
}

/// A credential revocation: invalidates a member's credentials issued
/// before a threshold time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revocation {
    /// Unique revocation ID.
    pub id: u64,
    pub network_id: u64,
    /// Whose credentials are revoked.
    pub target: Address,
    /// Credentials with timestamps before this are dead.
    pub threshold: i64,
    pub signature: Vec<u8>,
}

impl Revocation {
    /// Issue and sign a revocation.
    pub fn new_signed(
        controller: &Identity,
        id: u64,
        network_id: u64,
        target: Address,
        threshold: i64,
    ) -> Result<Self, IdentityError> {
        let mut rev = Self {
            id,
            network_id,
            target,
            threshold,
            signature: Vec::new(),
        };
        rev.signature = controller.sign(&rev.signing_payload())?.to_vec();
        Ok(rev)
    }

    fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(29);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.target.to_bytes());
        out.extend_from_slice(&self.threshold.to_be_bytes());
        out
    }

    /// Verify against the controller's identity.
    pub fn verify(&self, controller: &Identity) -> bool {
        controller.verify(&self.signing_payload(), &self.signature)
    }

    /// Append the wire form.
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(&self.target.to_bytes());
        out.extend_from_slice(&self.threshold.to_be_bytes());
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
    }

    /// Read the wire form.
    pub fn unmarshal(r: &mut Reader<'_>) -> Option<Self> {
        Some(Self {
            id: r.read_u64()?,
            network_id: r.read_u64()?,
            target: r.read_address()?,
            threshold: r.read_i64()?,
            signature: r.read_u16_prefixed()?.to_vec(),
        })
    }
}

/// A special member: an address with role flags (currently just anchor).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Specialist {
    pub address: Address,
    pub flags: u64,
}

impl Specialist {
    pub fn is_anchor(&self) -> bool {
        (self.flags & SPECIALIST_ANCHOR) != 0
    }
}

/// A network configuration as issued by the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkConfig {
    pub network_id: u64,
    /// Issuance time; also the freshness anchor for credentials.
    pub timestamp: i64,
    /// Maximum credential timestamp skew tolerated between members (ms).
    pub credential_time_max_delta: i64,
    /// Controller-side revision counter.
    pub revision: u64,
    /// The member this config was issued to.
    pub issued_to: Address,
    pub name: String,
    pub net_type: VirtualNetworkType,
    pub mtu: u32,
    /// Outbound multicast replication budget.
    pub multicast_limit: u32,
    pub broadcast_enabled: bool,
    /// Per-network diagnostics verbosity (0 = normal).
    pub trace_level: u8,
    pub specialists: Vec<Specialist>,
    /// Managed addresses assigned to this member.
    pub static_ips: Vec<InetRange>,
    /// Our certificate of membership (private networks).
    pub com: Option<CertificateOfMembership>,
}

impl NetworkConfig {
    /// A minimal public-network configuration.
    pub fn new(network_id: u64, issued_to: Address) -> Self {
        Self {
            network_id,
            timestamp: 0,
            credential_time_max_delta: NETWORK_AUTOCONF_DELAY * 2,
            revision: 0,
            issued_to,
            name: String::new(),
            net_type: VirtualNetworkType::Public,
            mtu: DEFAULT_MTU,
            multicast_limit: DEFAULT_MULTICAST_LIMIT,
            broadcast_enabled: true,
            trace_level: 0,
            specialists: Vec::new(),
            static_ips: Vec::new(),
            com: None,
        }
    }

    pub fn is_public(&self) -> bool {
        self.net_type == VirtualNetworkType::Public
    }

    /// Addresses of all anchor specialists.
    pub fn anchors(&self) -> impl Iterator<Item = Address> + '_ {
        self.specialists
            .iter()
            .filter(|s| s.is_anchor())
            .map(|s| s.address)
    }

    /// The controller's address, encoded in the top 40 bits of the network
    /// ID.
    pub fn controller_address(&self) -> Result<Address, IdentityError> {
        controller_address_of(self.network_id)
    }

    /// Serialize to the controller wire dictionary.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut d = Dictionary::new();
        d.set_u64("nwid", self.network_id);
        d.set_u64("ts", self.timestamp as u64);
        d.set_u64("ctmd", self.credential_time_max_delta as u64);
        d.set_u64("r", self.revision);
        d.set_str("id", &self.issued_to.to_string());
        if !self.name.is_empty() {
            d.set_str("n", &self.name);
        }
        d.set_bool("p", self.is_public());
        d.set_u64("mtu", u64::from(self.mtu));
        d.set_u64("ml", u64::from(self.multicast_limit));
        d.set_bool("b", self.broadcast_enabled);
        if self.trace_level > 0 {
            d.set_u64("tl", u64::from(self.trace_level));
        }
        if !self.specialists.is_empty() {
            let sp: Vec<String> = self
                .specialists
                .iter()
                .map(|s| format!("{}/{:x}", s.address, s.flags))
                .collect();
            d.set_str("sp", &sp.join(","));
        }
        if !self.static_ips.is_empty() {
            let ips: Vec<String> = self.static_ips.iter().map(|r| r.to_string()).collect();
            d.set_str("ip", &ips.join(","));
        }
        if let Some(com) = &self.com {
            let mut bytes = Vec::new();
            com.marshal(&mut bytes);
            d.set_bytes("C", bytes);
        }
        d
    }

    /// Parse from the controller wire dictionary.
    pub fn from_dictionary(d: &Dictionary) -> Result<Self, NetworkConfigError> {
        let network_id = d
            .get_u64("nwid")
            .ok_or(NetworkConfigError::MissingField("nwid"))?;
        let issued_to: Address = d
            .get_str("id")
            .ok_or(NetworkConfigError::MissingField("id"))?
            .parse()?;

        let mut config = NetworkConfig::new(network_id, issued_to);
        config.timestamp = d
            .get_u64("ts")
            .ok_or(NetworkConfigError::MissingField("ts"))? as i64;
        if let Some(ctmd) = d.get_u64("ctmd") {
            config.credential_time_max_delta = ctmd as i64;
        }
        config.revision = d
            .get_u64("r")
            .ok_or(NetworkConfigError::MissingField("r"))?;
        config.name = d.get_str("n").unwrap_or_default().to_string();
        config.net_type = if d.get_bool("p").unwrap_or(true) {
            VirtualNetworkType::Public
        } else {
            VirtualNetworkType::Private
        };
        if let Some(mtu) = d.get_u64("mtu") {
            config.mtu = u32::try_from(mtu).map_err(|_| NetworkConfigError::BadField("mtu"))?;
        }
        if let Some(ml) = d.get_u64("ml") {
            config.multicast_limit =
                u32::try_from(ml).map_err(|_| NetworkConfigError::BadField("ml"))?;
        }
        config.broadcast_enabled = d.get_bool("b").unwrap_or(true);
        config.trace_level = d.get_u64("tl").unwrap_or(0) as u8;

        if let Some(sp) = d.get_str("sp") {
            for item in sp.split(',').filter(|s| !s.is_empty()) {
                let (addr, flags) = item
                    .split_once('/')
                    .ok_or(NetworkConfigError::BadField("sp"))?;
                config.specialists.push(Specialist {
                    address: addr.parse()?,
                    flags: u64::from_str_radix(flags, 16)
                        .map_err(|_| NetworkConfigError::BadField("sp"))?,
                });
            }
        }
        if let Some(ip) = d.get_str("ip") {
            for item in ip.split(',').filter(|s| !s.is_empty()) {
                let (addr, bits) = item
                    .split_once('/')
                    .ok_or(NetworkConfigError::BadField("ip"))?;
                config.static_ips.push(InetRange::new(
                    addr.parse().map_err(|_| NetworkConfigError::BadField("ip"))?,
                    bits.parse().map_err(|_| NetworkConfigError::BadField("ip"))?,
                ));
            }
        }
        if let Some(bytes) = d.get_bytes("C") {
            let mut r = Reader::new(bytes);
            config.com = Some(
                CertificateOfMembership::unmarshal(&mut r)
                    .ok_or(NetworkConfigError::BadField("C"))?,
            );
        }
        Ok(config)
    }
}

impl fmt::Display for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x} \"{}\" rev {}",
            self.network_id, self.name, self.revision
        )
    }
}

/// The controller's address for a network ID (top 40 bits).
pub fn controller_address_of(network_id: u64) -> Result<Address, IdentityError> {
    Address::from_u64(network_id >> 24)
}
