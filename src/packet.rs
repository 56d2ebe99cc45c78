//! Overlay packet frames.
//!
//! A narrow codec: every overlay packet is a flat byte frame with a 64-bit
//! packet ID, destination and source addresses, a flags byte, and a one-byte
//! verb selecting the handler, followed by a verb-specific payload. Payload
//! armor (encryption and authentication) and fragmentation live outside the
//! engine; frames carry an armored flag and a hop counter only.
//!
//! ```text
//! [packet id:8][dest:5][src:5][flags:1][verb:1][payload...]
//! ```

use std::fmt;
use std::net::SocketAddr;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::identity::Address;
use crate::inet;

/// Offset of the packet ID.
pub const IDX_PACKET_ID: usize = 0;
/// Offset of the destination address.
pub const IDX_DEST: usize = 8;
/// Offset of the source address.
pub const IDX_SOURCE: usize = 13;
/// Offset of the flags byte.
pub const IDX_FLAGS: usize = 18;
/// Offset of the verb byte.
pub const IDX_VERB: usize = 19;
/// Offset of the verb payload; also the minimum valid packet length.
pub const IDX_PAYLOAD: usize = 20;

/// Minimum length of a well-formed packet.
pub const MIN_PACKET_LENGTH: usize = IDX_PAYLOAD;

/// Maximum length of a whole packet frame.
pub const MAX_PACKET_LENGTH: usize = 2800;

/// Maximum verb payload a single frame can carry.
pub const MAX_PACKET_PAYLOAD: usize = MAX_PACKET_LENGTH - IDX_PAYLOAD;

/// Overlay protocol version carried in HELLO.
pub const PROTO_VERSION: u8 = 10;

/// Hop counter ceiling (3 bits of the flags byte).
pub const MAX_HOPS: u8 = 7;

/// Flags bit: payload is armored end to end.
const FLAG_ENCRYPTED: u8 = 0x80;
/// Flags bits: hop counter.
const FLAG_HOPS_MASK: u8 = 0x07;

/// Errors from packet parsing and building.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("packet exceeds {MAX_PACKET_LENGTH} bytes")]
    TooLarge,

    #[error("unknown verb: 0x{0:02x}")]
    UnknownVerb(u8),

    #[error("bad address field")]
    BadAddress,
}

/// Packet verb: selects the handler for a decoded payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Frame = 0x06,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkCredentials = 0x0a,
    NetworkConfigRequest = 0x0b,
    NetworkConfig = 0x0c,
    MulticastGather = 0x0d,
    MulticastFrame = 0x0e,
    UserMessage = 0x14,
}

impl Verb {
    /// Decode a verb byte.
    pub fn from_u8(v: u8) -> Option<Verb> {
        Some(match v {
            0x00 => Verb::Nop,
            0x01 => Verb::Hello,
            0x02 => Verb::Error,
            0x03 => Verb::Ok,
            0x04 => Verb::Whois,
            0x06 => Verb::Frame,
            0x08 => Verb::Echo,
            0x09 => Verb::MulticastLike,
            0x0a => Verb::NetworkCredentials,
            0x0b => Verb::NetworkConfigRequest,
            0x0c => Verb::NetworkConfig,
            0x0d => Verb::MulticastGather,
            0x0e => Verb::MulticastFrame,
            0x14 => Verb::UserMessage,
            _ => return None,
        })
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error sub-codes carried in ERROR packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    ObjNotFound = 0x02,
    UnsupportedOperation = 0x05,
    NeedMembershipCredential = 0x06,
    NetworkAccessDenied = 0x07,
}

impl ErrorCode {
    /// Decode an error code byte.
    pub fn from_u8(v: u8) -> Option<ErrorCode> {
        Some(match v {
            0x00 => ErrorCode::None,
            0x02 => ErrorCode::ObjNotFound,
            0x05 => ErrorCode::UnsupportedOperation,
            0x06 => ErrorCode::NeedMembershipCredential,
            0x07 => ErrorCode::NetworkAccessDenied,
            _ => return None,
        })
    }
}

/// Generate a nonzero packet ID from the secure entropy source.
///
/// Zero is reserved as the "no request" sentinel in reply bookkeeping.
pub fn new_packet_id() -> u64 {
    loop {
        let id = OsRng.next_u64();
        if id != 0 {
            return id;
        }
    }
}

/// A mutable overlay packet frame.
#[derive(Clone)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Start a new outbound packet with a fresh packet ID.
    pub fn outgoing(dest: Address, source: Address, verb: Verb) -> Self {
        Self::with_packet_id(dest, source, verb, new_packet_id())
    }

    /// Start a new outbound packet with an explicit packet ID.
    pub fn with_packet_id(dest: Address, source: Address, verb: Verb, packet_id: u64) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&packet_id.to_be_bytes());
        buf.extend_from_slice(&dest.to_bytes());
        buf.extend_from_slice(&source.to_bytes());
        buf.push(0);
        buf.push(verb as u8);
        Self { buf }
    }

    /// Parse an inbound frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < MIN_PACKET_LENGTH {
            return Err(PacketError::Truncated(data.len()));
        }
        if data.len() > MAX_PACKET_LENGTH {
            return Err(PacketError::TooLarge);
        }
        Verb::from_u8(data[IDX_VERB]).ok_or(PacketError::UnknownVerb(data[IDX_VERB]))?;
        Address::from_bytes(&data[IDX_DEST..IDX_DEST + 5]).map_err(|_| PacketError::BadAddress)?;
        Address::from_bytes(&data[IDX_SOURCE..IDX_SOURCE + 5])
            .map_err(|_| PacketError::BadAddress)?;
        Ok(Self { buf: data.to_vec() })
    }

    /// Packet ID (doubles as the reply correlation nonce).
    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.buf[IDX_PACKET_ID..IDX_PACKET_ID + 8].try_into().unwrap())
    }

    /// Destination overlay address.
    pub fn dest(&self) -> Address {
        Address::from_bytes(&self.buf[IDX_DEST..IDX_DEST + 5]).expect("validated on construction")
    }

    /// Source overlay address.
    pub fn source(&self) -> Address {
        Address::from_bytes(&self.buf[IDX_SOURCE..IDX_SOURCE + 5])
            .expect("validated on construction")
    }

    /// Verb byte.
    pub fn verb(&self) -> Verb {
        Verb::from_u8(self.buf[IDX_VERB]).expect("validated on construction")
    }

    /// Hop count.
    pub fn hops(&self) -> u8 {
        self.buf[IDX_FLAGS] & FLAG_HOPS_MASK
    }

    /// Increment the hop count, returning false once the ceiling is hit.
    pub fn increment_hops(&mut self) -> bool {
        let h = self.hops();
        if h >= MAX_HOPS {
            return false;
        }
        self.buf[IDX_FLAGS] = (self.buf[IDX_FLAGS] & !FLAG_HOPS_MASK) | (h + 1);
        true
    }

    /// Whether the armored flag is set.
    pub fn is_encrypted(&self) -> bool {
        (self.buf[IDX_FLAGS] & FLAG_ENCRYPTED) != 0
    }

    /// Set or clear the armored flag.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        if encrypted {
            self.buf[IDX_FLAGS] |= FLAG_ENCRYPTED;
        } else {
            self.buf[IDX_FLAGS] &= !FLAG_ENCRYPTED;
        }
    }

    /// Verb payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buf[IDX_PAYLOAD..]
    }

    /// Total frame length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the frame carries no payload (frames are never fully empty).
    pub fn is_empty(&self) -> bool {
        self.buf.len() <= IDX_PAYLOAD
    }

    /// Whole frame bytes for the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // === Payload builders ===

    pub fn append_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_address(&mut self, a: Address) {
        self.buf.extend_from_slice(&a.to_bytes());
    }

    pub fn append_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Append a 16-bit length prefix followed by the bytes.
    pub fn append_u16_prefixed(&mut self, b: &[u8]) {
        debug_assert!(b.len() <= usize::from(u16::MAX));
        self.append_u16(b.len() as u16);
        self.append_bytes(b);
    }

    pub fn append_inet(&mut self, addr: Option<&SocketAddr>) {
        inet::write_inet(&mut self.buf, addr);
    }

    pub fn append_mac(&mut self, mac: inet::Mac) {
        self.buf.extend_from_slice(&mac.to_u64().to_be_bytes()[2..8]);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.packet_id())
            .field("dest", &self.dest())
            .field("source", &self.source())
            .field("verb", &self.verb())
            .field("len", &self.len())
            .finish()
    }
}

/// Cursor over a verb payload.
///
/// All reads return `None` on truncation; handlers treat that as a malformed
/// packet and drop it.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Wrap a payload slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether the cursor is exhausted.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    /// Take all remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_bytes(2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_bytes(4).map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_bytes(8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_bytes(8).map(|b| i64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_address(&mut self) -> Option<Address> {
        Address::from_bytes(self.read_bytes(5)?).ok()
    }

    pub fn read_mac(&mut self) -> Option<inet::Mac> {
        let b = self.read_bytes(6)?;
        let mut v = [0u8; 8];
        v[2..8].copy_from_slice(b);
        Some(inet::Mac::from_u64(u64::from_be_bytes(v)))
    }

    /// Read bytes preceded by a 16-bit length prefix.
    pub fn read_u16_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u16()?;
        self.read_bytes(usize::from(len))
    }

    /// Read a socket address written by the inet wire encoding.
    pub fn read_inet(&mut self) -> Option<Option<SocketAddr>> {
        let (addr, consumed) = inet::read_inet(&self.data[self.pos..])?;
        self.pos += consumed;
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u64) -> Address {
        Address::from_u64(v).unwrap()
    }

    #[test]
    fn test_build_and_parse() {
        let mut p = Packet::outgoing(addr(0x1111111111), addr(0x2222222222), Verb::Hello);
        p.append_u8(PROTO_VERSION);
        p.append_u64(0xdead_beef);
        p.set_encrypted(true);

        let parsed = Packet::from_bytes(p.as_bytes()).unwrap();
        assert_eq!(parsed.dest(), addr(0x1111111111));
        assert_eq!(parsed.source(), addr(0x2222222222));
        assert_eq!(parsed.verb(), Verb::Hello);
        assert_eq!(parsed.packet_id(), p.packet_id());
        assert_ne!(parsed.packet_id(), 0);
        assert!(parsed.is_encrypted());
        assert_eq!(parsed.hops(), 0);

        let mut r = Reader::new(parsed.payload());
        assert_eq!(r.read_u8(), Some(PROTO_VERSION));
        assert_eq!(r.read_u64(), Some(0xdead_beef));
        assert!(r.is_empty());
    }

    #[test]
    fn test_too_short_rejected() {
        assert!(matches!(
            Packet::from_bytes(&[0u8; MIN_PACKET_LENGTH - 1]),
            Err(PacketError::Truncated(_))
        ));
    }

    #[test]
    fn test_unknown_verb_rejected() {
        let p = Packet::outgoing(addr(1), addr(2), Verb::Nop);
        let mut raw = p.as_bytes().to_vec();
        raw[IDX_VERB] = 0xee;
        assert!(matches!(
            Packet::from_bytes(&raw),
            Err(PacketError::UnknownVerb(0xee))
        ));
    }

    #[test]
    fn test_hop_ceiling() {
        let mut p = Packet::outgoing(addr(1), addr(2), Verb::Frame);
        for expected in 1..=MAX_HOPS {
            assert!(p.increment_hops());
            assert_eq!(p.hops(), expected);
        }
        assert!(!p.increment_hops());
        assert_eq!(p.hops(), MAX_HOPS);
    }

    #[test]
    fn test_reader_truncation() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.read_u16(), Some(0x0102));
        assert_eq!(r.read_u16(), None);
        assert_eq!(r.read_u8(), Some(3));
        assert_eq!(r.read_u8(), None);
    }

    #[test]
    fn test_u16_prefixed_round_trip() {
        let mut p = Packet::outgoing(addr(1), addr(2), Verb::UserMessage);
        p.append_u16_prefixed(b"hello");
        let mut r = Reader::new(p.payload());
        assert_eq!(r.read_u16_prefixed(), Some(&b"hello"[..]));
    }
}
