//! 40-bit overlay address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::IdentityError;

/// A 40-bit overlay address derived from a node's public key.
///
/// Addresses are stable for the life of the key. The all-zero address and
/// the `0xff`-prefixed block are reserved and never assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(u64);

/// First byte marking the reserved address block.
pub const ADDRESS_RESERVED_PREFIX: u8 = 0xff;

impl Address {
    /// Wrap a 40-bit value, rejecting reserved values.
    pub fn from_u64(v: u64) -> Result<Self, IdentityError> {
        let v = v & 0xff_ffff_ffff;
        let a = Address(v);
        if a.is_reserved() {
            return Err(IdentityError::ReservedAddress);
        }
        Ok(a)
    }

    /// Parse from a 5-byte big-endian slice.
    pub fn from_bytes(b: &[u8]) -> Result<Self, IdentityError> {
        if b.len() != 5 {
            return Err(IdentityError::InvalidAddressLength(b.len()));
        }
        let v = (u64::from(b[0]) << 32)
            | (u64::from(b[1]) << 24)
            | (u64::from(b[2]) << 16)
            | (u64::from(b[3]) << 8)
            | u64::from(b[4]);
        Self::from_u64(v)
    }

    /// Raw 40-bit value.
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Big-endian 5-byte form.
    pub fn to_bytes(self) -> [u8; 5] {
        [
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    /// Check for the zero address or the reserved prefix.
    pub fn is_reserved(&self) -> bool {
        self.0 == 0 || (self.0 >> 32) as u8 == ADDRESS_RESERVED_PREFIX
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:010x})", self.0)
    }
}

impl FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 10 {
            return Err(IdentityError::MalformedString);
        }
        let v = u64::from_str_radix(s, 16).map_err(|_| IdentityError::MalformedString)?;
        Self::from_u64(v)
    }
}

impl TryFrom<String> for Address {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let a = Address::from_u64(0x0123_4567_89).unwrap();
        assert_eq!(a.to_string(), "0123456789");
        assert_eq!("0123456789".parse::<Address>().unwrap(), a);
        assert_eq!(Address::from_bytes(&a.to_bytes()).unwrap(), a);
    }

    #[test]
    fn test_reserved() {
        assert!(Address::from_u64(0).is_err());
        assert!(Address::from_u64(0xff00_0000_01).is_err());
        assert!(Address::from_u64(0xfe00_0000_01).is_ok());
    }

    #[test]
    fn test_upper_bits_masked() {
        let a = Address::from_u64(0x77_0123_4567_89).unwrap();
        assert_eq!(a.to_u64(), 0x0123_4567_89);
    }

    #[test]
    fn test_bad_strings() {
        assert!("012345678".parse::<Address>().is_err());
        assert!("01234567zz".parse::<Address>().is_err());
        assert!("0123456789ab".parse::<Address>().is_err());
    }
}
