//! Node identity system.
//!
//! Every node is identified by a dual Curve25519 keypair: an Ed25519 half
//! for signatures and an X25519 half for key agreement. The short overlay
//! [`Address`] is derived from the public key material through a work-gated
//! hash, so addresses cannot be chosen freely and collisions require
//! grinding keys.

mod address;
mod identity;

use sha2::{Digest, Sha512};
use thiserror::Error;

pub use address::Address;
pub use identity::{Identity, SIGNATURE_LENGTH};

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid address length: expected 5, got {0}")]
    InvalidAddressLength(usize),

    #[error("reserved or zero address")]
    ReservedAddress,

    #[error("malformed identity string")]
    MalformedString,

    #[error("unknown identity type: {0}")]
    UnknownType(u8),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("address does not match public key")]
    AddressMismatch,

    #[error("identity has no secret key")]
    MissingSecret,
}

/// Compute SHA-512 of data.
pub(crate) fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}
