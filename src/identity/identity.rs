//! Node identity: dual Curve25519 keypair plus derived address.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::{sha512, Address, IdentityError};

/// Combined public key length: Ed25519 signing key then X25519 agreement key.
pub const PUBLIC_KEY_LENGTH: usize = 64;

/// Combined secret key length: signing seed then agreement scalar.
pub const SECRET_KEY_LENGTH: usize = 64;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// Identity type tag in the canonical string form. Only type 0 (dual
/// Curve25519) exists.
const IDENTITY_TYPE_C25519: u8 = 0;

/// Rounds of the address-derivation hash chain. The chain is the "work" in
/// the work gate: recomputing it is cheap to verify but grinding addresses
/// requires walking it once per candidate key.
const ADDRESS_DERIVATION_ROUNDS: usize = 31;

/// A candidate key is accepted only if the final digest's leading byte is
/// below this gate (about 1 in 15 keys).
const ADDRESS_DERIVATION_GATE: u8 = 17;

/// Secret half of an identity.
///
/// The dalek types scrub themselves on drop; the derive covers the
/// containing struct.
#[derive(ZeroizeOnDrop)]
struct SecretKeys {
    #[zeroize(skip)]
    sign: SigningKey,
    #[zeroize(skip)]
    agree: StaticSecret,
}

impl Clone for SecretKeys {
    fn clone(&self) -> Self {
        Self {
            sign: self.sign.clone(),
            agree: self.agree.clone(),
        }
    }
}

/// A node identity: Ed25519 signing key, X25519 agreement key, and the
/// 40-bit [`Address`] derived from the public halves.
///
/// An identity may be public-only (a remote peer's) or carry the secret
/// halves (our own, or a controller's signing identity).
#[derive(Clone)]
pub struct Identity {
    address: Address,
    sign_public: VerifyingKey,
    agree_public: AgreementPublic,
    secret: Option<SecretKeys>,
}

/// Derive the overlay address for combined public key material.
///
/// Returns `None` when the work gate rejects the key or the derived address
/// falls in the reserved block; callers generating identities must try a
/// fresh keypair in that case.
fn derive_address(public: &[u8; PUBLIC_KEY_LENGTH]) -> Option<Address> {
    let mut digest = sha512(public);
    for _ in 0..ADDRESS_DERIVATION_ROUNDS {
        digest = sha512(&digest);
    }
    if digest[0] >= ADDRESS_DERIVATION_GATE {
        return None;
    }
    Address::from_bytes(&digest[59..64]).ok()
}

impl Identity {
    /// Generate a fresh identity, grinding keypairs until one passes the
    /// address-derivation gate.
    pub fn generate() -> Self {
        loop {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            let sign = SigningKey::from_bytes(&seed);
            let agree = StaticSecret::random_from_rng(OsRng);
            let sign_public = sign.verifying_key();
            let agree_public = AgreementPublic::from(&agree);

            let mut public = [0u8; PUBLIC_KEY_LENGTH];
            public[..32].copy_from_slice(sign_public.as_bytes());
            public[32..].copy_from_slice(agree_public.as_bytes());

            if let Some(address) = derive_address(&public) {
                return Self {
                    address,
                    sign_public,
                    agree_public,
                    secret: Some(SecretKeys { sign, agree }),
                };
            }
        }
    }

    /// The derived overlay address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the secret halves are present.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Combined public key bytes (signing key then agreement key).
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        out[..32].copy_from_slice(self.sign_public.as_bytes());
        out[32..].copy_from_slice(self.agree_public.as_bytes());
        out
    }

    /// Re-derive the address from the public key and compare.
    ///
    /// Cheap enough to run on every identity learned from the wire.
    pub fn locally_validate(&self) -> bool {
        derive_address(&self.public_bytes()) == Some(self.address)
    }

    /// Sign data with the secret signing key.
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], IdentityError> {
        let secret = self.secret.as_ref().ok_or(IdentityError::MissingSecret)?;
        Ok(secret.sign.sign(data).to_bytes())
    }

    /// Verify a signature made by this identity.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(sig_bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };
        let sig = Signature::from_bytes(&sig_bytes);
        self.sign_public.verify(data, &sig).is_ok()
    }

    /// Perform key agreement with another identity, producing a 256-bit
    /// shared key. Requires our secret half.
    pub fn agree(&self, other: &Identity) -> Result<[u8; 32], IdentityError> {
        let secret = self.secret.as_ref().ok_or(IdentityError::MissingSecret)?;
        let shared = secret.agree.diffie_hellman(&other.agree_public);
        let digest = sha512(shared.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        Ok(key)
    }

    /// Strip the secret halves, keeping only the public identity.
    pub fn to_public(&self) -> Identity {
        Identity {
            address: self.address,
            sign_public: self.sign_public,
            agree_public: self.agree_public,
            secret: None,
        }
    }

    /// Canonical public string form: `address:0:<public hex>`.
    pub fn to_public_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.address,
            IDENTITY_TYPE_C25519,
            hex::encode(self.public_bytes())
        )
    }

    /// Canonical secret string form: `address:0:<public hex>:<secret hex>`.
    pub fn to_secret_string(&self) -> Result<String, IdentityError> {
        let secret = self.secret.as_ref().ok_or(IdentityError::MissingSecret)?;
        let mut sk = [0u8; SECRET_KEY_LENGTH];
        sk[..32].copy_from_slice(&secret.sign.to_bytes());
        sk[32..].copy_from_slice(&secret.agree.to_bytes());
        Ok(format!("{}:{}", self.to_public_string(), hex::encode(sk)))
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    /// Parse either string form. The address field must match the address
    /// re-derived from the public key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim().split(':');
        let address: Address = fields
            .next()
            .ok_or(IdentityError::MalformedString)?
            .parse()?;
        let id_type: u8 = fields
            .next()
            .ok_or(IdentityError::MalformedString)?
            .parse()
            .map_err(|_| IdentityError::MalformedString)?;
        if id_type != IDENTITY_TYPE_C25519 {
            return Err(IdentityError::UnknownType(id_type));
        }

        let public = hex::decode(fields.next().ok_or(IdentityError::MalformedString)?)?;
        let public: [u8; PUBLIC_KEY_LENGTH] = public
            .try_into()
            .map_err(|_| IdentityError::InvalidKey("bad public key length".into()))?;

        let sign_public_bytes: [u8; 32] =
            public[..32].try_into().expect("length checked above");
        let sign_public = VerifyingKey::from_bytes(&sign_public_bytes)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let agree_public_bytes: [u8; 32] =
            public[32..].try_into().expect("length checked above");
        let agree_public = AgreementPublic::from(agree_public_bytes);

        let secret = match fields.next() {
            None => None,
            Some(sec_hex) => {
                let sk = hex::decode(sec_hex)?;
                let sk: [u8; SECRET_KEY_LENGTH] = sk
                    .try_into()
                    .map_err(|_| IdentityError::InvalidKey("bad secret key length".into()))?;
                let sign =
                    SigningKey::from_bytes(&sk[..32].try_into().expect("length checked above"));
                if sign.verifying_key() != sign_public {
                    return Err(IdentityError::InvalidKey(
                        "secret does not match public key".into(),
                    ));
                }
                let agree = StaticSecret::from(
                    <[u8; 32]>::try_from(&sk[32..]).expect("length checked above"),
                );
                Some(SecretKeys { sign, agree })
            }
        };
        if fields.next().is_some() {
            return Err(IdentityError::MalformedString);
        }

        if derive_address(&public) != Some(address) {
            return Err(IdentityError::AddressMismatch);
        }

        Ok(Self {
            address,
            sign_public,
            agree_public,
            secret,
        })
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.sign_public == other.sign_public
            && self.agree_public.as_bytes() == other.agree_public.as_bytes()
    }
}

impl Eq for Identity {}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_public_string())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("has_secret", &self.has_secret())
            .finish_non_exhaustive()
    }
}

/// Serialized as the public string form only; secrets never leave through
/// serde.
impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_public_string())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
