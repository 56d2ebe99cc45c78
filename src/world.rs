//! Root-set documents.
//!
//! A world names the roots of the overlay: a set of identities with stable
//! physical endpoints that answer WHOIS and assist NAT traversal. The
//! planet is the single primary world; moons are additional worlds a node
//! opts into ("orbits"). Worlds are signed documents: an update is accepted
//! only if it names the same world, is newer, and carries a valid signature
//! from the incumbent document's update key.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::identity::{Identity, IdentityError};

/// One root: an identity plus the stable endpoints it listens on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// The root's identity (public).
    pub identity: Identity,
    /// Physical endpoints that are always worth contacting.
    pub stable_endpoints: Vec<SocketAddr>,
}

/// Kind of world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldType {
    /// The primary root set; exactly one per node.
    Planet,
    /// An additional, user-opted root set.
    Moon,
}

/// A signed root-set document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    /// World ID. Moons are addressed by this.
    pub id: u64,
    /// Document revision timestamp; newer replaces older.
    pub timestamp: i64,
    /// Planet or moon.
    pub world_type: WorldType,
    /// The root nodes.
    pub roots: Vec<Root>,
    /// Identity whose signature future updates must carry. Absent on the
    /// built-in fallback planet, which therefore accepts no updates.
    pub update_signer: Option<Identity>,
    /// Signature by the previous document's update signer (or self-signed
    /// on a freshly authored document).
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl World {
    /// The built-in fallback planet: empty, unsigned, accepts no updates.
    /// Used only when the host has no persisted planet.
    pub fn fallback_planet() -> World {
        World {
            id: 0,
            timestamp: 0,
            world_type: WorldType::Planet,
            roots: Vec::new(),
            update_signer: None,
            signature: None,
        }
    }

    /// Bytes covered by the document signature.
    fn signing_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).expect("world serialization is infallible")
    }

    /// Sign this document with the given identity and record it as the
    /// update signer for successors.
    pub fn sign(&mut self, signer: &Identity) -> Result<(), IdentityError> {
        self.update_signer = Some(signer.to_public());
        let payload = self.signing_payload();
        self.signature = Some(signer.sign(&payload)?.to_vec());
        Ok(())
    }

    /// Verify the document against its own update signer (self-consistency
    /// for freshly authored or persisted documents).
    pub fn verify(&self) -> bool {
        match (&self.update_signer, &self.signature) {
            (Some(signer), Some(sig)) => signer.verify(&self.signing_payload(), sig),
            _ => false,
        }
    }

    /// Decide whether `update` may replace this document.
    ///
    /// Same world, newer revision, and a signature valid under the
    /// incumbent's update key.
    pub fn should_be_replaced_by(&self, update: &World) -> bool {
        if update.id != self.id || update.world_type != self.world_type {
            return false;
        }
        if update.timestamp <= self.timestamp {
            return false;
        }
        let Some(incumbent_signer) = &self.update_signer else {
            return false;
        };
        match &update.signature {
            Some(sig) => incumbent_signer.verify(&update.signing_payload(), sig),
            None => false,
        }
    }

    /// Whether an address is one of this world's roots.
    pub fn is_root(&self, address: crate::identity::Address) -> bool {
        self.roots.iter().any(|r| r.identity.address() == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Address;

    fn make_world(signer: &Identity, ts: i64, roots: Vec<Root>) -> World {
        let mut w = World {
            id: 7,
            timestamp: ts,
            world_type: WorldType::Moon,
            roots,
            update_signer: None,
            signature: None,
        };
        w.sign(signer).unwrap();
        w
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let signer = Identity::generate();
        let w = make_world(&signer, 100, Vec::new());
        assert!(w.verify());

        let mut tampered = w.clone();
        tampered.timestamp = 101;
        assert!(!tampered.verify());
    }

    #[test]
    fn test_update_acceptance() {
        let signer = Identity::generate();
        let v1 = make_world(&signer, 100, Vec::new());

        let root = Root {
            identity: Identity::generate().to_public(),
            stable_endpoints: vec!["198.51.100.7:9993".parse().unwrap()],
        };
        let v2 = make_world(&signer, 200, vec![root]);
        assert!(v1.should_be_replaced_by(&v2));
        assert!(!v2.should_be_replaced_by(&v1)); // older

        // updates from a different signer are refused
        let impostor = Identity::generate();
        let forged = make_world(&impostor, 300, Vec::new());
        assert!(!v1.should_be_replaced_by(&forged));

        // a different world never replaces
        let mut other = make_world(&signer, 300, Vec::new());
        other.id = 8;
        other.sign(&signer).unwrap();
        assert!(!v1.should_be_replaced_by(&other));
    }

    #[test]
    fn test_fallback_planet_accepts_nothing() {
        let planet = World::fallback_planet();
        assert!(!planet.verify());
        let signer = Identity::generate();
        let mut update = World::fallback_planet();
        update.timestamp = 1;
        update.sign(&signer).unwrap();
        assert!(!planet.should_be_replaced_by(&update));
    }

    #[test]
    fn test_is_root() {
        let signer = Identity::generate();
        let root_id = Identity::generate();
        let w = make_world(
            &signer,
            1,
            vec![Root {
                identity: root_id.to_public(),
                stable_endpoints: Vec::new(),
            }],
        );
        assert!(w.is_root(root_id.address()));
        assert!(!w.is_root(Address::from_u64(0x1234567890).unwrap()));
    }

    #[test]
    fn test_serde_round_trip() {
        let signer = Identity::generate();
        let w = make_world(&signer, 42, Vec::new());
        let bytes = serde_json::to_vec(&w).unwrap();
        let parsed: World = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, w);
        assert!(parsed.verify());
    }
}
