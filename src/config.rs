//! Node configuration.
//!
//! Hosts may hand the engine a YAML-derived configuration at construction:
//! a pinned identity, networks to join, moons to orbit, and locally bound
//! addresses to register. Everything is optional; the default
//! configuration is empty and the engine is fully driveable through the
//! API alone.
//!
//! ```yaml
//! identity_secret: "aabbccddee:0:..."
//! networks:
//!   - "8056c2e21c000001"
//! moons:
//!   - world_id: "deadbeef00000001"
//!     seed: "0011223344"
//! local_addresses:
//!   - "192.0.2.10:9993"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{Address, IdentityError};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("bad network id: {0}")]
    BadNetworkId(String),

    #[error("bad world id: {0}")]
    BadWorldId(String),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// One moon to orbit at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoonConfig {
    /// World ID, 16 hex digits.
    pub world_id: String,
    /// Seed address to chase when the moon document is not yet persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

/// Startup configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Secret identity in canonical string form. Generated and persisted
    /// through the state-object callbacks when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_secret: Option<String>,

    /// Network IDs to join at startup, 16 hex digits each.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    /// Moons to orbit at startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub moons: Vec<MoonConfig>,

    /// Locally bound addresses to register.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_addresses: Vec<SocketAddr>,
}

fn parse_u64_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

impl NodeConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parsed network IDs.
    pub fn network_ids(&self) -> Result<Vec<u64>, ConfigError> {
        self.networks
            .iter()
            .map(|s| parse_u64_hex(s).ok_or_else(|| ConfigError::BadNetworkId(s.clone())))
            .collect()
    }

    /// Parsed moon orbits as (world ID, optional seed address).
    pub fn moon_orbits(&self) -> Result<Vec<(u64, Option<Address>)>, ConfigError> {
        self.moons
            .iter()
            .map(|moon| {
                let world_id = parse_u64_hex(&moon.world_id)
                    .ok_or_else(|| ConfigError::BadWorldId(moon.world_id.clone()))?;
                let seed = match &moon.seed {
                    Some(seed) => Some(seed.parse::<Address>()?),
                    None => None,
                };
                Ok((world_id, seed))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_default() {
        let config = NodeConfig::default();
        assert!(config.identity_secret.is_none());
        assert!(config.network_ids().unwrap().is_empty());
        assert!(config.moon_orbits().unwrap().is_empty());
    }

    #[test]
    fn test_parse_full_yaml() {
        let config = NodeConfig::from_yaml_str(
            r#"
networks:
  - "8056c2e21c000001"
moons:
  - world_id: "deadbeef00000001"
    seed: "0011223344"
local_addresses:
  - "192.0.2.10:9993"
"#,
        )
        .unwrap();
        assert_eq!(config.network_ids().unwrap(), vec![0x8056_c2e2_1c00_0001]);
        let moons = config.moon_orbits().unwrap();
        assert_eq!(moons.len(), 1);
        assert_eq!(moons[0].0, 0xdead_beef_0000_0001);
        assert_eq!(moons[0].1, Some("0011223344".parse().unwrap()));
        assert_eq!(config.local_addresses.len(), 1);
    }

    #[test]
    fn test_bad_network_id() {
        let config = NodeConfig {
            networks: vec!["not-hex".into()],
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.network_ids(),
            Err(ConfigError::BadNetworkId(_))
        ));
    }

    #[test]
    fn test_round_trip_serialization() {
        let config = NodeConfig {
            networks: vec!["00000000000000aa".into()],
            ..NodeConfig::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = NodeConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.network_ids().unwrap(), vec![0xaa]);
    }
}
