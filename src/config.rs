use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Address;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub p2p_listen: SocketAddr,
    /// Peers dialed at startup. Keys are known up front in a permissioned
    /// deployment, which lets the dialer encrypt its handshake.
    #[serde(default)]
    pub bootstrap: Vec<BootstrapPeer>,
    /// Ordered validator set, as CXIDs. Empty means "this node only".
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default)]
    pub chain: ChainParams,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    /// Compressed secp256k1 public key, hex encoded.
    pub public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainParams {
    pub chain_id: u64,
    pub epoch: u64,
    pub difficulty: u64,
    /// Target seconds per block; also the proposal tick period.
    pub delay: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_id: 0,
            epoch: 1_000,
            difficulty: 100,
            delay: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Limits {
    pub max_proposal_size: u64,
    pub max_tx_size: u64,
    pub max_block_size: u64,
    pub max_tx_per_block: u64,
    pub minimal_gas_tip: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_proposal_size: MIB,
            max_tx_size: MIB,
            max_block_size: MIB,
            max_tx_per_block: 1_000,
            minimal_gas_tip: 0,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Parses the configured validator CXIDs.
    pub fn validator_addresses(&self) -> ChainResult<Vec<Address>> {
        self.validators
            .iter()
            .map(|text| Address::parse(text))
            .collect()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            p2p_listen: "0.0.0.0:5865".parse().expect("valid socket addr"),
            bootstrap: Vec::new(),
            validators: Vec::new(),
            chain: ChainParams::default(),
            limits: Limits::default(),
        }
    }
}
