//! Supported Aptos networks.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedChain {
    /// Local network used by integration tests.
    Jestnet,
    Mainnet,
    Testnet,
    Devnet,
}

impl SupportedChain {
    pub const ALL: [SupportedChain; 4] = [Self::Jestnet, Self::Mainnet, Self::Testnet, Self::Devnet];

    pub fn from_id(chain_id: u64) -> Result<Self, IndexerError> {
        match chain_id {
            0 => Ok(Self::Jestnet),
            1 => Ok(Self::Mainnet),
            2 => Ok(Self::Testnet),
            148 => Ok(Self::Devnet),
            other => Err(IndexerError::Config(format!("Aptos chain id {other} is invalid"))),
        }
    }

    pub fn id(self) -> u64 {
        match self {
            Self::Jestnet => 0,
            Self::Mainnet => 1,
            Self::Testnet => 2,
            Self::Devnet => 148,
        }
    }

    /// Default REST endpoint for the transaction stream.
    pub fn default_stream_endpoint(self) -> &'static str {
        match self {
            Self::Jestnet => "http://127.0.0.1:8080/v1",
            Self::Mainnet => "https://api.mainnet.aptoslabs.com/v1",
            Self::Testnet => "https://api.testnet.aptoslabs.com/v1",
            Self::Devnet => "https://api.devnet.aptoslabs.com/v1",
        }
    }
}

impl std::fmt::Display for SupportedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jestnet => write!(f, "jestnet"),
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Devnet => write!(f, "devnet"),
        }
    }
}
