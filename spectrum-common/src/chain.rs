//! A simple chain enum which maps between Bitcoin Core's `chain` strings
//! ("main", "test", "signet", "regtest"), [`bitcoin::Network`], and the
//! genesis block hashes used to detect which chain an Electrum server is
//! indexing.

use std::{fmt, fmt::Display, str::FromStr};

use serde::Serialize;

/// Mainnet genesis block hash (big-endian hex, as displayed).
pub const GENESIS_MAIN: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
/// Testnet3 genesis block hash.
pub const GENESIS_TEST: &str =
    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";
/// Signet genesis block hash.
pub const GENESIS_SIGNET: &str =
    "00000008819873e925422c1ff0f99f7cc9bbb232af63a077a480a3633bee1ef6";

/// The chain a connected Electrum server is indexing. Detected from the
/// hash of block 0; anything unrecognized is treated as regtest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Main,
    Test,
    Signet,
    Regtest,
}

impl Chain {
    /// Detect the chain from the displayed hash of the 0th block.
    pub fn from_genesis_hash(hash: &str) -> Self {
        match hash {
            GENESIS_MAIN => Self::Main,
            GENESIS_TEST => Self::Test,
            GENESIS_SIGNET => Self::Signet,
            _ => Self::Regtest,
        }
    }

    /// Core's `chain` string for this chain.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Test => "test",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }

    /// Convert to a [`bitcoin::Network`] for address encoding.
    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Self::Main => bitcoin::Network::Bitcoin,
            Self::Test => bitcoin::Network::Testnet,
            Self::Signet => bitcoin::Network::Signet,
            Self::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "test" => Ok(Self::Test),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            _ => Err(anyhow::anyhow!("unknown chain: {s}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_chain_from_genesis() {
        assert_eq!(Chain::from_genesis_hash(GENESIS_MAIN), Chain::Main);
        assert_eq!(Chain::from_genesis_hash(GENESIS_TEST), Chain::Test);
        assert_eq!(Chain::from_genesis_hash(GENESIS_SIGNET), Chain::Signet);
        // Anything else is regtest.
        let hash =
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";
        assert_eq!(Chain::from_genesis_hash(hash), Chain::Regtest);
    }

    #[test]
    fn chain_str_roundtrip() {
        for chain in [Chain::Main, Chain::Test, Chain::Signet, Chain::Regtest]
        {
            assert_eq!(Chain::from_str(chain.as_str()).unwrap(), chain);
        }
    }
}
