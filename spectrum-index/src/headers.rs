//! Parsing of the 80-byte block headers Electrum hands out as hex.
//!
//! The block hash is `double_sha256(header_bytes)` reversed, which is what
//! [`bitcoin::block::Header::block_hash`] computes and how [`BlockHash`]
//! displays.
//!
//! [`BlockHash`]: bitcoin::BlockHash

use bitcoin::{block::Header, consensus};
use spectrum_common::hex;

#[derive(Debug, thiserror::Error)]
#[error("malformed block header: {0}")]
pub struct HeaderError(String);

/// The fields the indexer cares about.
#[derive(Clone, Debug)]
pub struct ParsedHeader {
    /// Displayed (reversed) hex hash.
    pub blockhash: String,
    /// The header's timestamp.
    pub blocktime: u64,
}

/// Parse a hex-encoded 80-byte header.
pub fn parse_header_hex(hex_header: &str) -> Result<ParsedHeader, HeaderError> {
    let bytes = hex::decode(hex_header.trim())
        .map_err(|e| HeaderError(e.to_string()))?;
    let header: Header = consensus::deserialize(&bytes)
        .map_err(|e| HeaderError(e.to_string()))?;
    Ok(ParsedHeader {
        blockhash: header.block_hash().to_string(),
        blocktime: u64::from(header.time),
    })
}

/// Just the displayed hash of a hex-encoded header.
pub fn blockhash_hex(hex_header: &str) -> Result<String, HeaderError> {
    parse_header_hex(hex_header).map(|h| h.blockhash)
}

/// The mainnet genesis header, shared by tests across the crate.
#[cfg(test)]
pub(crate) const GENESIS_HEADER_MAIN: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hashes_the_genesis_header() {
        let parsed = parse_header_hex(GENESIS_HEADER_MAIN).unwrap();
        assert_eq!(
            parsed.blockhash,
            spectrum_common::chain::GENESIS_MAIN,
        );
        assert_eq!(parsed.blocktime, 1231006505);
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(parse_header_hex("zz").is_err());
        assert!(parse_header_hex("0011").is_err());
    }
}
