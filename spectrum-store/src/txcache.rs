//! Content-addressed cache of raw transactions: `<datadir>/txs/<txid>.raw`,
//! hex, written once and immutable afterwards.
//!
//! Concurrent writers of the same txid are race-safe: the blob is staged in
//! a tempfile and moved into place without clobbering, so the first writer
//! wins and everyone else quietly agrees.

use std::{io::Write, path::PathBuf};

use bitcoin::{consensus, Transaction};
use spectrum_common::hex;
use tracing::debug;

/// Errors surfaced by the blob cache.
#[derive(Debug, thiserror::Error)]
pub enum TxCacheError {
    /// The transaction has not been cached (yet).
    #[error("transaction not cached: {0}")]
    NotCached(String),
    #[error("invalid txid: {0}")]
    InvalidTxid(String),
    #[error("invalid cached transaction {txid}: {message}")]
    Invalid { txid: String, message: String },
    #[error("tx cache io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TxCache {
    dir: PathBuf,
}

impl TxCache {
    /// Open (creating if needed) the `txs/` directory under `datadir`.
    pub fn open(datadir: &std::path::Path) -> std::io::Result<Self> {
        let dir = datadir.join("txs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, txid: &str) -> Result<PathBuf, TxCacheError> {
        // The txid doubles as a file name; insist it actually is one.
        let valid = txid.len() == 64
            && txid.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(TxCacheError::InvalidTxid(txid.to_owned()));
        }
        Ok(self.dir.join(format!("{}.raw", txid.to_lowercase())))
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.path_for(txid).map(|p| p.exists()).unwrap_or(false)
    }

    /// Store the hex serialization of a transaction. A no-op when the blob
    /// already exists.
    pub fn insert(
        &self,
        txid: &str,
        raw_hex: &str,
    ) -> Result<(), TxCacheError> {
        let path = self.path_for(txid)?;
        if path.exists() {
            return Ok(());
        }
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)?;
        staged.write_all(raw_hex.as_bytes())?;
        match staged.persist_noclobber(&path) {
            Ok(_file) => {
                debug!("Cached raw tx {txid}");
                Ok(())
            }
            // A concurrent writer got there first; the content is the
            // same by construction.
            Err(e)
                if e.error.kind() == std::io::ErrorKind::AlreadyExists =>
                Ok(()),
            Err(e) => Err(TxCacheError::Io(e.error)),
        }
    }

    /// The raw hex, or `NotCached`.
    pub fn get_raw(&self, txid: &str) -> Result<String, TxCacheError> {
        let path = self.path_for(txid)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.trim().to_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound =>
                Err(TxCacheError::NotCached(txid.to_owned())),
            Err(e) => Err(TxCacheError::Io(e)),
        }
    }

    /// The parsed transaction, or `NotCached`.
    pub fn get(&self, txid: &str) -> Result<Transaction, TxCacheError> {
        let raw = self.get_raw(txid)?;
        parse_tx_hex(&raw).map_err(|message| TxCacheError::Invalid {
            txid: txid.to_owned(),
            message,
        })
    }
}

/// Parse a hex-serialized transaction.
pub fn parse_tx_hex(raw_hex: &str) -> Result<Transaction, String> {
    let bytes = hex::decode(raw_hex.trim()).map_err(|e| e.to_string())?;
    consensus::deserialize(&bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    /// A 1-in/1-out legacy transaction, valid enough to round-trip the
    /// consensus codec.
    const RAW_TX: &str = "010000000100000000000000000000000000000000000000000000000000000000000000000000000000ffffffff0150c3000000000000160014000000000000000000000000000000000000000000000000";

    #[test]
    fn insert_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TxCache::open(dir.path()).unwrap();
        let txid = "ab".repeat(32);

        assert!(!cache.contains(&txid));
        assert!(matches!(
            cache.get_raw(&txid),
            Err(TxCacheError::NotCached(_))
        ));

        cache.insert(&txid, RAW_TX).unwrap();
        assert!(cache.contains(&txid));
        // Duplicate insert is a no-op.
        cache.insert(&txid, RAW_TX).unwrap();
        assert_eq!(cache.get_raw(&txid).unwrap(), RAW_TX);

        let tx = cache.get(&txid).unwrap();
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 50_000);
    }

    #[test]
    fn rejects_non_txid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TxCache::open(dir.path()).unwrap();
        assert!(matches!(
            cache.insert("../../etc/passwd", RAW_TX),
            Err(TxCacheError::InvalidTxid(_))
        ));
        assert!(matches!(
            cache.insert("abcd", RAW_TX),
            Err(TxCacheError::InvalidTxid(_))
        ));
    }
}
