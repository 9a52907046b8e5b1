//! Shared chain-level state: the current tip, the detected chain, sync
//! progress, and a small height → blockhash cache in front of Electrum.

use std::{
    num::NonZeroUsize,
    sync::{Mutex, RwLock},
    time::Instant,
};

use lru::LruCache;
use spectrum_common::chain::Chain;
use tracing::info;

use crate::headers::{self, HeaderError};

/// Intermediate heights rarely repeat outside fee-bumping flows, so the
/// cache stays small.
const HEADER_CACHE_SIZE: usize = 256;

#[derive(Clone, Debug)]
struct Tip {
    blocks: u32,
    bestblockhash: String,
}

#[derive(Clone, Copy, Debug, Default)]
struct Progress {
    percent: u8,
    /// Scripts per second of the running (or last) sync.
    rate: f64,
}

/// Chain state shared between the router, the indexer, and the RPC layer.
pub struct ChainState {
    chain: RwLock<Chain>,
    roothash: RwLock<String>,
    tip: RwLock<Tip>,
    progress: RwLock<Progress>,
    blockhash_cache: Mutex<LruCache<u32, String>>,
    started_at: Instant,
}

impl ChainState {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            chain: RwLock::new(Chain::Regtest),
            roothash: RwLock::new(String::new()),
            tip: RwLock::new(Tip {
                blocks: 0,
                bestblockhash: String::new(),
            }),
            progress: RwLock::new(Progress::default()),
            blockhash_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HEADER_CACHE_SIZE).expect("nonzero"),
            )),
            started_at: Instant::now(),
        }
    }

    /// Record the chain detected from the hash of block 0.
    pub fn set_root(&self, root_header_hex: &str) -> Result<(), HeaderError> {
        let roothash = headers::blockhash_hex(root_header_hex)?;
        let chain = Chain::from_genesis_hash(&roothash);
        info!("Detected chain {chain} (root {roothash})");
        *self.chain.write().expect("poisoned") = chain;
        *self.roothash.write().expect("poisoned") = roothash;
        Ok(())
    }

    /// Apply a new tip from `blockchain.headers.subscribe`.
    pub fn apply_tip(
        &self,
        height: u32,
        header_hex: &str,
    ) -> Result<(), HeaderError> {
        let bestblockhash = headers::blockhash_hex(header_hex)?;
        let mut tip = self.tip.write().expect("poisoned");
        tip.blocks = height;
        tip.bestblockhash = bestblockhash;
        Ok(())
    }

    pub fn chain(&self) -> Chain {
        *self.chain.read().expect("poisoned")
    }

    pub fn roothash(&self) -> String {
        self.roothash.read().expect("poisoned").clone()
    }

    pub fn blocks(&self) -> u32 {
        self.tip.read().expect("poisoned").blocks
    }

    pub fn bestblockhash(&self) -> String {
        self.tip.read().expect("poisoned").bestblockhash.clone()
    }

    /// Confirmations for something at `height`, as Core counts them.
    pub fn confirmations(&self, height: Option<u32>) -> u32 {
        match height {
            Some(height) if height > 0 =>
                self.blocks().saturating_sub(height) + 1,
            _ => 0,
        }
    }

    pub fn set_sync_progress(&self, percent: u8, rate: f64) {
        let mut progress = self.progress.write().expect("poisoned");
        progress.percent = percent.min(100);
        progress.rate = rate;
    }

    /// `(percent, scripts/s)` of the running (or last finished) sync.
    pub fn sync_progress(&self) -> (u8, f64) {
        let progress = self.progress.read().expect("poisoned");
        (progress.percent, progress.rate)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn cached_blockhash(&self, height: u32) -> Option<String> {
        self.blockhash_cache
            .lock()
            .expect("poisoned")
            .get(&height)
            .cloned()
    }

    pub fn cache_blockhash(&self, height: u32, blockhash: String) {
        self.blockhash_cache
            .lock()
            .expect("poisoned")
            .put(height, blockhash);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::headers::GENESIS_HEADER_MAIN;

    #[test]
    fn detects_main_from_root_header() {
        let chain_state = ChainState::new();
        assert_eq!(chain_state.chain(), Chain::Regtest);
        chain_state.set_root(GENESIS_HEADER_MAIN).unwrap();
        assert_eq!(chain_state.chain(), Chain::Main);
        assert_eq!(
            chain_state.roothash(),
            spectrum_common::chain::GENESIS_MAIN
        );
    }

    #[test]
    fn tip_and_confirmations() {
        let chain_state = ChainState::new();
        chain_state.apply_tip(100, GENESIS_HEADER_MAIN).unwrap();
        assert_eq!(chain_state.blocks(), 100);
        assert_eq!(chain_state.confirmations(Some(100)), 1);
        assert_eq!(chain_state.confirmations(Some(91)), 10);
        assert_eq!(chain_state.confirmations(None), 0);
    }

    #[test]
    fn blockhash_cache_roundtrip() {
        let chain_state = ChainState::new();
        assert_eq!(chain_state.cached_blockhash(7), None);
        chain_state.cache_blockhash(7, "aa".repeat(32));
        assert_eq!(chain_state.cached_blockhash(7), Some("aa".repeat(32)));
    }
}
