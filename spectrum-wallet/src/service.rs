//! Wallet and descriptor management: creation, import, script pools,
//! address handout, labels.

use std::sync::{Arc, Mutex};

use bitcoin::secp256k1::{All, Secp256k1};
use spectrum_common::{amount::Amount, hex, rng::SysRng};
use spectrum_electrum::{ElectrumApi, TransportError};
use spectrum_index::{ChainState, Indexer};
use spectrum_store::{
    db::StoreError, electrum_scripthash, txcache::TxCacheError, Db,
    Descriptor, Script, TxCache, Wallet,
};
use tracing::info;

use crate::descriptors::{
    address_from_spk_hex, seed_descriptor_pair, spk_hex_from_address,
    DescriptorError, ParsedDescriptor,
};

/// Default script-pool size for imported descriptors.
pub const DEFAULT_RANGE: u32 = 300;
/// How many scripts we keep derived beyond `next_index` once a pool is in
/// use.
pub const POOL_LOOKAHEAD: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet already exists")]
    WalletExists,
    #[error("No active descriptors")]
    NoActiveDescriptor,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Invalid parameter: {0}")]
    BadParam(String),
    #[error("Invalid or non-wallet transaction id")]
    InvalidTxid,
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    TxCache(#[from] TxCacheError),
    #[error("psbt error: {0}")]
    Psbt(String),
}

pub struct WalletService {
    pub(crate) db: Arc<Db>,
    pub(crate) txcache: Arc<TxCache>,
    pub(crate) electrum: Arc<dyn ElectrumApi>,
    pub(crate) chain: Arc<ChainState>,
    indexer: Arc<Indexer>,
    pub(crate) secp: Secp256k1<All>,
    pub(crate) rng: Mutex<SysRng>,
}

impl WalletService {
    pub fn new(
        db: Arc<Db>,
        txcache: Arc<TxCache>,
        electrum: Arc<dyn ElectrumApi>,
        chain: Arc<ChainState>,
        indexer: Arc<Indexer>,
    ) -> Self {
        Self {
            db,
            txcache,
            electrum,
            chain,
            indexer,
            secp: Secp256k1::new(),
            rng: Mutex::new(SysRng::new()),
        }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Create a wallet. Unless blank or watch-only, a fresh seed is
    /// generated and a `wpkh` external/internal descriptor pair imported.
    pub fn create_wallet(
        &self,
        name: &str,
        disable_private_keys: bool,
        blank: bool,
    ) -> Result<Wallet, WalletError> {
        let mut txn = self.db.begin_write();
        let wallet = txn
            .create_wallet(name, !disable_private_keys)
            .map_err(|e| match e {
                StoreError::WalletExists => WalletError::WalletExists,
                other => WalletError::Store(other),
            })?;
        txn.commit();
        info!("Created wallet {name}");

        if !blank && !disable_private_keys {
            self.set_seed(&wallet)?;
        }
        Ok(self.db.wallet(wallet.id).unwrap_or(wallet))
    }

    /// Generate and store a seed, then import its descriptor pair.
    fn set_seed(&self, wallet: &Wallet) -> Result<(), WalletError> {
        let seed = self.rng.lock().expect("poisoned").gen_seed32();
        let network = self.chain.chain().to_bitcoin();
        let (external, internal) =
            seed_descriptor_pair(&self.secp, &seed, network)?;

        let mut stored = wallet.clone();
        stored.seed = Some(hex::encode(&seed));
        let mut txn = self.db.begin_write();
        txn.update_wallet(stored)?;
        txn.commit();

        self.import_descriptor(
            wallet,
            &external,
            false,
            true,
            DEFAULT_RANGE,
            0,
        )?;
        self.import_descriptor(
            wallet,
            &internal,
            true,
            true,
            DEFAULT_RANGE,
            0,
        )?;
        Ok(())
    }

    /// Import a descriptor: split out private keys, optionally make it the
    /// active descriptor for its `(wallet, internal)` slot, pre-generate
    /// the script pool, and kick off its sync.
    pub fn import_descriptor(
        &self,
        wallet: &Wallet,
        descriptor_str: &str,
        internal: bool,
        active: bool,
        range: u32,
        next_index: u32,
    ) -> Result<Descriptor, WalletError> {
        info!("Importing descriptor into wallet {}", wallet.name);
        let parsed = ParsedDescriptor::parse(&self.secp, descriptor_str)?;
        let private_descriptor = parsed
            .has_private_keys()
            .then(|| descriptor_str.to_owned());

        let pool_size = next_index + range;
        let mut txn = self.db.begin_write();
        if active {
            // At most one active descriptor per (wallet, internal) pair.
            txn.deactivate_descriptors(wallet.id, internal);
        }
        let descriptor = txn.insert_descriptor(Descriptor {
            id: 0,
            wallet_id: wallet.id,
            active,
            internal,
            descriptor: parsed.public_string(),
            private_descriptor,
            next_index,
        });
        for index in 0..pool_size {
            let spk = parsed.script_pubkey_at(index)?;
            txn.insert_script(Script {
                id: 0,
                wallet_id: wallet.id,
                descriptor_id: Some(descriptor.id),
                index: Some(index),
                script: hex::encode(spk.as_bytes()),
                scripthash: electrum_scripthash(spk.as_bytes()),
                state: None,
                confirmed: Amount::ZERO,
                unconfirmed: Amount::ZERO,
                label: None,
            });
        }
        txn.commit();
        info!(
            "Created {pool_size} scriptpubkeys for wallet {}",
            wallet.name,
        );

        self.indexer.spawn_descriptor_sync(descriptor.id);
        Ok(descriptor)
    }

    /// Hand out the active external descriptor's address at `next_index`,
    /// then advance the index and top up the pool.
    pub fn new_address(&self, wallet: &Wallet) -> Result<String, WalletError> {
        self.address_from_active(wallet, false)
    }

    /// Same, for the internal (change) descriptor.
    pub fn change_address(
        &self,
        wallet: &Wallet,
    ) -> Result<String, WalletError> {
        self.address_from_active(wallet, true)
    }

    fn address_from_active(
        &self,
        wallet: &Wallet,
        internal: bool,
    ) -> Result<String, WalletError> {
        let descriptor = self
            .db
            .active_descriptor(wallet.id, internal)
            .ok_or(WalletError::NoActiveDescriptor)?;
        let index = descriptor.next_index;
        // The address must come from a pre-generated, subscribed script.
        let script = self
            .db
            .script_by_descriptor_index(descriptor.id, index)
            .ok_or_else(|| {
                WalletError::BadParam(format!(
                    "script pool exhausted at index {index}"
                ))
            })?;
        let network = self.chain.chain().to_bitcoin();
        let address = address_from_spk_hex(&script.script, network)?;

        let mut txn = self.db.begin_write();
        txn.set_next_index(descriptor.id, index + 1)?;
        txn.commit();
        self.refill_pool(&descriptor, index + 1)?;

        Ok(address.to_string())
    }

    /// Peek at the current change address without advancing the index,
    /// used when funding a PSBT with a default change output.
    pub fn peek_change_address(
        &self,
        wallet: &Wallet,
    ) -> Result<String, WalletError> {
        let descriptor = self
            .db
            .active_descriptor(wallet.id, true)
            .ok_or(WalletError::NoActiveDescriptor)?;
        let script = self
            .db
            .script_by_descriptor_index(descriptor.id, descriptor.next_index)
            .ok_or(WalletError::NoActiveDescriptor)?;
        let network = self.chain.chain().to_bitcoin();
        Ok(address_from_spk_hex(&script.script, network)?.to_string())
    }

    /// Extend a descriptor's pool so scripts exist through
    /// `next_index + POOL_LOOKAHEAD`, subscribing anything new.
    fn refill_pool(
        &self,
        descriptor: &Descriptor,
        next_index: u32,
    ) -> Result<(), WalletError> {
        let existing = self.db.scripts_by_descriptor(descriptor.id);
        let max_index = existing
            .iter()
            .filter_map(|s| s.index)
            .max()
            .map(|i| i + 1)
            .unwrap_or(0);
        let target = next_index + POOL_LOOKAHEAD;
        if max_index >= target {
            return Ok(());
        }

        let parsed =
            ParsedDescriptor::parse(&self.secp, &descriptor.descriptor)?;
        let wallet_id = descriptor.wallet_id;
        let mut new_ids = Vec::new();
        let mut txn = self.db.begin_write();
        for index in max_index..target {
            let spk = parsed.script_pubkey_at(index)?;
            let script = txn.insert_script(Script {
                id: 0,
                wallet_id,
                descriptor_id: Some(descriptor.id),
                index: Some(index),
                script: hex::encode(spk.as_bytes()),
                scripthash: electrum_scripthash(spk.as_bytes()),
                state: None,
                confirmed: Amount::ZERO,
                unconfirmed: Amount::ZERO,
                label: None,
            });
            new_ids.push(script.id);
        }
        txn.commit();
        info!(
            "Refilled pool of descriptor {} with {} scripts",
            descriptor.id,
            new_ids.len(),
        );
        self.indexer.spawn_scripts_sync(new_ids);
        Ok(())
    }

    /// The concrete (index-bound) descriptor string behind a pool script,
    /// for `listunspent`'s `desc` field.
    pub fn script_descriptor(
        &self,
        script: &Script,
    ) -> Result<Option<String>, WalletError> {
        let (Some(descriptor_id), Some(index)) =
            (script.descriptor_id, script.index)
        else {
            return Ok(None);
        };
        let Some(descriptor) = self.db.descriptor(descriptor_id) else {
            return Ok(None);
        };
        let parsed =
            ParsedDescriptor::parse(&self.secp, &descriptor.descriptor)?;
        Ok(Some(parsed.at_index(index)?.to_string()))
    }

    // --- Labels --- //

    /// Label the wallet's script for `address`, if we track it.
    pub fn set_label(
        &self,
        wallet: &Wallet,
        address: &str,
        label: &str,
    ) -> Result<(), WalletError> {
        let network = self.chain.chain().to_bitcoin();
        let spk_hex = spk_hex_from_address(address, network)
            .map_err(|e| WalletError::BadParam(e.to_string()))?;
        if let Some(script) = self.db.script_by_spk(wallet.id, &spk_hex) {
            let mut txn = self.db.begin_write();
            let label =
                (!label.is_empty()).then(|| label.to_owned());
            txn.set_script_label(script.id, label)?;
            txn.commit();
        }
        Ok(())
    }

    pub fn labels(&self, wallet: &Wallet) -> Vec<String> {
        self.db.labels_by_wallet(wallet.id)
    }

    /// `address -> purpose` for every script carrying `label`.
    pub fn addresses_by_label(
        &self,
        wallet: &Wallet,
        label: &str,
    ) -> Result<Vec<(String, &'static str)>, WalletError> {
        let network = self.chain.chain().to_bitcoin();
        let mut out = Vec::new();
        for script in self.db.scripts_by_label(wallet.id, label) {
            let address = address_from_spk_hex(&script.script, network)?;
            let purpose = if script.index.is_some() {
                "receive"
            } else {
                "send"
            };
            out.push((address.to_string(), purpose));
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use spectrum_electrum::test_utils::ScriptedElectrum;
    use spectrum_store::TxCache;

    use super::*;

    pub(crate) fn service_fixture() -> (tempfile::TempDir, WalletService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::in_memory());
        let txcache = Arc::new(TxCache::open(dir.path()).unwrap());
        // Nothing programmed: wallet-service paths only touch Electrum
        // via spawned sync tasks, which tolerate the timeouts.
        let electrum = ScriptedElectrum::new();
        let chain = Arc::new(ChainState::new());
        let indexer = Arc::new(Indexer::new(
            db.clone(),
            txcache.clone(),
            electrum.clone(),
            chain.clone(),
        ));
        let service =
            WalletService::new(db, txcache, electrum, chain, indexer);
        (dir, service)
    }

    #[tokio::test]
    async fn create_wallet_rejects_duplicates() {
        let (_dir, service) = service_fixture();
        service.create_wallet("w", true, false).unwrap();
        let err = service.create_wallet("w", true, false).unwrap_err();
        assert!(matches!(err, WalletError::WalletExists));
    }

    #[tokio::test]
    async fn hot_wallet_gets_descriptor_pair() {
        let (_dir, service) = service_fixture();
        let wallet = service.create_wallet("hot", false, false).unwrap();
        assert!(wallet.private_keys_enabled);
        assert!(wallet.seed.is_some());

        let descriptors = service.db.descriptors_by_wallet(wallet.id);
        assert_eq!(descriptors.len(), 2);
        let external = service
            .db
            .active_descriptor(wallet.id, false)
            .unwrap();
        let internal = service.db.active_descriptor(wallet.id, true).unwrap();
        assert_ne!(external.id, internal.id);
        // Private material split out, public form stored.
        assert!(external.private_descriptor.is_some());
        assert!(!external.descriptor.contains("prv"));
        // Pool pre-generated through next_index + range.
        assert_eq!(
            service.db.scripts_by_descriptor(external.id).len(),
            DEFAULT_RANGE as usize,
        );
    }

    #[tokio::test]
    async fn import_reaches_first_address() {
        let (_dir, service) = service_fixture();
        let wallet = service.create_wallet("w", true, false).unwrap();

        // A public-only descriptor, range 5.
        let secp = Secp256k1::new();
        let seed = [3u8; 32];
        let (external, _) = seed_descriptor_pair(
            &secp,
            &seed,
            bitcoin::Network::Regtest,
        )
        .unwrap();
        let parsed = ParsedDescriptor::parse(&secp, &external).unwrap();
        let public = parsed.public_string();

        let descriptor = service
            .import_descriptor(&wallet, &public, false, true, 5, 0)
            .unwrap();
        assert!(descriptor.private_descriptor.is_none());
        assert_eq!(
            service.db.scripts_by_descriptor(descriptor.id).len(),
            5,
        );

        // getnewaddress returns the bech32 address of derive(0).
        let address = service.new_address(&wallet).unwrap();
        let expected = bitcoin::Address::from_script(
            &parsed.script_pubkey_at(0).unwrap(),
            bitcoin::Network::Regtest,
        )
        .unwrap();
        assert_eq!(address, expected.to_string());

        // The index advanced and the pool was topped up.
        let descriptor = service.db.descriptor(descriptor.id).unwrap();
        assert_eq!(descriptor.next_index, 1);
        let pool = service.db.scripts_by_descriptor(descriptor.id);
        assert_eq!(pool.len(), (1 + POOL_LOOKAHEAD) as usize);

        // The next call returns derive(1).
        let address2 = service.new_address(&wallet).unwrap();
        let expected2 = bitcoin::Address::from_script(
            &parsed.script_pubkey_at(1).unwrap(),
            bitcoin::Network::Regtest,
        )
        .unwrap();
        assert_eq!(address2, expected2.to_string());
    }

    #[tokio::test]
    async fn active_import_deactivates_previous() {
        let (_dir, service) = service_fixture();
        let wallet = service.create_wallet("w", true, false).unwrap();

        let secp = Secp256k1::new();
        let mk_public = |seed_byte: u8| {
            let (external, _) = seed_descriptor_pair(
                &secp,
                &[seed_byte; 32],
                bitcoin::Network::Regtest,
            )
            .unwrap();
            ParsedDescriptor::parse(&secp, &external)
                .unwrap()
                .public_string()
        };

        let first = service
            .import_descriptor(&wallet, &mk_public(1), false, true, 2, 0)
            .unwrap();
        let second = service
            .import_descriptor(&wallet, &mk_public(2), false, true, 2, 0)
            .unwrap();

        let active = service.db.active_descriptor(wallet.id, false).unwrap();
        assert_eq!(active.id, second.id);
        assert!(!service.db.descriptor(first.id).unwrap().active);
    }

    #[tokio::test]
    async fn labels_roundtrip() {
        let (_dir, service) = service_fixture();
        let wallet = service.create_wallet("w", false, false).unwrap();
        let address = service.new_address(&wallet).unwrap();

        service.set_label(&wallet, &address, "donations").unwrap();
        assert!(service
            .labels(&wallet)
            .contains(&"donations".to_owned()));
        let by_label =
            service.addresses_by_label(&wallet, "donations").unwrap();
        assert_eq!(by_label, vec![(address, "receive")]);
    }
}
