//! The entity store: in-process relational tables with concurrent readers,
//! serialized writers, and staged write transactions.
//!
//! # Persistence
//!
//! The store uses a write-back model. Mutations are:
//!
//! 1) Staged inside a [`WriteTxn`] (a full working copy of the tables),
//! 2) Swapped into place atomically on [`WriteTxn::commit`], then
//! 3) Re-persisted as a JSON snapshot by the persister task whenever it
//!    receives a notification.
//!
//! Dropping an uncommitted [`WriteTxn`] rolls everything back. Snapshot
//! tables are named `spectrum_<Entity>`; the snapshot is replaced with a
//! tempfile + atomic rename so a crash can't leave a torn file.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use spectrum_common::{
    amount::Amount, notify, shutdown::ShutdownChannel, task::SpTask,
};
use tracing::{debug, info, warn};

use crate::models::{Descriptor, Script, Tx, Utxo, Wallet};

const SNAPSHOT_FILENAME: &str = "spectrum.json";

/// Errors surfaced by the store. The caller rolls back the enclosing
/// transaction by dropping it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Wallet already exists")]
    WalletExists,
    #[error("{entity} not found: {key}")]
    NotFound {
        entity: &'static str,
        key: String,
    },
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn not_found(entity: &'static str, id: i64) -> StoreError {
    StoreError::NotFound {
        entity,
        key: id.to_string(),
    }
}

/// The full table set. Cheap enough to clone per write transaction.
#[derive(Clone, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(rename = "spectrum_Wallet")]
    wallets: BTreeMap<i64, Wallet>,
    #[serde(rename = "spectrum_Descriptor")]
    descriptors: BTreeMap<i64, Descriptor>,
    #[serde(rename = "spectrum_Script")]
    scripts: BTreeMap<i64, Script>,
    #[serde(rename = "spectrum_Utxo")]
    utxos: BTreeMap<i64, Utxo>,
    #[serde(rename = "spectrum_Tx")]
    txs: BTreeMap<i64, Tx>,
    next_id: i64,
}

impl Tables {
    fn fresh_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// The store handle. Concurrent readers, serialized writers.
pub struct Db {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
    persist_tx: notify::Sender,
    persist_rx: Mutex<Option<notify::Receiver>>,
}

impl Db {
    /// Open (or create) the store under `datadir`.
    pub fn open(datadir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(datadir)?;
        let path = datadir.join(SNAPSHOT_FILENAME);
        let tables = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            Tables::default()
        };
        info!(
            "Opened store at {} ({} wallets, {} scripts)",
            path.display(),
            tables.wallets.len(),
            tables.scripts.len(),
        );
        Ok(Self::new(tables, Some(path)))
    }

    /// An ephemeral store with no snapshot file.
    pub fn in_memory() -> Self {
        Self::new(Tables::default(), None)
    }

    fn new(tables: Tables, snapshot_path: Option<PathBuf>) -> Self {
        let (persist_tx, persist_rx) = notify::channel();
        Self {
            tables: RwLock::new(tables),
            snapshot_path,
            persist_tx,
            persist_rx: Mutex::new(Some(persist_rx)),
        }
    }

    /// Spawn the persister task: waits for commit notifications (coalesced)
    /// and rewrites the snapshot; writes one final snapshot on shutdown.
    pub fn spawn_persister(
        self: &Arc<Self>,
        shutdown: ShutdownChannel,
    ) -> SpTask<()> {
        let db = self.clone();
        let mut rx = db
            .persist_rx
            .lock()
            .expect("poisoned")
            .take()
            .expect("persister already spawned");
        SpTask::spawn("store-persister", async move {
            loop {
                tokio::select! {
                    () = rx.recv() => {
                        if let Err(e) = db.write_snapshot() {
                            warn!("Failed to persist store snapshot: {e:#}");
                        }
                    }
                    () = shutdown.recv() => break,
                }
            }
            if let Err(e) = db.write_snapshot() {
                warn!("Failed to persist final store snapshot: {e:#}");
            }
            debug!("Store persister exiting");
        })
    }

    /// Serialize the tables and atomically replace the snapshot file.
    /// A no-op for in-memory stores.
    pub fn write_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = {
            let tables = self.tables.read().expect("poisoned");
            serde_json::to_vec_pretty(&*tables)?
        };
        let dir = path.parent().expect("snapshot path has a parent");
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&json)?;
        file.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Begin a write transaction. Takes the writer lock for its lifetime;
    /// drop without committing to roll back.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        let guard = self.tables.write().expect("poisoned");
        let staged = guard.clone();
        WriteTxn {
            guard,
            staged,
            persist_tx: &self.persist_tx,
        }
    }

    // --- Read queries --- //

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read().expect("poisoned"))
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.read(|t| t.wallets.values().cloned().collect())
    }

    pub fn wallet(&self, id: i64) -> Option<Wallet> {
        self.read(|t| t.wallets.get(&id).cloned())
    }

    pub fn wallet_by_name(&self, name: &str) -> Option<Wallet> {
        self.read(|t| {
            t.wallets.values().find(|w| w.name == name).cloned()
        })
    }

    pub fn descriptor(&self, id: i64) -> Option<Descriptor> {
        self.read(|t| t.descriptors.get(&id).cloned())
    }

    pub fn descriptors_by_wallet(&self, wallet_id: i64) -> Vec<Descriptor> {
        self.read(|t| {
            t.descriptors
                .values()
                .filter(|d| d.wallet_id == wallet_id)
                .cloned()
                .collect()
        })
    }

    /// The descriptor new receive (or change) addresses come from.
    pub fn active_descriptor(
        &self,
        wallet_id: i64,
        internal: bool,
    ) -> Option<Descriptor> {
        self.read(|t| {
            t.descriptors
                .values()
                .find(|d| {
                    d.wallet_id == wallet_id
                        && d.internal == internal
                        && d.active
                })
                .cloned()
        })
    }

    pub fn script(&self, id: i64) -> Option<Script> {
        self.read(|t| t.scripts.get(&id).cloned())
    }

    pub fn scripts_by_scripthash(&self, scripthash: &str) -> Vec<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .filter(|s| s.scripthash == scripthash)
                .cloned()
                .collect()
        })
    }

    pub fn scripts_by_descriptor(&self, descriptor_id: i64) -> Vec<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .filter(|s| s.descriptor_id == Some(descriptor_id))
                .cloned()
                .collect()
        })
    }

    pub fn script_by_descriptor_index(
        &self,
        descriptor_id: i64,
        index: u32,
    ) -> Option<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .find(|s| {
                    s.descriptor_id == Some(descriptor_id)
                        && s.index == Some(index)
                })
                .cloned()
        })
    }

    /// All scripts belonging to a descriptor pool (non-null index), across
    /// every wallet; the full-sync iteration set.
    pub fn pool_scripts(&self) -> Vec<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .filter(|s| s.index.is_some())
                .cloned()
                .collect()
        })
    }

    pub fn scripts_by_wallet(&self, wallet_id: i64) -> Vec<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .filter(|s| s.wallet_id == wallet_id)
                .cloned()
                .collect()
        })
    }

    /// Find a wallet's script row by its hex script-pubkey.
    pub fn script_by_spk(
        &self,
        wallet_id: i64,
        spk_hex: &str,
    ) -> Option<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .find(|s| s.wallet_id == wallet_id && s.script == spk_hex)
                .cloned()
        })
    }

    pub fn utxos_by_wallet(&self, wallet_id: i64) -> Vec<Utxo> {
        self.read(|t| {
            t.utxos
                .values()
                .filter(|u| u.wallet_id == wallet_id)
                .cloned()
                .collect()
        })
    }

    pub fn utxos_by_script(&self, script_id: i64) -> Vec<Utxo> {
        self.read(|t| {
            t.utxos
                .values()
                .filter(|u| u.script_id == script_id)
                .cloned()
                .collect()
        })
    }

    pub fn utxo_by_outpoint(
        &self,
        wallet_id: i64,
        txid: &str,
        vout: u32,
    ) -> Option<Utxo> {
        self.read(|t| {
            t.utxos
                .values()
                .find(|u| {
                    u.wallet_id == wallet_id
                        && u.txid == txid
                        && u.vout == vout
                })
                .cloned()
        })
    }

    pub fn locked_utxos(&self, wallet_id: i64) -> Vec<Utxo> {
        self.read(|t| {
            t.utxos
                .values()
                .filter(|u| u.wallet_id == wallet_id && u.locked)
                .cloned()
                .collect()
        })
    }

    pub fn txs_by_wallet(&self, wallet_id: i64) -> Vec<Tx> {
        self.read(|t| {
            t.txs
                .values()
                .filter(|tx| tx.wallet_id == wallet_id)
                .cloned()
                .collect()
        })
    }

    pub fn txs_by_script(&self, script_id: i64) -> Vec<Tx> {
        self.read(|t| {
            t.txs
                .values()
                .filter(|tx| tx.script_id == script_id)
                .cloned()
                .collect()
        })
    }

    /// All rows of one on-chain transaction within a wallet (one per
    /// affected script).
    pub fn txs_by_txid(&self, wallet_id: i64, txid: &str) -> Vec<Tx> {
        self.read(|t| {
            t.txs
                .values()
                .filter(|tx| tx.wallet_id == wallet_id && tx.txid == txid)
                .cloned()
                .collect()
        })
    }

    /// `(confirmed, unconfirmed)` satoshi sums over a wallet's scripts.
    pub fn wallet_balances(&self, wallet_id: i64) -> (Amount, Amount) {
        self.read(|t| {
            let scripts = t
                .scripts
                .values()
                .filter(|s| s.wallet_id == wallet_id);
            let mut confirmed = Amount::ZERO;
            let mut unconfirmed = Amount::ZERO;
            for script in scripts {
                confirmed = confirmed + script.confirmed;
                unconfirmed = unconfirmed + script.unconfirmed;
            }
            (confirmed, unconfirmed)
        })
    }

    /// Number of distinct on-chain transactions affecting a wallet.
    pub fn wallet_tx_count(&self, wallet_id: i64) -> usize {
        self.read(|t| {
            t.txs
                .values()
                .filter(|tx| tx.wallet_id == wallet_id)
                .map(|tx| tx.txid.as_str())
                .collect::<BTreeSet<_>>()
                .len()
        })
    }

    pub fn labels_by_wallet(&self, wallet_id: i64) -> Vec<String> {
        self.read(|t| {
            t.scripts
                .values()
                .filter(|s| s.wallet_id == wallet_id)
                .map(|s| s.label.clone().unwrap_or_default())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        })
    }

    pub fn scripts_by_label(
        &self,
        wallet_id: i64,
        label: &str,
    ) -> Vec<Script> {
        self.read(|t| {
            t.scripts
                .values()
                .filter(|s| {
                    s.wallet_id == wallet_id
                        && s.label.as_deref() == Some(label)
                })
                .cloned()
                .collect()
        })
    }
}

/// A staged write transaction. Mutations apply to a working copy of the
/// tables and become visible only on [`commit`](Self::commit).
pub struct WriteTxn<'a> {
    guard: RwLockWriteGuard<'a, Tables>,
    staged: Tables,
    persist_tx: &'a notify::Sender,
}

impl WriteTxn<'_> {
    /// Atomically publish the staged tables and nudge the persister.
    pub fn commit(mut self) {
        *self.guard = self.staged;
        self.persist_tx.send();
    }

    // --- Reads against the staged state --- //

    pub fn script(&self, id: i64) -> Option<Script> {
        self.staged.scripts.get(&id).cloned()
    }

    pub fn txs_by_script(&self, script_id: i64) -> Vec<Tx> {
        self.staged
            .txs
            .values()
            .filter(|tx| tx.script_id == script_id)
            .cloned()
            .collect()
    }

    pub fn utxos_by_script(&self, script_id: i64) -> Vec<Utxo> {
        self.staged
            .utxos
            .values()
            .filter(|u| u.script_id == script_id)
            .cloned()
            .collect()
    }

    // --- Mutations --- //

    /// Insert a wallet, enforcing name uniqueness.
    pub fn create_wallet(
        &mut self,
        name: &str,
        private_keys_enabled: bool,
    ) -> Result<Wallet, StoreError> {
        if self.staged.wallets.values().any(|w| w.name == name) {
            return Err(StoreError::WalletExists);
        }
        let id = self.staged.fresh_id();
        let wallet = Wallet {
            id,
            name: name.to_owned(),
            private_keys_enabled,
            seed: None,
            password_salt: None,
        };
        self.staged.wallets.insert(id, wallet.clone());
        Ok(wallet)
    }

    pub fn update_wallet(&mut self, wallet: Wallet) -> Result<(), StoreError> {
        let entry = self
            .staged
            .wallets
            .get_mut(&wallet.id)
            .ok_or_else(|| not_found("Wallet", wallet.id))?;
        *entry = wallet;
        Ok(())
    }

    /// Insert a descriptor, assigning its id. Deactivation of any previous
    /// active descriptor is the caller's concern, see
    /// [`deactivate_descriptors`](Self::deactivate_descriptors).
    pub fn insert_descriptor(&mut self, mut descriptor: Descriptor) -> Descriptor {
        descriptor.id = self.staged.fresh_id();
        self.staged
            .descriptors
            .insert(descriptor.id, descriptor.clone());
        descriptor
    }

    /// Clear the active flag on every `(wallet, internal)` descriptor.
    pub fn deactivate_descriptors(&mut self, wallet_id: i64, internal: bool) {
        for descriptor in self.staged.descriptors.values_mut() {
            if descriptor.wallet_id == wallet_id
                && descriptor.internal == internal
                && descriptor.active
            {
                descriptor.active = false;
            }
        }
    }

    pub fn set_next_index(
        &mut self,
        descriptor_id: i64,
        next_index: u32,
    ) -> Result<(), StoreError> {
        let descriptor = self
            .staged
            .descriptors
            .get_mut(&descriptor_id)
            .ok_or_else(|| not_found("Descriptor", descriptor_id))?;
        descriptor.next_index = next_index;
        Ok(())
    }

    pub fn insert_script(&mut self, mut script: Script) -> Script {
        script.id = self.staged.fresh_id();
        self.staged.scripts.insert(script.id, script.clone());
        script
    }

    pub fn update_script(&mut self, script: Script) -> Result<(), StoreError> {
        let entry = self
            .staged
            .scripts
            .get_mut(&script.id)
            .ok_or_else(|| not_found("Script", script.id))?;
        *entry = script;
        Ok(())
    }

    pub fn insert_utxo(&mut self, mut utxo: Utxo) -> Utxo {
        utxo.id = self.staged.fresh_id();
        self.staged.utxos.insert(utxo.id, utxo.clone());
        utxo
    }

    pub fn update_utxo(&mut self, utxo: Utxo) -> Result<(), StoreError> {
        let entry = self
            .staged
            .utxos
            .get_mut(&utxo.id)
            .ok_or_else(|| not_found("UTXO", utxo.id))?;
        *entry = utxo;
        Ok(())
    }

    pub fn delete_utxo(&mut self, id: i64) {
        self.staged.utxos.remove(&id);
    }

    pub fn set_utxo_locked(
        &mut self,
        id: i64,
        locked: bool,
    ) -> Result<(), StoreError> {
        let utxo = self
            .staged
            .utxos
            .get_mut(&id)
            .ok_or_else(|| not_found("UTXO", id))?;
        utxo.locked = locked;
        Ok(())
    }

    pub fn insert_tx(&mut self, mut tx: Tx) -> Tx {
        tx.id = self.staged.fresh_id();
        self.staged.txs.insert(tx.id, tx.clone());
        tx
    }

    pub fn update_tx(&mut self, tx: Tx) -> Result<(), StoreError> {
        let entry = self
            .staged
            .txs
            .get_mut(&tx.id)
            .ok_or_else(|| not_found("Tx", tx.id))?;
        *entry = tx;
        Ok(())
    }

    pub fn delete_tx(&mut self, id: i64) {
        self.staged.txs.remove(&id);
    }

    pub fn set_script_label(
        &mut self,
        script_id: i64,
        label: Option<String>,
    ) -> Result<(), StoreError> {
        let script = self
            .staged
            .scripts
            .get_mut(&script_id)
            .ok_or_else(|| not_found("Script", script_id))?;
        script.label = label;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use spectrum_common::amount::Amount;

    use super::*;
    use crate::models::TxCategory;

    fn wallet_fixture(db: &Db) -> Wallet {
        let mut txn = db.begin_write();
        let wallet = txn.create_wallet("w", true).unwrap();
        txn.commit();
        wallet
    }

    fn script_fixture(wallet_id: i64, descriptor_id: i64, i: u32) -> Script {
        Script {
            id: 0,
            wallet_id,
            descriptor_id: Some(descriptor_id),
            index: Some(i),
            script: format!("0014{i:040x}"),
            scripthash: format!("{i:064x}"),
            state: None,
            confirmed: Amount::ZERO,
            unconfirmed: Amount::ZERO,
            label: None,
        }
    }

    #[test]
    fn wallet_name_is_unique() {
        let db = Db::in_memory();
        wallet_fixture(&db);

        let mut txn = db.begin_write();
        let err = txn.create_wallet("w", false).unwrap_err();
        assert!(matches!(err, StoreError::WalletExists));
        // A different name is fine.
        txn.create_wallet("w2", false).unwrap();
        txn.commit();
        assert_eq!(db.wallets().len(), 2);
    }

    #[test]
    fn dropping_txn_rolls_back() {
        let db = Db::in_memory();
        {
            let mut txn = db.begin_write();
            txn.create_wallet("gone", true).unwrap();
            // No commit.
        }
        assert!(db.wallet_by_name("gone").is_none());
    }

    #[test]
    fn active_descriptor_per_wallet_internal_pair() {
        let db = Db::in_memory();
        let wallet = wallet_fixture(&db);

        let descriptor = |active| Descriptor {
            id: 0,
            wallet_id: wallet.id,
            active,
            internal: false,
            descriptor: "wpkh(xpub.../0/*)".to_owned(),
            private_descriptor: None,
            next_index: 0,
        };

        let mut txn = db.begin_write();
        let first = txn.insert_descriptor(descriptor(true));
        txn.commit();
        assert_eq!(
            db.active_descriptor(wallet.id, false).unwrap().id,
            first.id
        );

        // Importing a new active descriptor deactivates the previous.
        let mut txn = db.begin_write();
        txn.deactivate_descriptors(wallet.id, false);
        let second = txn.insert_descriptor(descriptor(true));
        txn.commit();

        assert_eq!(
            db.active_descriptor(wallet.id, false).unwrap().id,
            second.id
        );
        let actives = db
            .descriptors_by_wallet(wallet.id)
            .into_iter()
            .filter(|d| d.active && !d.internal)
            .count();
        assert_eq!(actives, 1);
    }

    #[test]
    fn balances_aggregate_over_scripts() {
        let db = Db::in_memory();
        let wallet = wallet_fixture(&db);

        let mut txn = db.begin_write();
        let mut s0 = script_fixture(wallet.id, 1, 0);
        s0.confirmed = Amount::from_sats(50_000);
        let mut s1 = script_fixture(wallet.id, 1, 1);
        s1.unconfirmed = Amount::from_sats(7_000);
        txn.insert_script(s0);
        txn.insert_script(s1);
        txn.commit();

        let (confirmed, unconfirmed) = db.wallet_balances(wallet.id);
        assert_eq!(confirmed, Amount::from_sats(50_000));
        assert_eq!(unconfirmed, Amount::from_sats(7_000));
    }

    #[test]
    fn tx_count_is_distinct_by_txid() {
        let db = Db::in_memory();
        let wallet = wallet_fixture(&db);

        let mut txn = db.begin_write();
        let s0 = txn.insert_script(script_fixture(wallet.id, 1, 0));
        let s1 = txn.insert_script(script_fixture(wallet.id, 1, 1));
        // The same on-chain tx affecting two scripts: two rows, one tx.
        for script in [&s0, &s1] {
            txn.insert_tx(Tx {
                id: 0,
                wallet_id: wallet.id,
                script_id: script.id,
                txid: "aa".repeat(32),
                blockhash: None,
                height: None,
                blocktime: None,
                replaceable: false,
                category: TxCategory::Receive,
                vout: 0,
                amount: Amount::from_sats(1000),
                fee: None,
            });
        }
        txn.commit();

        assert_eq!(db.txs_by_wallet(wallet.id).len(), 2);
        assert_eq!(db.wallet_tx_count(wallet.id), 1);
    }

    #[test]
    fn snapshot_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path()).unwrap();
        let wallet = wallet_fixture(&db);
        let mut txn = db.begin_write();
        txn.insert_script(script_fixture(wallet.id, 1, 0));
        txn.commit();
        db.write_snapshot().unwrap();

        let reopened = Db::open(dir.path()).unwrap();
        let wallet2 = reopened.wallet_by_name("w").unwrap();
        assert_eq!(wallet2.id, wallet.id);
        assert_eq!(reopened.scripts_by_wallet(wallet2.id).len(), 1);
    }
}
