//! Reconciliation of local script state against the Electrum view.
//!
//! A reconcile makes one script's Tx and UTXO rows, balances, and stored
//! state exactly match what the server reports for its script-hash. All
//! fetches happen up front; the store is then mutated inside a single
//! write transaction, so a transport error mid-reconcile leaves the
//! per-script state untouched.
//!
//! Reconciles for distinct scripts run in parallel; a per-script mutex
//! serializes writes for any one script. At most one full sync runs at a
//! time.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use spectrum_common::{
    amount::Amount, hex, shutdown::ShutdownChannel, task::SpTask,
};
use spectrum_electrum::{
    api::{ElectrumApi, HistoryEntry},
    TransportError,
};
use spectrum_store::{
    db::StoreError, txcache::TxCacheError, Db, Script, Tx, TxCache,
    TxCategory, Utxo,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    chain::ChainState,
    headers::{self, HeaderError, ParsedHeader},
};

/// Log and recompute progress every this many scripts during a sync.
const SYNC_PROGRESS_CHUNK: usize = 100;

/// An inbound sequence below this signals BIP125 replaceability.
const SEQUENCE_FINAL_THRESHOLD: u32 = 0xFFFF_FFFE;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    TxCache(#[from] TxCacheError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("script {0} disappeared mid-reconcile")]
    ScriptGone(i64),
    #[error("raw tx missing for history entry {0}")]
    MissingRawTx(String),
}

impl IndexError {
    fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout))
    }
}

/// A unit of work for the indexer: bring one script up to `state`.
#[derive(Clone, Debug)]
pub struct ReconcileJob {
    pub script_id: i64,
    pub state: Option<String>,
}

pub struct Indexer {
    db: Arc<Db>,
    txcache: Arc<TxCache>,
    electrum: Arc<dyn ElectrumApi>,
    chain: Arc<ChainState>,
    /// At-most-one-full-sync guard.
    sync_in_progress: AtomicBool,
    /// Per-script write serialization.
    script_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Indexer {
    pub fn new(
        db: Arc<Db>,
        txcache: Arc<TxCache>,
        electrum: Arc<dyn ElectrumApi>,
        chain: Arc<ChainState>,
    ) -> Self {
        Self {
            db,
            txcache,
            electrum,
            chain,
            sync_in_progress: AtomicBool::new(false),
            script_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the work-queue consumer. Jobs come from the notification
    /// router; each runs on its own task so distinct scripts reconcile in
    /// parallel.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut job_rx: mpsc::UnboundedReceiver<ReconcileJob>,
        shutdown: ShutdownChannel,
    ) -> SpTask<()> {
        let indexer = self.clone();
        SpTask::spawn("index-worker", async move {
            loop {
                let job = tokio::select! {
                    () = shutdown.recv() => break,
                    job = job_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let indexer = indexer.clone();
                SpTask::spawn("reconcile", async move {
                    let script_id = job.script_id;
                    if let Err(e) =
                        indexer.reconcile(script_id, job.state).await
                    {
                        warn!("Reconcile of script {script_id} failed: {e:#}");
                    }
                })
                .detach();
            }
            debug!("Index worker exiting");
        })
    }

    fn script_lock(&self, script_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.script_locks
            .lock()
            .expect("poisoned")
            .entry(script_id)
            .or_default()
            .clone()
    }

    /// Bring one script's rows and balances up to `new_state`. A no-op
    /// when the stored state already matches.
    pub async fn reconcile(
        &self,
        script_id: i64,
        new_state: Option<String>,
    ) -> Result<(), IndexError> {
        let lock = self.script_lock(script_id);
        let _guard = lock.lock().await;

        let script = self
            .db
            .script(script_id)
            .ok_or(IndexError::ScriptGone(script_id))?;
        if script.state == new_state {
            return Ok(());
        }
        if script.state.is_some() {
            info!(
                "Script {} update: {:?} -> {:?}",
                &script.scripthash[..7],
                script.state,
                new_state,
            );
        }

        let internal = script
            .descriptor_id
            .and_then(|id| self.db.descriptor(id))
            .map(|d| d.internal)
            .unwrap_or(false);

        // Phase 1: fetch everything. {height,tx_hash,tx_pos,value}
        let unspent = self
            .electrum
            .scripthash_listunspent(&script.scripthash)
            .await?;
        // {confirmed,unconfirmed}
        let balance = self
            .electrum
            .scripthash_get_balance(&script.scripthash)
            .await?;
        // {height,tx_hash}
        let history = self
            .electrum
            .scripthash_get_history(&script.scripthash)
            .await?;

        let block_info = self.fetch_block_info(&history).await?;
        let parsed_txs = self.fetch_raw_txs(&history).await?;

        // Phase 2: mutate, in one transaction.
        let mut txn = self.db.begin_write();

        let history_txids: HashSet<&str> =
            history.iter().map(|e| e.tx_hash.as_str()).collect();
        let mut rows_by_txid: BTreeMap<String, Tx> = txn
            .txs_by_script(script.id)
            .into_iter()
            .map(|tx| (tx.txid.clone(), tx))
            .collect();

        // Delete rows for txs that dropped out of the history (reorged or
        // replaced).
        for (txid, row) in &rows_by_txid {
            if !history_txids.contains(txid.as_str()) {
                txn.delete_tx(row.id);
            }
        }

        for entry in &history {
            let height = entry.confirmed_height();
            let info = height.and_then(|h| block_info.get(&h));
            let blockhash = info.map(|i| i.blockhash.clone());
            let blocktime = info.map(|i| i.blocktime);

            match rows_by_txid.remove(&entry.tx_hash) {
                Some(mut row) => {
                    row.height = height;
                    row.blockhash = blockhash;
                    row.blocktime = blocktime;
                    txn.update_tx(row)?;
                }
                None => {
                    let parsed = parsed_txs
                        .get(&entry.tx_hash)
                        .ok_or_else(|| {
                            IndexError::MissingRawTx(entry.tx_hash.clone())
                        })?;
                    let (category, amount, vout) =
                        categorize(parsed, &script.script, internal);
                    let replaceable = parsed.input.iter().any(|input| {
                        input.sequence.0 < SEQUENCE_FINAL_THRESHOLD
                    });
                    txn.insert_tx(Tx {
                        id: 0,
                        wallet_id: script.wallet_id,
                        script_id: script.id,
                        txid: entry.tx_hash.clone(),
                        blockhash,
                        height,
                        blocktime,
                        replaceable,
                        category,
                        vout,
                        amount,
                        fee: entry
                            .fee
                            .map(|f| Amount::from_sats(f as i64)),
                    });
                }
            }
        }

        // UTXO reconciliation: the row set must end up exactly equal to
        // the server's listunspent.
        let mut utxo_rows: BTreeMap<(String, u32), Utxo> = txn
            .utxos_by_script(script.id)
            .into_iter()
            .map(|u| ((u.txid.clone(), u.vout), u))
            .collect();
        let server_outpoints: HashSet<(String, u32)> = unspent
            .iter()
            .map(|u| (u.tx_hash.clone(), u.tx_pos))
            .collect();
        for (outpoint, row) in &utxo_rows {
            if !server_outpoints.contains(outpoint) {
                txn.delete_utxo(row.id);
            }
        }
        for u in &unspent {
            let key = (u.tx_hash.clone(), u.tx_pos);
            match utxo_rows.remove(&key) {
                Some(mut row) => {
                    row.height = u.confirmed_height();
                    row.amount = Amount::from_sats(u.value as i64);
                    txn.update_utxo(row)?;
                }
                None => {
                    txn.insert_utxo(Utxo {
                        id: 0,
                        wallet_id: script.wallet_id,
                        script_id: script.id,
                        txid: u.tx_hash.clone(),
                        vout: u.tx_pos,
                        height: u.confirmed_height(),
                        amount: Amount::from_sats(u.value as i64),
                        locked: false,
                    });
                }
            }
        }

        let mut script = txn
            .script(script.id)
            .ok_or(IndexError::ScriptGone(script.id))?;
        script.state = new_state;
        script.confirmed = Amount::from_sats(balance.confirmed);
        script.unconfirmed = Amount::from_sats(balance.unconfirmed);
        txn.update_script(script)?;

        txn.commit();
        Ok(())
    }

    /// Fetch and parse the block header for every confirmed height in the
    /// history. Mempool entries (height <= 0) are skipped.
    async fn fetch_block_info(
        &self,
        history: &[HistoryEntry],
    ) -> Result<HashMap<u32, ParsedHeader>, IndexError> {
        let mut info = HashMap::new();
        for entry in history {
            let Some(height) = entry.confirmed_height() else {
                continue;
            };
            if info.contains_key(&height) {
                continue;
            }
            let header_hex = self.electrum.block_header(height).await?;
            let parsed = headers::parse_header_hex(&header_hex)?;
            self.chain.cache_blockhash(height, parsed.blockhash.clone());
            info.insert(height, parsed);
        }
        Ok(info)
    }

    /// Ensure the raw tx of every history entry is in the blob cache and
    /// parsed.
    async fn fetch_raw_txs(
        &self,
        history: &[HistoryEntry],
    ) -> Result<HashMap<String, bitcoin::Transaction>, IndexError> {
        let mut parsed = HashMap::new();
        for entry in history {
            let txid = &entry.tx_hash;
            if parsed.contains_key(txid) {
                continue;
            }
            let tx = match self.txcache.get(txid) {
                Ok(tx) => tx,
                Err(TxCacheError::NotCached(_)) => {
                    let raw_hex =
                        self.electrum.transaction_get(txid).await?;
                    self.txcache.insert(txid, &raw_hex)?;
                    spectrum_store::txcache::parse_tx_hex(&raw_hex)
                        .map_err(|message| TxCacheError::Invalid {
                            txid: txid.clone(),
                            message,
                        })?
                }
                Err(e) => return Err(e.into()),
            };
            parsed.insert(txid.clone(), tx);
        }
        Ok(parsed)
    }

    /// Spawn a full sync unless one is already running.
    pub fn spawn_full_sync(self: &Arc<Self>) {
        let indexer = self.clone();
        SpTask::spawn("full-sync", async move {
            indexer.full_sync().await;
        })
        .detach();
    }

    /// Subscribe every pool script and reconcile the stale ones. Invoked
    /// on (re)connect.
    pub async fn full_sync(&self) {
        if self.sync_in_progress.swap(true, Ordering::SeqCst) {
            info!("Sync not starting, already running");
            return;
        }
        let scripts = self.db.pool_scripts();
        info!("Sync starting ({} scripts to subscribe)", scripts.len());
        self.sync_script_set(&scripts).await;
        self.sync_in_progress.store(false, Ordering::SeqCst);
    }

    /// Subscribe and reconcile one descriptor's pool, after an import.
    pub async fn descriptor_sync(&self, descriptor_id: i64) {
        let scripts = self.db.scripts_by_descriptor(descriptor_id);
        info!(
            "Syncing descriptor {descriptor_id} ({} scripts)",
            scripts.len(),
        );
        self.sync_script_set(&scripts).await;
    }

    pub fn spawn_descriptor_sync(self: &Arc<Self>, descriptor_id: i64) {
        let indexer = self.clone();
        SpTask::spawn("descriptor-sync", async move {
            indexer.descriptor_sync(descriptor_id).await;
        })
        .detach();
    }

    /// Subscribe and reconcile a handful of freshly pooled scripts, e.g.
    /// after a pool refill.
    pub fn spawn_scripts_sync(self: &Arc<Self>, script_ids: Vec<i64>) {
        let indexer = self.clone();
        SpTask::spawn("scripts-sync", async move {
            let scripts: Vec<Script> = script_ids
                .into_iter()
                .filter_map(|id| indexer.db.script(id))
                .collect();
            indexer.sync_script_set(&scripts).await;
        })
        .detach();
    }

    async fn sync_script_set(&self, scripts: &[Script]) {
        let total = scripts.len();
        let started = Instant::now();
        let mut subscribed = 0usize;

        for script in scripts {
            // Label-only external scripts are not subscribed.
            if script.index.is_none() {
                continue;
            }
            let state = match self
                .electrum
                .scripthash_subscribe(&script.scripthash)
                .await
            {
                Ok(state) => state,
                Err(TransportError::Timeout) => {
                    // Abort the sync; per-script state stays consistent
                    // and the next reconnect retries.
                    error!("Sync aborted by a call timeout");
                    self.chain.set_sync_progress(0, 0.0);
                    return;
                }
                Err(e) => {
                    error!("Sync aborted: {e:#}");
                    self.chain.set_sync_progress(0, 0.0);
                    return;
                }
            };
            subscribed += 1;

            if state != script.state {
                match self.reconcile(script.id, state).await {
                    Ok(()) => (),
                    Err(e) if e.is_timeout() => {
                        error!("Sync aborted by a call timeout");
                        self.chain.set_sync_progress(0, 0.0);
                        return;
                    }
                    Err(e) => warn!(
                        "Reconcile of script {} failed: {e:#}",
                        script.id
                    ),
                }
            }

            if subscribed % SYNC_PROGRESS_CHUNK == 0 {
                let percent =
                    ((subscribed as f64 / total as f64) * 100.0) as u8;
                let rate =
                    subscribed as f64 / started.elapsed().as_secs_f64();
                self.chain.set_sync_progress(percent, rate);
                info!(
                    "Now subscribed to {subscribed}/{total} scripthashes \
                     ({percent}%, {rate:.1} scripts/s)"
                );
            }
        }

        let elapsed = started.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            subscribed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        self.chain.set_sync_progress(100, rate);
        info!(
            "Finished syncing {subscribed} scripts in {}s",
            elapsed.as_secs(),
        );
    }
}

/// Category, signed amount and affected vout of a transaction as seen
/// from one script.
fn categorize(
    tx: &bitcoin::Transaction,
    script_spk_hex: &str,
    internal: bool,
) -> (TxCategory, Amount, u32) {
    let matching_vout = tx.output.iter().position(|out| {
        hex::encode(out.script_pubkey.as_bytes()) == script_spk_hex
    });
    match matching_vout {
        // Not a payment to this script: value left the wallet.
        None => {
            let total: i64 = tx
                .output
                .iter()
                .map(|out| out.value.to_sat() as i64)
                .sum();
            (TxCategory::Send, Amount::from_sats(-total), 0)
        }
        Some(vout) => {
            let amount = Amount::from_sats(
                tx.output[vout].value.to_sat() as i64,
            );
            let category = if internal {
                // Receive to change stays out of transaction listings.
                TxCategory::Change
            } else {
                TxCategory::Receive
            };
            (category, amount, vout as u32)
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use spectrum_electrum::test_utils::ScriptedElectrum;
    use spectrum_store::{electrum_scripthash, Descriptor};

    use super::*;
    use crate::headers::GENESIS_HEADER_MAIN;

    /// 1-in/1-out tx paying 50 000 sat to the all-zero P2WPKH script.
    const RAW_TX: &str = "010000000100000000000000000000000000000000000000000000000000000000000000000000000000ffffffff0150c3000000000000160014000000000000000000000000000000000000000000000000";
    const SPK_HEX: &str = "00140000000000000000000000000000000000000000";

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        electrum: Arc<ScriptedElectrum>,
        indexer: Indexer,
        script: Script,
    }

    fn fixture(spk_hex: &str, internal: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::in_memory());
        let txcache = Arc::new(TxCache::open(dir.path()).unwrap());
        let electrum = ScriptedElectrum::new();
        let chain = Arc::new(ChainState::new());
        let indexer = Indexer::new(
            db.clone(),
            txcache,
            electrum.clone(),
            chain,
        );

        let mut txn = db.begin_write();
        let wallet = txn.create_wallet("w", true).unwrap();
        let descriptor = txn.insert_descriptor(Descriptor {
            id: 0,
            wallet_id: wallet.id,
            active: true,
            internal,
            descriptor: "wpkh(tpub.../0/*)".to_owned(),
            private_descriptor: None,
            next_index: 0,
        });
        let script = txn.insert_script(Script {
            id: 0,
            wallet_id: wallet.id,
            descriptor_id: Some(descriptor.id),
            index: Some(0),
            script: spk_hex.to_owned(),
            scripthash: electrum_scripthash(
                &hex::decode(spk_hex).unwrap(),
            ),
            state: None,
            confirmed: Amount::ZERO,
            unconfirmed: Amount::ZERO,
            label: None,
        });
        txn.commit();

        Fixture {
            _dir: dir,
            db,
            electrum,
            indexer,
            script,
        }
    }

    fn program_receive(fx: &Fixture, txid: &str) {
        let sh = &fx.script.scripthash;
        fx.electrum.set(
            "blockchain.scripthash.listunspent",
            sh,
            json!([{"height": 100, "tx_hash": txid, "tx_pos": 0, "value": 50_000}]),
        );
        fx.electrum.set(
            "blockchain.scripthash.get_balance",
            sh,
            json!({"confirmed": 50_000, "unconfirmed": 0}),
        );
        fx.electrum.set(
            "blockchain.scripthash.get_history",
            sh,
            json!([{"height": 100, "tx_hash": txid}]),
        );
        fx.electrum.set(
            "blockchain.block.header",
            100,
            json!(GENESIS_HEADER_MAIN),
        );
        fx.electrum
            .set("blockchain.transaction.get", txid, json!(RAW_TX));
    }

    #[tokio::test]
    async fn receive_reconcile_populates_rows() {
        let fx = fixture(SPK_HEX, false);
        let txid = "ab".repeat(32);
        program_receive(&fx, &txid);

        fx.indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap();

        let txs = fx.db.txs_by_script(fx.script.id);
        assert_eq!(txs.len(), 1);
        let tx = &txs[0];
        assert_eq!(tx.category, TxCategory::Receive);
        assert_eq!(tx.amount, Amount::from_sats(50_000));
        assert_eq!(tx.vout, 0);
        assert_eq!(tx.height, Some(100));
        assert_eq!(
            tx.blockhash.as_deref(),
            Some(spectrum_common::chain::GENESIS_MAIN),
        );
        assert_eq!(tx.blocktime, Some(1231006505));
        assert!(!tx.replaceable); // sequence is final

        let utxos = fx.db.utxos_by_script(fx.script.id);
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].amount, Amount::from_sats(50_000));
        assert_eq!(utxos[0].height, Some(100));
        assert_eq!(utxos[0].vout, 0);

        let script = fx.db.script(fx.script.id).unwrap();
        assert_eq!(script.state.as_deref(), Some("state1"));
        assert_eq!(script.confirmed, Amount::from_sats(50_000));
        assert_eq!(script.unconfirmed, Amount::ZERO);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_on_state() {
        let fx = fixture(SPK_HEX, false);
        let txid = "ab".repeat(32);
        program_receive(&fx, &txid);

        fx.indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap();
        // Same state again: no fetches needed, still one row of each.
        fx.indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap();
        assert_eq!(fx.db.txs_by_script(fx.script.id).len(), 1);
        assert_eq!(fx.db.utxos_by_script(fx.script.id).len(), 1);
    }

    #[tokio::test]
    async fn stale_rows_are_deleted() {
        let fx = fixture(SPK_HEX, false);
        let txid = "ab".repeat(32);
        program_receive(&fx, &txid);
        fx.indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap();

        // The tx vanishes from the server's view (reorg/replacement).
        let sh = &fx.script.scripthash;
        fx.electrum
            .set("blockchain.scripthash.listunspent", sh, json!([]));
        fx.electrum.set(
            "blockchain.scripthash.get_balance",
            sh,
            json!({"confirmed": 0, "unconfirmed": 0}),
        );
        fx.electrum
            .set("blockchain.scripthash.get_history", sh, json!([]));

        fx.indexer
            .reconcile(fx.script.id, Some("state2".to_owned()))
            .await
            .unwrap();

        assert!(fx.db.txs_by_script(fx.script.id).is_empty());
        assert!(fx.db.utxos_by_script(fx.script.id).is_empty());
        let script = fx.db.script(fx.script.id).unwrap();
        assert_eq!(script.state.as_deref(), Some("state2"));
        assert_eq!(script.confirmed, Amount::ZERO);
    }

    #[tokio::test]
    async fn foreign_outputs_categorize_as_send() {
        // The watched script does not appear among the tx outputs.
        let other_spk = "0014ffffffffffffffffffffffffffffffffffffffff";
        let fx = fixture(other_spk, false);
        let txid = "cd".repeat(32);

        let sh = &fx.script.scripthash;
        fx.electrum
            .set("blockchain.scripthash.listunspent", sh, json!([]));
        fx.electrum.set(
            "blockchain.scripthash.get_balance",
            sh,
            json!({"confirmed": 0, "unconfirmed": 0}),
        );
        fx.electrum.set(
            "blockchain.scripthash.get_history",
            sh,
            json!([{"height": 100, "tx_hash": txid}]),
        );
        fx.electrum.set(
            "blockchain.block.header",
            100,
            json!(GENESIS_HEADER_MAIN),
        );
        fx.electrum
            .set("blockchain.transaction.get", &txid, json!(RAW_TX));

        fx.indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap();

        let txs = fx.db.txs_by_script(fx.script.id);
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].category, TxCategory::Send);
        assert_eq!(txs[0].amount, Amount::from_sats(-50_000));
        assert_eq!(txs[0].vout, 0);
    }

    #[tokio::test]
    async fn change_script_receives_as_change() {
        let fx = fixture(SPK_HEX, true);
        let txid = "ef".repeat(32);
        program_receive(&fx, &txid);

        fx.indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap();

        let txs = fx.db.txs_by_script(fx.script.id);
        assert_eq!(txs[0].category, TxCategory::Change);
        assert_eq!(txs[0].amount, Amount::from_sats(50_000));
    }

    #[tokio::test]
    async fn transport_timeout_aborts_cleanly() {
        let fx = fixture(SPK_HEX, false);
        // Nothing programmed: the first fetch times out.
        let err = fx
            .indexer
            .reconcile(fx.script.id, Some("state1".to_owned()))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // Partial state is untouched.
        let script = fx.db.script(fx.script.id).unwrap();
        assert_eq!(script.state, None);
        assert!(fx.db.txs_by_script(fx.script.id).is_empty());
    }
}
