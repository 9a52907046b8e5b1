//! The PSBT builder: coin selection, fee accounting, change placement,
//! scope enrichment (utxos, redeem/witness scripts, BIP32 derivations),
//! signing and finalization.

use std::str::FromStr;

use bitcoin::{
    absolute::LockTime, consensus, psbt::Psbt, transaction::Version,
    Amount as SatAmount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use miniscript::psbt::{PsbtExt, PsbtInputExt, PsbtOutputExt};
use rand_core::RngCore;
use rust_decimal::Decimal;
use serde::Deserialize;
use spectrum_common::{amount::Amount, hex};
use spectrum_store::{Script, Utxo, Wallet};
use tracing::debug;

use crate::{
    descriptors::{spk_hex_from_address, ParsedDescriptor},
    service::{WalletError, WalletService},
};

/// BIP125: opt-in replaceability while leaving locktime usable.
const SEQUENCE_RBF: Sequence = Sequence(0xFFFF_FFFD);

/// An explicit input reference, `{txid, vout}`.
#[derive(Clone, Debug, Deserialize)]
pub struct InputRef {
    pub txid: String,
    pub vout: u32,
}

/// `walletcreatefundedpsbt` options, named as Core names them.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PsbtOptions {
    /// Defaults to true when no explicit inputs were given.
    pub add_inputs: Option<bool>,
    pub include_unsafe: bool,
    #[serde(rename = "changeAddress")]
    pub change_address: Option<String>,
    #[serde(rename = "changePosition")]
    pub change_position: Option<usize>,
    #[serde(rename = "lockUnspents")]
    pub lock_unspents: bool,
    /// sat/vB.
    pub fee_rate: Option<f64>,
    /// BTC/kvB.
    #[serde(rename = "feeRate")]
    pub fee_rate_btc_kvb: Option<f64>,
    #[serde(rename = "subtractFeeFromOutputs")]
    pub subtract_fee_from_outputs: Vec<usize>,
    pub conf_target: Option<u32>,
    pub replaceable: bool,
}

#[derive(Clone, Debug)]
pub struct FundedPsbt {
    pub psbt: String,
    pub fee: Amount,
    /// -1 when no change output was added.
    pub changepos: i64,
}

#[derive(Clone, Debug)]
pub struct ProcessedPsbt {
    pub psbt: String,
    pub complete: bool,
}

impl WalletService {
    /// Build a funded PSBT paying `outputs` (address, BTC) pairs.
    pub async fn create_funded_psbt(
        &self,
        wallet: &Wallet,
        inputs: &[InputRef],
        outputs: &[(String, Decimal)],
        locktime: u32,
        options: &PsbtOptions,
    ) -> Result<FundedPsbt, WalletError> {
        let network = self.chain.chain().to_bitcoin();
        // We need to add more inputs if requested, or if none were given.
        let add_inputs = options.add_inputs.unwrap_or(inputs.is_empty());

        let change_address = match &options.change_address {
            Some(address) => address.clone(),
            None => self.peek_change_address(wallet)?,
        };
        let change_spk = ScriptBuf::from_bytes(
            hex::decode(&spk_hex_from_address(&change_address, network)?)
                .expect("just encoded"),
        );

        let fee_rate = self.resolve_fee_rate(options).await?;

        let destinations = outputs
            .iter()
            .map(|(address, btc)| {
                let spk_hex = spk_hex_from_address(address, network)
                    .map_err(|e| WalletError::BadParam(e.to_string()))?;
                let amount = Amount::try_from_btc(*btc).map_err(|e| {
                    WalletError::BadParam(format!("bad amount: {e}"))
                })?;
                Ok(TxOut {
                    value: SatAmount::from_sat(amount.sats() as u64),
                    script_pubkey: ScriptBuf::from_bytes(
                        hex::decode(&spk_hex).expect("just encoded"),
                    ),
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;
        let sum_outs: i64 = destinations
            .iter()
            .map(|out| out.value.to_sat() as i64)
            .sum();

        // Resolve explicit inputs; a missing row means the caller refers
        // to coins we don't have.
        let mut selected = Vec::with_capacity(inputs.len());
        for input in inputs {
            let utxo = self
                .db
                .utxo_by_outpoint(wallet.id, &input.txid, input.vout)
                .ok_or(WalletError::InsufficientFunds)?;
            selected.push(utxo);
        }
        let mut sum_ins: i64 =
            selected.iter().map(|u| u.amount.sats()).sum();

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(locktime),
            input: selected
                .iter()
                .map(make_txin)
                .collect::<Result<_, _>>()?,
            output: destinations,
        };
        let mut size = tx.total_size();

        if add_inputs && underfunded(sum_ins, sum_outs, size, fee_rate) {
            let mut candidates: Vec<Utxo> = self
                .db
                .utxos_by_wallet(wallet.id)
                .into_iter()
                .filter(|u| !u.locked)
                .collect();
            candidates.sort_by(|a, b| b.amount.cmp(&a.amount));
            for utxo in candidates {
                if !options.include_unsafe && utxo.height.is_none() {
                    continue;
                }
                if selected
                    .iter()
                    .any(|u| u.txid == utxo.txid && u.vout == utxo.vout)
                {
                    continue;
                }
                let txin = make_txin(&utxo)?;
                size += consensus::serialize(&txin).len();
                sum_ins += utxo.amount.sats();
                tx.input.push(txin);
                selected.push(utxo);
                if !underfunded(sum_ins, sum_outs, size, fee_rate) {
                    break;
                }
            }
        }

        if sum_ins < sum_outs {
            return Err(WalletError::InsufficientFunds);
        }
        if options.subtract_fee_from_outputs.is_empty()
            && underfunded(sum_ins, sum_outs, size, fee_rate)
        {
            return Err(WalletError::InsufficientFunds);
        }

        // Add a change output if its post-fee value stays positive.
        let change_out = TxOut {
            value: SatAmount::ZERO,
            script_pubkey: change_spk.clone(),
        };
        let change_size = consensus::serialize(&change_out).len();
        let change_value = sum_ins as f64
            - sum_outs as f64
            - ((size + change_size) as f64) * fee_rate;
        let mut changepos: i64 = -1;
        if change_value > 0.0 {
            let pos = match options.change_position {
                Some(pos) => pos.min(tx.output.len()),
                None => {
                    let r = self.rng.lock().expect("poisoned").next_u32();
                    r as usize % (tx.output.len() + 1)
                }
            };
            tx.output.insert(
                pos,
                TxOut {
                    value: SatAmount::from_sat((sum_ins - sum_outs) as u64),
                    script_pubkey: change_spk.clone(),
                },
            );
            changepos = pos as i64;
        }

        let fee = (tx.total_size() as f64 * fee_rate).ceil() as i64;

        // The fee comes out of the change, or proportionally out of the
        // listed destinations.
        let subtract = &options.subtract_fee_from_outputs;
        if !subtract.is_empty() {
            let share =
                (fee as f64 / subtract.len() as f64).ceil() as i64;
            for &dest_index in subtract {
                // Destination indexes refer to `outputs`; account for an
                // inserted change output.
                let pos = if changepos >= 0
                    && dest_index >= changepos as usize
                {
                    dest_index + 1
                } else {
                    dest_index
                };
                let out = tx.output.get_mut(pos).ok_or_else(|| {
                    WalletError::BadParam(format!(
                        "subtractFeeFromOutputs index {dest_index} out of \
                         range"
                    ))
                })?;
                let value = out.value.to_sat() as i64 - share;
                if value <= 0 {
                    return Err(WalletError::InsufficientFunds);
                }
                out.value = SatAmount::from_sat(value as u64);
            }
        } else if changepos >= 0 {
            let out = &mut tx.output[changepos as usize];
            let value = out.value.to_sat() as i64 - fee;
            if value < 0 {
                return Err(WalletError::InsufficientFunds);
            }
            out.value = SatAmount::from_sat(value as u64);
        }

        if options.replaceable {
            for input in &mut tx.input {
                input.sequence = SEQUENCE_RBF;
            }
        }

        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| WalletError::Psbt(e.to_string()))?;
        for (i, utxo) in selected.iter().enumerate() {
            let script_row =
                self.db.script(utxo.script_id).ok_or_else(|| {
                    WalletError::BadParam(format!(
                        "utxo {}:{} has no script row",
                        utxo.txid, utxo.vout
                    ))
                })?;
            self.fill_input_scope(&mut psbt, i, &script_row, true)?;
        }
        if changepos >= 0 {
            let change_hex = hex::encode(change_spk.as_bytes());
            if let Some(script_row) =
                self.db.script_by_spk(wallet.id, &change_hex)
            {
                self.fill_output_scope(
                    &mut psbt,
                    changepos as usize,
                    &script_row,
                )?;
            }
        }

        if options.lock_unspents {
            let mut txn = self.db.begin_write();
            for utxo in &selected {
                txn.set_utxo_locked(utxo.id, true)?;
            }
            txn.commit();
        }

        debug!(
            "Funded psbt: {} ins, {} outs, fee {fee} sat, changepos \
             {changepos}",
            selected.len(),
            psbt.unsigned_tx.output.len(),
        );
        Ok(FundedPsbt {
            psbt: psbt.to_string(),
            fee: Amount::from_sats(fee),
            changepos,
        })
    }

    /// sat/vB from the options, falling back to the server's estimate
    /// (floored at 1 sat/vB).
    async fn resolve_fee_rate(
        &self,
        options: &PsbtOptions,
    ) -> Result<f64, WalletError> {
        if let Some(rate) = options.fee_rate {
            if rate > 0.0 {
                return Ok(rate);
            }
        }
        if let Some(rate) = options.fee_rate_btc_kvb {
            if rate > 0.0 {
                return Ok(rate * 1e5);
            }
        }
        let conf_target = options.conf_target.unwrap_or(6);
        let estimate = self.electrum.estimate_fee(conf_target).await?;
        let rate = estimate * 1e5;
        Ok(if rate < 1.0 { 1.0 } else { rate })
    }

    /// Enrich inputs/outputs we recognize and optionally sign, then try to
    /// finalize.
    pub fn process_psbt(
        &self,
        wallet: &Wallet,
        psbt_str: &str,
        sign: bool,
    ) -> Result<ProcessedPsbt, WalletError> {
        let mut psbt = Psbt::from_str(psbt_str.trim())
            .map_err(|e| WalletError::Psbt(e.to_string()))?;

        for i in 0..psbt.inputs.len() {
            let prev = psbt.unsigned_tx.input[i].previous_output;
            let Ok(prev_tx) = self.txcache.get(&prev.txid.to_string())
            else {
                continue;
            };
            let spk_hex = prev_tx
                .output
                .get(prev.vout as usize)
                .map(|out| hex::encode(out.script_pubkey.as_bytes()));
            self.attach_utxo(&mut psbt, i, prev_tx);
            let Some(spk_hex) = spk_hex else { continue };
            let row = self
                .db
                .script_by_spk(wallet.id, &spk_hex)
                .filter(|s| s.index.is_some());
            if let Some(script_row) = row {
                self.fill_input_scope(&mut psbt, i, &script_row, false)?;
            }
        }

        for o in 0..psbt.outputs.len() {
            let spk_hex = hex::encode(
                psbt.unsigned_tx.output[o].script_pubkey.as_bytes(),
            );
            let row = self
                .db
                .script_by_spk(wallet.id, &spk_hex)
                .filter(|s| s.index.is_some());
            if let Some(script_row) = row {
                self.fill_output_scope(&mut psbt, o, &script_row)?;
            }
        }

        if sign && wallet.private_keys_enabled {
            for descriptor in self.db.descriptors_by_wallet(wallet.id) {
                let Some(private) = descriptor.private_descriptor else {
                    continue;
                };
                let parsed =
                    ParsedDescriptor::parse(&self.secp, &private)?;
                for xprv in parsed.signing_keys() {
                    // Partial signing failures are fine; other
                    // descriptors may cover the remaining inputs.
                    let _ = psbt.sign(&xprv, &self.secp);
                }
            }
        }

        // Report completeness without finalizing the returned psbt.
        let complete = {
            let mut trial = psbt.clone();
            trial.finalize_mut(&self.secp).is_ok()
        };
        Ok(ProcessedPsbt {
            psbt: psbt.to_string(),
            complete,
        })
    }

    /// Attach non-witness-utxo (witnesses stripped) and, for segwit
    /// spends, witness-utxo.
    fn attach_utxo(
        &self,
        psbt: &mut Psbt,
        index: usize,
        mut prev_tx: Transaction,
    ) {
        let prev = psbt.unsigned_tx.input[index].previous_output;
        let is_segwit = prev_tx
            .input
            .iter()
            .any(|input| !input.witness.is_empty());
        for input in &mut prev_tx.input {
            input.witness = Witness::default();
        }
        let txout = prev_tx.output.get(prev.vout as usize).cloned();
        psbt.inputs[index].non_witness_utxo = Some(prev_tx);
        if is_segwit {
            if let Some(txout) = txout {
                psbt.inputs[index].witness_utxo = Some(txout);
            }
        }
    }

    fn fill_input_scope(
        &self,
        psbt: &mut Psbt,
        index: usize,
        script_row: &Script,
        add_utxo: bool,
    ) -> Result<(), WalletError> {
        if add_utxo {
            let prev = psbt.unsigned_tx.input[index].previous_output;
            if let Ok(prev_tx) = self.txcache.get(&prev.txid.to_string()) {
                self.attach_utxo(psbt, index, prev_tx);
            }
        }
        if let Some(definite) = self.definite_descriptor(script_row)? {
            psbt.inputs[index]
                .update_with_descriptor_unchecked(&definite)
                .map_err(|e| WalletError::Psbt(e.to_string()))?;
        }
        Ok(())
    }

    fn fill_output_scope(
        &self,
        psbt: &mut Psbt,
        index: usize,
        script_row: &Script,
    ) -> Result<(), WalletError> {
        if let Some(definite) = self.definite_descriptor(script_row)? {
            psbt.outputs[index]
                .update_with_descriptor_unchecked(&definite)
                .map_err(|e| WalletError::Psbt(e.to_string()))?;
        }
        Ok(())
    }

    /// The definite descriptor behind a pool script, if any.
    fn definite_descriptor(
        &self,
        script_row: &Script,
    ) -> Result<
        Option<
            miniscript::Descriptor<
                miniscript::descriptor::DefiniteDescriptorKey,
            >,
        >,
        WalletError,
    > {
        let (Some(descriptor_id), Some(index)) =
            (script_row.descriptor_id, script_row.index)
        else {
            return Ok(None);
        };
        let Some(descriptor) = self.db.descriptor(descriptor_id) else {
            return Ok(None);
        };
        let parsed =
            ParsedDescriptor::parse(&self.secp, &descriptor.descriptor)?;
        Ok(Some(parsed.at_index(index)?))
    }
}

fn make_txin(utxo: &Utxo) -> Result<TxIn, WalletError> {
    let txid = Txid::from_str(&utxo.txid).map_err(|e| {
        WalletError::BadParam(format!("bad txid {}: {e}", utxo.txid))
    })?;
    Ok(TxIn {
        previous_output: OutPoint {
            txid,
            vout: utxo.vout,
        },
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::default(),
    })
}

fn underfunded(
    sum_ins: i64,
    sum_outs: i64,
    size: usize,
    fee_rate: f64,
) -> bool {
    (sum_ins as f64) < sum_outs as f64 + size as f64 * fee_rate
}

// --- Wallet-free PSBT operations (chain-level RPC surface) --- //

/// Merge the later PSBTs' maps into the first.
pub fn combine_psbts(psbts: &[String]) -> Result<String, WalletError> {
    let mut iter = psbts.iter();
    let first = iter
        .next()
        .ok_or_else(|| {
            WalletError::BadParam("Parameter 'txs' cannot be empty".into())
        })?;
    let mut combined = Psbt::from_str(first.trim())
        .map_err(|e| WalletError::Psbt(e.to_string()))?;
    for other in iter {
        let other = Psbt::from_str(other.trim())
            .map_err(|e| WalletError::Psbt(e.to_string()))?;
        combined
            .combine(other)
            .map_err(|e| WalletError::Psbt(e.to_string()))?;
    }
    Ok(combined.to_string())
}

/// Outcome of `finalizepsbt`.
pub struct FinalizedPsbt {
    /// Network-serialized tx hex when complete and extraction was asked.
    pub hex: Option<String>,
    /// The psbt, when not extracting (or not complete).
    pub psbt: Option<String>,
    pub complete: bool,
}

pub fn finalize_psbt(
    psbt_str: &str,
    extract: bool,
) -> Result<FinalizedPsbt, WalletError> {
    let secp = bitcoin::secp256k1::Secp256k1::new();
    let mut psbt = Psbt::from_str(psbt_str.trim())
        .map_err(|e| WalletError::Psbt(e.to_string()))?;
    match psbt.finalize_mut(&secp) {
        Ok(()) => {
            if extract {
                let tx = psbt
                    .extract_tx()
                    .map_err(|e| WalletError::Psbt(e.to_string()))?;
                Ok(FinalizedPsbt {
                    hex: Some(hex::encode(&consensus::serialize(&tx))),
                    psbt: None,
                    complete: true,
                })
            } else {
                Ok(FinalizedPsbt {
                    hex: None,
                    psbt: Some(psbt.to_string()),
                    complete: true,
                })
            }
        }
        Err(_errors) => Ok(FinalizedPsbt {
            hex: None,
            psbt: Some(psbt.to_string()),
            complete: false,
        }),
    }
}

/// `converttopsbt`: a raw tx becomes an empty PSBT. Signature data is
/// rejected unless `permitsigdata`, in which case it is stripped.
pub fn convert_to_psbt(
    tx_hex: &str,
    permitsigdata: bool,
) -> Result<String, WalletError> {
    let bytes = hex::decode(tx_hex.trim())
        .map_err(|e| WalletError::BadParam(e.to_string()))?;
    let mut tx: Transaction = consensus::deserialize(&bytes)
        .map_err(|e| WalletError::BadParam(e.to_string()))?;
    if permitsigdata {
        for input in &mut tx.input {
            input.script_sig = ScriptBuf::new();
            input.witness = Witness::default();
        }
    }
    if tx.input.iter().any(|input| {
        !input.script_sig.is_empty() || !input.witness.is_empty()
    }) {
        return Err(WalletError::BadParam(
            "Inputs must not have scriptSigs and scriptWitnesses".into(),
        ));
    }
    Psbt::from_unsigned_tx(tx)
        .map(|psbt| psbt.to_string())
        .map_err(|e| WalletError::Psbt(e.to_string()))
}

#[cfg(test)]
mod test {
    use bitcoin::{secp256k1::Secp256k1, Network};
    use spectrum_common::amount::Amount;

    use super::*;
    use crate::{
        descriptors::seed_descriptor_pair,
        service::test::service_fixture,
    };

    fn btc(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    /// A wallet with a hot descriptor pair (range 5) and one confirmed
    /// 100 000 sat UTXO on external index 0. Returns the funding txid.
    fn funded_wallet_fixture(
        service: &WalletService,
    ) -> (Wallet, String) {
        let wallet = service.create_wallet("w", false, true).unwrap();
        let secp = Secp256k1::new();
        let (external, internal) =
            seed_descriptor_pair(&secp, &[5u8; 32], Network::Regtest)
                .unwrap();
        service
            .import_descriptor(&wallet, &external, false, true, 5, 0)
            .unwrap();
        service
            .import_descriptor(&wallet, &internal, true, true, 5, 0)
            .unwrap();

        let descriptor =
            service.db.active_descriptor(wallet.id, false).unwrap();
        let script = service
            .db
            .script_by_descriptor_index(descriptor.id, 0)
            .unwrap();
        let spk =
            ScriptBuf::from_bytes(hex::decode(&script.script).unwrap());

        // A segwit funding tx paying 100 000 sat to that script.
        let funding = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::from_slice(&[vec![0u8; 64]]),
            }],
            output: vec![TxOut {
                value: SatAmount::from_sat(100_000),
                script_pubkey: spk,
            }],
        };
        let txid = funding.compute_txid().to_string();
        service
            .txcache
            .insert(&txid, &hex::encode(&consensus::serialize(&funding)))
            .unwrap();

        let mut txn = service.db.begin_write();
        txn.insert_utxo(Utxo {
            id: 0,
            wallet_id: wallet.id,
            script_id: script.id,
            txid: txid.clone(),
            vout: 0,
            height: Some(100),
            amount: Amount::from_sats(100_000),
            locked: false,
        });
        txn.commit();
        (wallet, txid)
    }

    fn foreign_address() -> String {
        let secp = Secp256k1::new();
        let (external, _) =
            seed_descriptor_pair(&secp, &[6u8; 32], Network::Regtest)
                .unwrap();
        let parsed =
            ParsedDescriptor::parse(&secp, &external).unwrap();
        bitcoin::Address::from_script(
            &parsed.script_pubkey_at(0).unwrap(),
            Network::Regtest,
        )
        .unwrap()
        .to_string()
    }

    #[tokio::test]
    async fn fund_sign_finalize_roundtrip() {
        let (_dir, service) = service_fixture();
        let (wallet, _txid) = funded_wallet_fixture(&service);
        let dest = foreign_address();

        let options = PsbtOptions {
            fee_rate: Some(2.0),
            replaceable: true,
            ..PsbtOptions::default()
        };
        let funded = service
            .create_funded_psbt(
                &wallet,
                &[],
                &[(dest.clone(), btc("0.0003"))],
                0,
                &options,
            )
            .await
            .unwrap();
        assert!(funded.changepos >= 0);
        assert!(funded.fee.sats() > 0);

        // Parse(serialize(psbt)) round-trips.
        let parsed = Psbt::from_str(&funded.psbt).unwrap();
        assert_eq!(parsed.to_string(), funded.psbt);
        // Replaceability is signalled on every input.
        for input in &parsed.unsigned_tx.input {
            assert_eq!(input.sequence, SEQUENCE_RBF);
        }
        // Input scopes carry utxos and derivations.
        assert!(parsed.inputs[0].non_witness_utxo.is_some());
        assert!(parsed.inputs[0].witness_utxo.is_some());
        assert!(!parsed.inputs[0].bip32_derivation.is_empty());

        let processed =
            service.process_psbt(&wallet, &funded.psbt, true).unwrap();
        assert!(processed.complete);

        let finalized = finalize_psbt(&processed.psbt, true).unwrap();
        assert!(finalized.complete);
        let tx_hex = finalized.hex.unwrap();
        let tx: Transaction =
            consensus::deserialize(&hex::decode(&tx_hex).unwrap())
                .unwrap();

        // Fee accounting: fee == sum_ins - sum_outs.
        let sum_outs: i64 = tx
            .output
            .iter()
            .map(|out| out.value.to_sat() as i64)
            .sum();
        assert_eq!(100_000 - sum_outs, funded.fee.sats());

        // The destination is paid exactly.
        let network = Network::Regtest;
        let dest_spk = ScriptBuf::from_bytes(
            hex::decode(&spk_hex_from_address(&dest, network).unwrap())
                .unwrap(),
        );
        assert!(tx.output.iter().any(|out| out.script_pubkey == dest_spk
            && out.value.to_sat() == 30_000));
    }

    #[tokio::test]
    async fn insufficient_funds_paths() {
        let (_dir, service) = service_fixture();
        let (wallet, _txid) = funded_wallet_fixture(&service);
        let dest = foreign_address();
        let options = PsbtOptions {
            fee_rate: Some(1.0),
            ..PsbtOptions::default()
        };

        // More than the wallet holds.
        let err = service
            .create_funded_psbt(
                &wallet,
                &[],
                &[(dest.clone(), btc("1.0"))],
                0,
                &options,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds));

        // An explicit input we don't track.
        let err = service
            .create_funded_psbt(
                &wallet,
                &[InputRef {
                    txid: "cd".repeat(32),
                    vout: 0,
                }],
                &[(dest, btc("0.0001"))],
                0,
                &options,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds));
    }

    #[tokio::test]
    async fn lock_unspents_freezes_selection() {
        let (_dir, service) = service_fixture();
        let (wallet, txid) = funded_wallet_fixture(&service);
        let options = PsbtOptions {
            fee_rate: Some(1.0),
            lock_unspents: true,
            ..PsbtOptions::default()
        };
        service
            .create_funded_psbt(
                &wallet,
                &[],
                &[(foreign_address(), btc("0.0001"))],
                0,
                &options,
            )
            .await
            .unwrap();

        let utxo = service
            .db
            .utxo_by_outpoint(wallet.id, &txid, 0)
            .unwrap();
        assert!(utxo.locked);
    }

    #[tokio::test]
    async fn fee_subtracted_from_listed_outputs() {
        let (_dir, service) = service_fixture();
        let (wallet, _txid) = funded_wallet_fixture(&service);
        let dest = foreign_address();
        let options = PsbtOptions {
            fee_rate: Some(2.0),
            subtract_fee_from_outputs: vec![0],
            ..PsbtOptions::default()
        };
        let funded = service
            .create_funded_psbt(
                &wallet,
                &[],
                &[(dest.clone(), btc("0.0003"))],
                0,
                &options,
            )
            .await
            .unwrap();

        let psbt = Psbt::from_str(&funded.psbt).unwrap();
        let network = Network::Regtest;
        let dest_spk = ScriptBuf::from_bytes(
            hex::decode(&spk_hex_from_address(&dest, network).unwrap())
                .unwrap(),
        );
        let dest_out = psbt
            .unsigned_tx
            .output
            .iter()
            .find(|out| out.script_pubkey == dest_spk)
            .unwrap();
        // The destination paid the fee.
        assert_eq!(
            dest_out.value.to_sat() as i64,
            30_000 - funded.fee.sats(),
        );
    }

    #[test]
    fn convert_rejects_signed_inputs() {
        // A tx with a non-empty scriptSig.
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![],
        };
        let tx_hex = hex::encode(&consensus::serialize(&tx));

        let err = convert_to_psbt(&tx_hex, false).unwrap_err();
        assert!(matches!(err, WalletError::BadParam(_)));
        // permitsigdata strips the signature data instead.
        let psbt_str = convert_to_psbt(&tx_hex, true).unwrap();
        let psbt = Psbt::from_str(&psbt_str).unwrap();
        assert!(psbt.unsigned_tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn combine_requires_input() {
        let err = combine_psbts(&[]).unwrap_err();
        assert!(matches!(err, WalletError::BadParam(_)));
    }
}
