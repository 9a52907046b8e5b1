//! Wallet-level method implementations, answered from the index (with
//! PSBT construction delegated to the wallet service).

use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use spectrum_common::amount::Amount;
use spectrum_store::{Tx, TxCategory, Wallet};
use spectrum_wallet::{psbt::InputRef, PsbtOptions};
use tracing::info;

use crate::{
    chain_methods::unix_time, error::RpcError, node::Spectrum,
    params::Params,
};

impl Spectrum {
    pub(crate) async fn dispatch_wallet(
        &self,
        method: &str,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        match method {
            "getwalletinfo" => self.getwalletinfo(wallet),
            "rescanblockchain" => {
                info!("NOP: rescanblockchain");
                Ok(json!({}))
            }
            "importdescriptors" => self.importdescriptors(wallet, params),
            "getnewaddress" => self.getnewaddress(wallet, params),
            "getrawchangeaddress" =>
                Ok(json!(self.wallets.change_address(wallet)?)),
            "listlabels" => Ok(json!(self.wallets.labels(wallet))),
            "setlabel" => self.setlabel(wallet, params),
            "getaddressesbylabel" =>
                self.getaddressesbylabel(wallet, params),
            "gettransaction" => self.gettransaction(wallet, params),
            "listtransactions" => self.listtransactions(wallet, params),
            "getbalances" => self.getbalances(wallet),
            "lockunspent" => self.lockunspent(wallet, params),
            "listlockunspent" => self.listlockunspent(wallet),
            "listunspent" => self.listunspent(wallet),
            "listsinceblock" => self.listsinceblock(wallet, params),
            "getreceivedbyaddress" =>
                self.getreceivedbyaddress(wallet, params),
            "walletcreatefundedpsbt" =>
                self.walletcreatefundedpsbt(wallet, params).await,
            "walletprocesspsbt" => self.walletprocesspsbt(wallet, params),
            other => Err(RpcError::NotFound(other.to_owned())),
        }
    }

    fn getwalletinfo(&self, wallet: &Wallet) -> Result<Value, RpcError> {
        let (confirmed, unconfirmed) =
            self.db.wallet_balances(wallet.id);
        let keypool = |internal: bool| -> u32 {
            self.db
                .active_descriptor(wallet.id, internal)
                .map(|d| {
                    let pool = self
                        .db
                        .scripts_by_descriptor(d.id)
                        .len() as u32;
                    pool.saturating_sub(d.next_index)
                })
                .unwrap_or(0)
        };
        Ok(json!({
            "walletname": wallet.name,
            "walletversion": 169900,
            "format": "sqlite",
            "balance": confirmed.btc_f64(),
            "unconfirmed_balance": unconfirmed.btc_f64(),
            "immature_balance": 0,
            "txcount": self.db.wallet_tx_count(wallet.id),
            "keypoolsize": keypool(false),
            "keypoolsize_hd_internal": keypool(true),
            "paytxfee": 0,
            "private_keys_enabled": wallet.private_keys_enabled,
            "avoid_reuse": false,
            "scanning": false,
            "descriptors": true,
            "external_signer": false,
        }))
    }

    fn importdescriptors(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let requests: Vec<Value> = params.require(0, "requests")?;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.importdescriptor(wallet, &request));
        }
        Ok(json!(results))
    }

    fn importdescriptor(&self, wallet: &Wallet, request: &Value) -> Value {
        let import = || -> Result<(), RpcError> {
            let desc = request["desc"].as_str().ok_or_else(|| {
                RpcError::BadArgs("missing descriptor".to_owned())
            })?;
            let internal =
                request["internal"].as_bool().unwrap_or(false);
            let active = request["active"].as_bool().unwrap_or(false);
            let range = match request.get("range") {
                Some(v) => v.as_u64().ok_or_else(|| {
                    RpcError::BadArgs("bad range".to_owned())
                })? as u32,
                None => spectrum_wallet::service::DEFAULT_RANGE,
            };
            let next_index =
                request["next_index"].as_u64().unwrap_or(0) as u32;
            self.wallets.import_descriptor(
                wallet, desc, internal, active, range, next_index,
            )?;
            Ok(())
        };
        match import() {
            Ok(()) => json!({"success": true}),
            Err(e) => json!({
                "success": false,
                "error": {"code": -500, "message": e.to_string()},
            }),
        }
    }

    fn getnewaddress(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let label: String = params.get_or(0, "label", String::new())?;
        let address = self.wallets.new_address(wallet)?;
        if !label.is_empty() {
            self.wallets.set_label(wallet, &address, &label)?;
        }
        Ok(json!(address))
    }

    fn setlabel(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let address: String = params.require(0, "address")?;
        let label: String = params.require(1, "label")?;
        self.wallets.set_label(wallet, &address, &label)?;
        Ok(Value::Null)
    }

    fn getaddressesbylabel(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let label: String = params.require(0, "label")?;
        let mut obj = Map::new();
        for (address, purpose) in
            self.wallets.addresses_by_label(wallet, &label)?
        {
            obj.insert(address, json!({"purpose": purpose}));
        }
        Ok(Value::Object(obj))
    }

    fn gettransaction(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let txid: String = params.require(0, "txid")?;
        let raw_hex = self.txcache.get_raw(&txid)?;
        let rows = self.db.txs_by_txid(wallet.id, &txid);
        let first = rows.first().ok_or(RpcError::InvalidTxid)?;

        let confirmed = first.height.is_some();
        let time = if confirmed {
            first.blocktime.unwrap_or_else(unix_time)
        } else {
            unix_time()
        };
        let total: Amount = rows.iter().map(|tx| tx.amount).sum();

        let details: Vec<Value> = rows
            .iter()
            .filter(|tx| tx.category != TxCategory::Change)
            .map(|tx| -> Result<Value, RpcError> {
                Ok(json!({
                    "address": self.script_address(tx.script_id)?,
                    "category": tx.category.to_string(),
                    "amount": tx.amount.btc_f64(),
                    "label": "",
                    "vout": tx.vout,
                }))
            })
            .collect::<Result<_, _>>()?;

        let mut obj = json!({
            "amount": total.btc_f64(),
            "confirmations": self.chain.confirmations(first.height),
            "txid": txid,
            "walletconflicts": [],
            "time": time,
            "timereceived": time,
            "bip125-replaceable": (if first.replaceable { "yes" } else { "no" }),
            "details": details,
            "hex": raw_hex,
        });
        let has_send = rows
            .iter()
            .any(|tx| tx.category == TxCategory::Send);
        if has_send {
            let fee = first.fee.unwrap_or(Amount::ZERO);
            obj["fee"] = json!((-fee).btc_f64());
        }
        if confirmed {
            obj["blockhash"] = json!(first.blockhash);
            obj["blockheight"] = json!(first.height);
            obj["blocktime"] = json!(first.blocktime);
        } else {
            obj["trusted"] = json!(false);
        }
        Ok(obj)
    }

    fn listtransactions(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let _label: String = params.get_or(0, "label", "*".to_owned())?;
        let count: usize = params.get_or(1, "count", 10)?;
        let skip: usize = params.get_or(2, "skip", 0)?;

        let txs: Vec<Value> = self
            .db
            .txs_by_wallet(wallet.id)
            .into_iter()
            .filter(|tx| {
                matches!(
                    tx.category,
                    TxCategory::Send | TxCategory::Receive
                )
            })
            .skip(skip)
            .take(count)
            .map(|tx| self.tx_to_json(&tx))
            .collect::<Result<_, _>>()?;
        Ok(json!(txs))
    }

    fn getbalances(&self, wallet: &Wallet) -> Result<Value, RpcError> {
        let (confirmed, unconfirmed) =
            self.db.wallet_balances(wallet.id);
        let balances = json!({
            "trusted": confirmed.btc_f64(),
            "untrusted_pending": unconfirmed.btc_f64(),
            "immature": 0.0,
        });
        if wallet.private_keys_enabled {
            Ok(json!({"mine": balances}))
        } else {
            Ok(json!({"mine": balances, "watchonly": balances}))
        }
    }

    fn lockunspent(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let unlock: bool = params.require(0, "unlock")?;
        let transactions: Vec<Value> =
            params.get_or(1, "transactions", Vec::new())?;
        for txobj in transactions {
            let txid = txobj["txid"].as_str().ok_or_else(|| {
                RpcError::BadArgs("missing txid".to_owned())
            })?;
            let vout = txobj["vout"].as_u64().ok_or_else(|| {
                RpcError::BadArgs("missing vout".to_owned())
            })? as u32;
            let utxo = self
                .db
                .utxo_by_outpoint(wallet.id, txid, vout)
                .ok_or_else(|| {
                    RpcError::BadArgs(
                        "Invalid parameter, unknown transaction"
                            .to_owned(),
                    )
                })?;
            if utxo.locked && !unlock {
                return Err(RpcError::BadArgs(
                    "Invalid parameter, output already locked".to_owned(),
                ));
            }
            if !utxo.locked && unlock {
                return Err(RpcError::BadArgs(
                    "Invalid parameter, expected locked output".to_owned(),
                ));
            }
            let mut txn = self.db.begin_write();
            txn.set_utxo_locked(utxo.id, !unlock)?;
            txn.commit();
        }
        Ok(json!(true))
    }

    fn listlockunspent(&self, wallet: &Wallet) -> Result<Value, RpcError> {
        Ok(json!(self
            .db
            .locked_utxos(wallet.id)
            .into_iter()
            .map(|u| json!({"txid": u.txid, "vout": u.vout}))
            .collect::<Vec<_>>()))
    }

    fn listunspent(&self, wallet: &Wallet) -> Result<Value, RpcError> {
        let utxos = self
            .db
            .utxos_by_wallet(wallet.id)
            .into_iter()
            .filter(|u| !u.locked);
        let mut out = Vec::new();
        for utxo in utxos {
            let script =
                self.db.script(utxo.script_id).ok_or_else(|| {
                    RpcError::Generic(format!(
                        "utxo {}:{} has no script row",
                        utxo.txid, utxo.vout
                    ))
                })?;
            let desc = self
                .wallets
                .script_descriptor(&script)
                .unwrap_or_default();
            out.push(json!({
                "txid": utxo.txid,
                "vout": utxo.vout,
                "amount": utxo.amount.btc_f64(),
                "spendable": true,
                "solvable": true,
                "safe": utxo.height.is_some(),
                "confirmations": self.chain.confirmations(utxo.height),
                "address": self.script_address(utxo.script_id)?,
                "scriptPubKey": script.script,
                "desc": desc,
            }));
        }
        Ok(json!(out))
    }

    fn listsinceblock(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let _blockhash: Option<String> = params.get(0, "blockhash")?;
        let target_confirmations: i64 =
            params.get_or(1, "target_confirmations", 1)?;

        let cutoff = i64::from(self.chain.blocks())
            - target_confirmations
            + 1;
        let transactions: Vec<Value> = self
            .db
            .txs_by_wallet(wallet.id)
            .into_iter()
            .filter(|tx| {
                matches!(
                    tx.category,
                    TxCategory::Send | TxCategory::Receive
                )
            })
            .filter(|tx| {
                target_confirmations <= 0
                    || tx
                        .height
                        .map(|h| i64::from(h) <= cutoff)
                        .unwrap_or(false)
            })
            .map(|tx| self.tx_to_json(&tx))
            .collect::<Result<_, _>>()?;
        Ok(json!({
            "transactions": transactions,
            "removed": [],
            "lastblock": self.chain.bestblockhash(),
        }))
    }

    fn getreceivedbyaddress(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let address: String = params.require(0, "address")?;
        let _minconf: u32 = params.get_or(1, "minconf", 1)?;
        let network = self.chain.chain().to_bitcoin();
        let spk_hex =
            spectrum_wallet::descriptors::spk_hex_from_address(
                &address, network,
            )
            .map_err(|e| RpcError::BadArgs(e.to_string()))?;
        let Some(script) = self.db.script_by_spk(wallet.id, &spk_hex)
        else {
            return Ok(json!(0));
        };
        // No history on this script yet.
        if script.state.is_none() {
            return Ok(json!(0));
        }
        let received: Amount = self
            .db
            .txs_by_script(script.id)
            .into_iter()
            .filter(|tx| {
                matches!(
                    tx.category,
                    TxCategory::Receive | TxCategory::Change
                )
            })
            .map(|tx| tx.amount)
            .sum();
        Ok(json!(received.btc_f64()))
    }

    async fn walletcreatefundedpsbt(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let inputs: Vec<InputRef> =
            params.get_or(0, "inputs", Vec::new())?;
        let outputs_value: Value =
            params.get_or(1, "outputs", json!([]))?;
        let outputs = parse_outputs(&outputs_value)?;
        let locktime: u32 = params.get_or(2, "locktime", 0)?;
        let options: PsbtOptions =
            params.get_or(3, "options", PsbtOptions::default())?;

        let funded = self
            .wallets
            .create_funded_psbt(wallet, &inputs, &outputs, locktime, &options)
            .await?;
        Ok(json!({
            "psbt": funded.psbt,
            "fee": funded.fee.btc_f64(),
            "changepos": funded.changepos,
        }))
    }

    fn walletprocesspsbt(
        &self,
        wallet: &Wallet,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let psbt: String = params.require(0, "psbt")?;
        let sign: bool = params.get_or(1, "sign", true)?;
        let processed =
            self.wallets.process_psbt(wallet, &psbt, sign)?;
        Ok(json!({
            "psbt": processed.psbt,
            "complete": processed.complete,
        }))
    }

    // --- Shared shapes --- //

    fn script_address(&self, script_id: i64) -> Result<String, RpcError> {
        let script = self.db.script(script_id).ok_or_else(|| {
            RpcError::Generic(format!("script {script_id} missing"))
        })?;
        let network = self.chain.chain().to_bitcoin();
        spectrum_wallet::descriptors::address_from_spk_hex(
            &script.script,
            network,
        )
        .map(|a| a.to_string())
        .map_err(|e| RpcError::Generic(e.to_string()))
    }

    /// The transaction-list entry shape shared by `listtransactions` and
    /// `listsinceblock`.
    fn tx_to_json(&self, tx: &Tx) -> Result<Value, RpcError> {
        let confirmed = tx.height.is_some();
        let time = if confirmed {
            tx.blocktime.unwrap_or_else(unix_time)
        } else {
            unix_time()
        };
        let mut obj = json!({
            "address": self.script_address(tx.script_id)?,
            "category": tx.category.to_string(),
            "amount": tx.amount.btc_f64(),
            "label": "",
            "vout": tx.vout,
            "confirmations": self.chain.confirmations(tx.height),
            "txid": tx.txid,
            "time": time,
            "timereceived": time,
            "walletconflicts": [],
            "bip125-replaceable": (if tx.replaceable { "yes" } else { "no" }),
        });
        if tx.category == TxCategory::Send {
            let fee = tx.fee.unwrap_or(Amount::ZERO);
            obj["fee"] = json!((-fee).btc_f64());
        }
        if confirmed {
            obj["blockhash"] = json!(tx.blockhash);
            obj["blockheight"] = json!(tx.height);
            obj["blocktime"] = json!(tx.blocktime);
        } else {
            obj["trusted"] = json!(false);
        }
        Ok(obj)
    }
}

/// `outputs` is a list of `{address: btc_amount}` objects (or one such
/// object).
fn parse_outputs(
    outputs: &Value,
) -> Result<Vec<(String, Decimal)>, RpcError> {
    let objects: Vec<&Map<String, Value>> = match outputs {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    RpcError::BadArgs(
                        "outputs entries must be objects".to_owned(),
                    )
                })
            })
            .collect::<Result<_, _>>()?,
        Value::Object(object) => vec![object],
        _ =>
            return Err(RpcError::BadArgs(
                "outputs must be a list or object".to_owned(),
            )),
    };
    let mut parsed = Vec::new();
    for object in objects {
        for (address, amount) in object {
            let amount = decimal_from_json(amount).ok_or_else(|| {
                RpcError::BadArgs(format!(
                    "bad amount for {address}: {amount}"
                ))
            })?;
            parsed.push((address.clone(), amount));
        }
    }
    Ok(parsed)
}

fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
