//! Chain-level method implementations. Many of these are fixed-shape
//! answers a wallet frontend expects from a full node; the interesting
//! ones route to the chain state or straight to Electrum.

use serde_json::{json, Value};
use tracing::info;

use crate::{error::RpcError, node::Spectrum, params::Params};

pub(crate) fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Spectrum {
    pub(crate) async fn dispatch_chain(
        &self,
        method: &str,
        params: &Params,
    ) -> Result<Value, RpcError> {
        match method {
            "getblockchaininfo" => self.getblockchaininfo(),
            "getmininginfo" => self.getmininginfo(),
            "getnetworkinfo" => Ok(getnetworkinfo()),
            "getmempoolinfo" => Ok(getmempoolinfo()),
            "uptime" => Ok(json!(self.chain.uptime_secs())),
            "getblockcount" => Ok(json!(self.chain.blocks())),
            "getblockhash" => self.getblockhash(params).await,
            "estimatesmartfee" => self.estimatesmartfee(params).await,
            "combinepsbt" => combinepsbt(params),
            "finalizepsbt" => finalizepsbt(params),
            "converttopsbt" => converttopsbt(params),
            "testmempoolaccept" => testmempoolaccept(params),
            "getrawtransaction" => self.getrawtransaction(params).await,
            "sendrawtransaction" => self.sendrawtransaction(params).await,
            "scantxoutset" => Ok(Value::Null),
            "gettxoutsetinfo" => self.gettxoutsetinfo(),
            "getblockfilter" => Ok(json!({})),
            "listwallets" | "listwalletdir" => Ok(json!(self
                .db
                .wallets()
                .into_iter()
                .map(|w| w.name)
                .collect::<Vec<_>>())),
            "createwallet" => self.createwallet(params),
            "loadwallet" | "unloadwallet" => self.loadwallet(params),
            other => Err(RpcError::NotFound(other.to_owned())),
        }
    }

    fn getblockchaininfo(&self) -> Result<Value, RpcError> {
        let (progress, _rate) = self.chain.sync_progress();
        Ok(json!({
            "chain": self.chain.chain().as_str(),
            "blocks": self.chain.blocks(),
            "headers": self.chain.blocks(),
            "bestblockhash": self.chain.bestblockhash(),
            "difficulty": 0,
            "mediantime": unix_time(),
            "verificationprogress": f64::from(progress) / 100.0,
            "initialblockdownload": progress != 100,
            "chainwork": "00",
            "size_on_disk": 0,
            "pruned": false,
            "softforks": {},
            "warnings": "",
        }))
    }

    fn getmininginfo(&self) -> Result<Value, RpcError> {
        Ok(json!({
            "blocks": self.chain.blocks(),
            "chain": self.chain.chain().as_str(),
            "difficulty": 0,
            "networkhashps": 0,
            "warnings": "",
        }))
    }

    async fn getblockhash(
        &self,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let height: i64 = params.require(0, "height")?;
        let blocks = i64::from(self.chain.blocks());
        if height == 0 {
            return Ok(json!(self.chain.roothash()));
        }
        if height == blocks {
            return Ok(json!(self.chain.bestblockhash()));
        }
        if height < 0 || height > blocks {
            return Err(RpcError::BadArgs(
                "Block height out of range".to_owned(),
            ));
        }
        let height = height as u32;
        if let Some(hash) = self.chain.cached_blockhash(height) {
            return Ok(json!(hash));
        }
        let header = self.electrum.block_header(height).await?;
        let hash = spectrum_index::headers::blockhash_hex(&header)
            .map_err(|e| RpcError::Generic(e.to_string()))?;
        self.chain.cache_blockhash(height, hash.clone());
        Ok(json!(hash))
    }

    async fn estimatesmartfee(
        &self,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let conf_target: u32 = params.require(0, "conf_target")?;
        if !(1..=1008).contains(&conf_target) {
            return Err(RpcError::BadArgs(
                "Invalid conf_target, must be between 1 and 1008"
                    .to_owned(),
            ));
        }
        let fee = self.electrum.estimate_fee(conf_target).await?;
        // Electrum returns a negative value when it has no estimate.
        if fee < 0.0 {
            return Ok(json!({
                "errors": ["Insufficient data or no feerate found"],
                "blocks": conf_target,
            }));
        }
        Ok(json!({
            "feerate": fee,
            "blocks": conf_target,
        }))
    }

    async fn getrawtransaction(
        &self,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let txid: String = params.require(0, "txid")?;
        let verbose: bool = params.get_or(1, "verbose", false)?;
        if verbose {
            Ok(self.electrum.transaction_get_verbose(&txid).await?)
        } else {
            Ok(json!(self.electrum.transaction_get(&txid).await?))
        }
    }

    async fn sendrawtransaction(
        &self,
        params: &Params,
    ) -> Result<Value, RpcError> {
        let hexstring: String = params.require(0, "hexstring")?;
        let result =
            self.electrum.transaction_broadcast(&hexstring).await?;
        // Anything that isn't a txid is the server telling us why not.
        if result.len() != 64 {
            return Err(RpcError::Misc(result));
        }
        Ok(json!(result))
    }

    fn gettxoutsetinfo(&self) -> Result<Value, RpcError> {
        Ok(json!({
            "height": self.chain.blocks(),
            "bestblock": self.chain.bestblockhash(),
            "transactions": 0,
            "txouts": 0,
            "bogosize": 0,
            "hash_serialized_2": "",
            "disk_size": 0,
            "total_amount": 0,
        }))
    }

    fn createwallet(&self, params: &Params) -> Result<Value, RpcError> {
        let wallet_name: String = params.require(0, "wallet_name")?;
        let disable_private_keys: bool =
            params.get_or(1, "disable_private_keys", false)?;
        let blank: bool = params.get_or(2, "blank", false)?;
        self.wallets.create_wallet(
            &wallet_name,
            disable_private_keys,
            blank,
        )?;
        Ok(json!({"name": wallet_name, "warning": ""}))
    }

    /// `loadwallet`/`unloadwallet` only check that the wallet exists;
    /// every known wallet is always loaded here.
    fn loadwallet(&self, params: &Params) -> Result<Value, RpcError> {
        let filename: String = params.require(0, "filename")?;
        self.resolve_wallet(&filename)?;
        info!("NOP: load/unload wallet {filename}");
        Ok(json!({"name": filename, "warning": ""}))
    }
}

fn getnetworkinfo() -> Value {
    json!({
        "version": 230000,
        "subversion": "/Satoshi:0.23.0/",
        "protocolversion": 70016,
        "localservices": "0000000000000409",
        "localservicesnames": ["NETWORK", "WITNESS", "NETWORK_LIMITED"],
        "localrelay": true,
        "timeoffset": 0,
        "networkactive": true,
        "connections": 0,
        "connections_in": 0,
        "connections_out": 0,
        "networks": [
            {
                "name": "ipv4",
                "limited": false,
                "reachable": true,
                "proxy": "",
                "proxy_randomize_credentials": false,
            },
            {
                "name": "ipv6",
                "limited": false,
                "reachable": true,
                "proxy": "",
                "proxy_randomize_credentials": false,
            },
            {
                "name": "onion",
                "limited": true,
                "reachable": false,
                "proxy": "",
                "proxy_randomize_credentials": false,
            },
        ],
        "relayfee": 0.00001000,
        "incrementalfee": 0.00001000,
        "localaddresses": [],
        "warnings": "",
    })
}

fn getmempoolinfo() -> Value {
    json!({
        "loaded": true,
        "size": 0,
        "bytes": 0,
        "usage": 64,
        "maxmempool": 300000000,
        "mempoolminfee": 0.00001000,
        "minrelaytxfee": 0.00001000,
        "unbroadcastcount": 0,
    })
}

fn combinepsbt(params: &Params) -> Result<Value, RpcError> {
    let txs: Vec<String> = params.require(0, "txs")?;
    if txs.is_empty() {
        return Err(RpcError::BadArgs(
            "Parameter 'txs' cannot be empty".to_owned(),
        ));
    }
    let combined = spectrum_wallet::psbt::combine_psbts(&txs)?;
    Ok(json!(combined))
}

fn finalizepsbt(params: &Params) -> Result<Value, RpcError> {
    let psbt: String = params.require(0, "psbt")?;
    let extract: bool = params.get_or(1, "extract", true)?;
    let finalized = spectrum_wallet::psbt::finalize_psbt(&psbt, extract)?;
    let mut obj = serde_json::Map::new();
    if let Some(hex) = finalized.hex {
        obj.insert("hex".to_owned(), json!(hex));
    }
    if let Some(psbt) = finalized.psbt {
        obj.insert("psbt".to_owned(), json!(psbt));
    }
    obj.insert("complete".to_owned(), json!(finalized.complete));
    Ok(Value::Object(obj))
}

fn converttopsbt(params: &Params) -> Result<Value, RpcError> {
    let hexstring: String = params.require(0, "hexstring")?;
    let permitsigdata: bool = params.get_or(1, "permitsigdata", false)?;
    let psbt =
        spectrum_wallet::psbt::convert_to_psbt(&hexstring, permitsigdata)
            .map_err(|e| match e {
                // Core reports leftover signature data as a format error.
                spectrum_wallet::WalletError::BadParam(message) =>
                    RpcError::InvalidTx(message),
                other => other.into(),
            })?;
    Ok(json!(psbt))
}

/// Electrum has no mempool-policy oracle; accept everything like the
/// original gateway does.
fn testmempoolaccept(params: &Params) -> Result<Value, RpcError> {
    let rawtxs: Vec<String> = params.require(0, "rawtxs")?;
    Ok(json!(rawtxs
        .iter()
        .map(|_| json!({"allowed": true}))
        .collect::<Vec<_>>()))
}
