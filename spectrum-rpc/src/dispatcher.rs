//! The method registry and dispatch order.
//!
//! Dispatch: (1) unknown method -> -32601; (2) wallet-level method with no
//! wallet in the call context -> -19; (3) a wallet name that doesn't
//! resolve -> -18; then bind params and execute. Domain errors map to the
//! Core code table; anything unexpected becomes -500. A batch request is
//! a list, each item dispatched independently, results in order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spectrum_store::Wallet;
use tracing::{debug, error};

use crate::{error::RpcError, node::Spectrum, params::Params};

/// Chain-level methods (no wallet context required).
pub const RPC_METHODS: &[&str] = &[
    "combinepsbt",
    "converttopsbt",
    "createwallet",
    "estimatesmartfee",
    "finalizepsbt",
    "getblockchaininfo",
    "getblockcount",
    "getblockfilter",
    "getblockhash",
    "getmempoolinfo",
    "getmininginfo",
    "getnetworkinfo",
    "getrawtransaction",
    "gettxoutsetinfo",
    "listwalletdir",
    "listwallets",
    "loadwallet",
    "scantxoutset",
    "sendrawtransaction",
    "testmempoolaccept",
    "unloadwallet",
    "uptime",
];

/// Wallet-level methods (require a wallet name in the call context).
pub const WALLET_RPC_METHODS: &[&str] = &[
    "getaddressesbylabel",
    "getbalances",
    "getnewaddress",
    "getrawchangeaddress",
    "getreceivedbyaddress",
    "gettransaction",
    "getwalletinfo",
    "importdescriptors",
    "listlabels",
    "listlockunspent",
    "listsinceblock",
    "listtransactions",
    "listunspent",
    "lockunspent",
    "rescanblockchain",
    "setlabel",
    "walletcreatefundedpsbt",
    "walletprocesspsbt",
];

/// One incoming request.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

/// One outgoing response: `{result, error, id}` with `error` null on
/// success.
#[derive(Clone, Debug, Serialize)]
pub struct RpcResponse {
    pub result: Value,
    pub error: Value,
    pub id: Value,
}

impl Spectrum {
    /// Dispatch a single request within an optional wallet context.
    pub async fn dispatch(
        &self,
        request: RpcRequest,
        wallet_name: Option<&str>,
    ) -> RpcResponse {
        let id = request.id.clone();
        let method = request.method.clone();
        match self.dispatch_inner(request, wallet_name).await {
            Ok(result) => RpcResponse {
                result,
                error: Value::Null,
                id,
            },
            Err(e) => {
                error!(
                    "RPC {method} failed (wallet {wallet_name:?}): {e}",
                );
                RpcResponse {
                    result: Value::Null,
                    error: e.to_error_object(),
                    id,
                }
            }
        }
    }

    /// Dispatch a batch; results come back in request order.
    pub async fn dispatch_batch(
        &self,
        requests: Vec<RpcRequest>,
        wallet_name: Option<&str>,
    ) -> Vec<RpcResponse> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.dispatch(request, wallet_name).await);
        }
        responses
    }

    async fn dispatch_inner(
        &self,
        request: RpcRequest,
        wallet_name: Option<&str>,
    ) -> Result<Value, RpcError> {
        let method = request.method.as_str();
        debug!("RPC called {method} (wallet {wallet_name:?})");

        let is_wallet_method = WALLET_RPC_METHODS.contains(&method);
        if !is_wallet_method && !RPC_METHODS.contains(&method) {
            return Err(RpcError::NotFound(method.to_owned()));
        }

        let params = Params::parse(request.params)?;
        if is_wallet_method {
            let name = wallet_name.ok_or(RpcError::WalletMissing)?;
            let wallet = self.resolve_wallet(name)?;
            self.dispatch_wallet(method, &wallet, &params).await
        } else {
            // Chain-level methods still validate a provided wallet
            // context, matching the path-segment framing.
            if let Some(name) = wallet_name {
                self.resolve_wallet(name)?;
            }
            self.dispatch_chain(method, &params).await
        }
    }

    pub(crate) fn resolve_wallet(
        &self,
        name: &str,
    ) -> Result<Wallet, RpcError> {
        self.db
            .wallet_by_name(name)
            .ok_or_else(|| RpcError::WalletNotLoaded(name.to_owned()))
    }
}
