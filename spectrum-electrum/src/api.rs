//! Typed client surface over the raw `call` primitive.
//!
//! The indexer, wallet service, and RPC layer depend on [`ElectrumApi`]
//! rather than on [`ElectrumSocket`] directly, so tests can substitute a
//! scripted server.
//!
//! [`ElectrumSocket`]: crate::ElectrumSocket

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::transport::{ElectrumSocket, TransportError};

/// An entry of `blockchain.scripthash.listunspent`.
#[derive(Clone, Debug, Deserialize)]
pub struct Unspent {
    /// Confirmation height; `0` (or negative) for mempool outputs.
    pub height: i64,
    pub tx_hash: String,
    pub tx_pos: u32,
    /// Value in satoshis.
    pub value: u64,
}

impl Unspent {
    /// Confirmation height as the index understands it: `None` = mempool.
    pub fn confirmed_height(&self) -> Option<u32> {
        u32::try_from(self.height).ok().filter(|h| *h > 0)
    }
}

/// Result of `blockchain.scripthash.get_balance`, in satoshis.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ScriptBalance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

/// An entry of `blockchain.scripthash.get_history`.
#[derive(Clone, Debug, Deserialize)]
pub struct HistoryEntry {
    /// `0` = mempool, `-1` = mempool with unconfirmed parents.
    pub height: i64,
    pub tx_hash: String,
    /// Only present for mempool entries.
    #[serde(default)]
    pub fee: Option<u64>,
}

impl HistoryEntry {
    pub fn confirmed_height(&self) -> Option<u32> {
        u32::try_from(self.height).ok().filter(|h| *h > 0)
    }
}

/// Result (and notification payload) of `blockchain.headers.subscribe`.
#[derive(Clone, Debug, Deserialize)]
pub struct HeaderEvent {
    pub height: i64,
    /// The 80-byte header, hex-encoded.
    pub hex: String,
}

fn de<T: DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value)
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

/// The subset of the Electrum protocol this gateway drives, as typed
/// helpers over a raw `call`.
#[async_trait]
pub trait ElectrumApi: Send + Sync {
    /// Issue a raw call. Everything else has a default impl on top.
    async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError>;

    async fn ping(&self) -> Result<(), TransportError> {
        self.call("server.ping", json!([])).await.map(|_| ())
    }

    /// Subscribe to headers; returns the current tip.
    async fn headers_subscribe(&self) -> Result<HeaderEvent, TransportError> {
        de(self.call("blockchain.headers.subscribe", json!([])).await?)
    }

    /// The hex-encoded 80-byte header at `height`.
    async fn block_header(
        &self,
        height: u32,
    ) -> Result<String, TransportError> {
        de(self.call("blockchain.block.header", json!([height])).await?)
    }

    /// Subscribe to a script-hash; returns its current state (null when
    /// the script has no history).
    async fn scripthash_subscribe(
        &self,
        scripthash: &str,
    ) -> Result<Option<String>, TransportError> {
        de(self
            .call("blockchain.scripthash.subscribe", json!([scripthash]))
            .await?)
    }

    async fn scripthash_listunspent(
        &self,
        scripthash: &str,
    ) -> Result<Vec<Unspent>, TransportError> {
        de(self
            .call("blockchain.scripthash.listunspent", json!([scripthash]))
            .await?)
    }

    async fn scripthash_get_balance(
        &self,
        scripthash: &str,
    ) -> Result<ScriptBalance, TransportError> {
        de(self
            .call("blockchain.scripthash.get_balance", json!([scripthash]))
            .await?)
    }

    async fn scripthash_get_history(
        &self,
        scripthash: &str,
    ) -> Result<Vec<HistoryEntry>, TransportError> {
        de(self
            .call("blockchain.scripthash.get_history", json!([scripthash]))
            .await?)
    }

    /// The raw transaction, hex-encoded.
    async fn transaction_get(
        &self,
        txid: &str,
    ) -> Result<String, TransportError> {
        de(self
            .call("blockchain.transaction.get", json!([txid, false]))
            .await?)
    }

    /// The server-decoded transaction; shape is server-defined and passed
    /// through verbatim.
    async fn transaction_get_verbose(
        &self,
        txid: &str,
    ) -> Result<Value, TransportError> {
        self.call("blockchain.transaction.get", json!([txid, true]))
            .await
    }

    /// Broadcast a raw transaction; returns the txid on success.
    async fn transaction_broadcast(
        &self,
        raw_hex: &str,
    ) -> Result<String, TransportError> {
        de(self
            .call("blockchain.transaction.broadcast", json!([raw_hex]))
            .await?)
    }

    /// Estimated fee in BTC/kvB for confirmation within `conf_target`
    /// blocks, or a negative value when the server has no estimate.
    async fn estimate_fee(
        &self,
        conf_target: u32,
    ) -> Result<f64, TransportError> {
        de(self
            .call("blockchain.estimatefee", json!([conf_target]))
            .await?)
    }
}

#[async_trait]
impl ElectrumApi for ElectrumSocket {
    async fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        ElectrumSocket::call(self, method, params).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn history_heights() {
        let confirmed = HistoryEntry {
            height: 100,
            tx_hash: "00".into(),
            fee: None,
        };
        assert_eq!(confirmed.confirmed_height(), Some(100));

        let mempool = HistoryEntry {
            height: 0,
            tx_hash: "00".into(),
            fee: Some(226),
        };
        assert_eq!(mempool.confirmed_height(), None);

        let unconf_parents = HistoryEntry {
            height: -1,
            tx_hash: "00".into(),
            fee: Some(226),
        };
        assert_eq!(unconf_parents.confirmed_height(), None);
    }
}
