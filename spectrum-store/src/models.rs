//! Entity rows held by the store. Scripts reference their parent wallet
//! and (for pool scripts) descriptor; UTXOs and transactions reference
//! both their script and wallet. All amounts are signed satoshis.

use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};
use spectrum_common::{amount::Amount, hex};

/// Compute the Electrum index key for a script-pubkey:
/// `sha256(script_bytes)` reversed, hex-encoded.
pub fn electrum_scripthash(script: &[u8]) -> String {
    let mut digest = sha256::Hash::hash(script).to_byte_array();
    digest.reverse();
    hex::encode(&digest)
}

/// A wallet. Never implicitly destroyed; owns descriptors, scripts, UTXOs
/// and transactions by parent reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    /// Unique across the store.
    pub name: String,
    pub private_keys_enabled: bool,
    /// 32-byte hot-wallet seed, hex (potentially encrypted by the caller).
    pub seed: Option<String>,
    /// Salt when a password is in use.
    pub password_salt: Option<String>,
}

/// A descriptor tracked by a wallet.
///
/// At most one descriptor per `(wallet, internal)` pair is `active`;
/// importing a new active descriptor deactivates the previous one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: i64,
    pub wallet_id: i64,
    /// Whether new addresses are handed out from this descriptor.
    pub active: bool,
    /// Change (true) vs receive (false).
    pub internal: bool,
    /// Public descriptor string.
    pub descriptor: String,
    /// The original descriptor when it carried private keys.
    pub private_descriptor: Option<String>,
    /// Address index used by the next getnewaddress() call.
    pub next_index: u32,
}

/// A script-pubkey the wallet watches. We store script bytes instead of
/// addresses as the store is chain-agnostic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Script {
    pub id: i64,
    pub wallet_id: i64,
    /// Null for label-only external scripts.
    pub descriptor_id: Option<i64>,
    /// Derivation index when this is a pool script; null otherwise.
    pub index: Option<u32>,
    /// Raw script bytes, hex.
    pub script: String,
    /// Electrum subscription key, see [`electrum_scripthash`].
    pub scripthash: String,
    /// Last status reported by the Electrum server; null = no history.
    pub state: Option<String>,
    /// Confirmed balance in sat.
    pub confirmed: Amount,
    /// Unconfirmed balance in sat.
    pub unconfirmed: Amount,
    pub label: Option<String>,
}

/// An unspent output. The set of UTXO rows for a script mirrors exactly
/// what the Electrum server reports via `listunspent` for its script-hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Utxo {
    pub id: i64,
    pub wallet_id: i64,
    pub script_id: i64,
    pub txid: String,
    pub vout: u32,
    /// Null while in the mempool.
    pub height: Option<u32>,
    pub amount: Amount,
    /// Frozen by `lockunspent`.
    pub locked: bool,
}

/// How a transaction relates to the script it affects.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum TxCategory {
    #[default]
    Unknown,
    Receive,
    Send,
    /// Receive to a change script; hidden from transaction listings.
    Change,
}

/// A transaction as seen from one affected script: one row per
/// `(script, txid)` pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tx {
    pub id: i64,
    pub wallet_id: i64,
    pub script_id: i64,
    pub txid: String,
    pub blockhash: Option<String>,
    pub height: Option<u32>,
    pub blocktime: Option<u64>,
    /// Any input signals BIP125 replaceability.
    pub replaceable: bool,
    pub category: TxCategory,
    /// The output index that affects this script (0 for sends).
    pub vout: u32,
    /// Signed; negative for sends.
    pub amount: Amount,
    /// Only meaningful for sends.
    pub fee: Option<Amount>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scripthash_is_reversed_sha256() {
        // P2WPKH spk for the all-zero pubkey hash.
        let spk = hex::decode("00140000000000000000000000000000000000000000")
            .unwrap();
        let scripthash = electrum_scripthash(&spk);
        // Independently: sha256, then reverse bytes.
        let forward = sha256::Hash::hash(&spk).to_byte_array();
        let mut reversed = forward;
        reversed.reverse();
        assert_eq!(scripthash, hex::encode(&reversed));
        assert_ne!(scripthash, hex::encode(&forward));
        assert_eq!(scripthash.len(), 64);
    }

    #[test]
    fn category_strings_match_core() {
        assert_eq!(TxCategory::Receive.to_string(), "receive");
        assert_eq!(TxCategory::Send.to_string(), "send");
        assert_eq!(TxCategory::Change.to_string(), "change");
        assert_eq!(TxCategory::Unknown.to_string(), "unknown");
    }
}
