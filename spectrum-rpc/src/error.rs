//! RPC-level errors and their Bitcoin Core integer codes.
//!
//! The code table must match Core's `src/rpc/protocol.h` where clients
//! depend on it: -4 wallet exists / insufficient funds, -5 invalid txid,
//! -8 bad parameter, -18 wallet not loaded, -19 wallet not specified,
//! -22 invalid tx format, -32601 method not found, -500 generic, -1 misc.

use serde_json::{json, Value};
use spectrum_electrum::TransportError;
use spectrum_store::{db::StoreError, txcache::TxCacheError};
use spectrum_wallet::WalletError;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Method not found ({0})")]
    NotFound(String),
    #[error("Wallet file not specified")]
    WalletMissing,
    #[error("Requested wallet {0} does not exist or is not loaded")]
    WalletNotLoaded(String),
    #[error("Wallet already exists")]
    WalletExists,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Invalid or non-wallet transaction id")]
    InvalidTxid,
    #[error("{0}")]
    BadArgs(String),
    #[error("{0}")]
    InvalidTx(String),
    #[error("{0}")]
    Generic(String),
    #[error("{0}")]
    Misc(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            Self::NotFound(_) => -32601,
            Self::WalletMissing => -19,
            Self::WalletNotLoaded(_) => -18,
            Self::WalletExists | Self::InsufficientFunds => -4,
            Self::InvalidTxid => -5,
            Self::BadArgs(_) => -8,
            Self::InvalidTx(_) => -22,
            Self::Generic(_) => -500,
            Self::Misc(_) => -1,
        }
    }

    /// The `{code, message}` object of an error response.
    pub fn to_error_object(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl From<WalletError> for RpcError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::WalletExists => Self::WalletExists,
            WalletError::InsufficientFunds => Self::InsufficientFunds,
            WalletError::InvalidTxid => Self::InvalidTxid,
            WalletError::BadParam(message) => Self::BadArgs(message),
            other => Self::Generic(format!("{other:#}")),
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Generic(e.to_string())
    }
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::WalletExists => Self::WalletExists,
            other => Self::Generic(other.to_string()),
        }
    }
}

impl From<TxCacheError> for RpcError {
    fn from(e: TxCacheError) -> Self {
        match e {
            TxCacheError::NotCached(_) => Self::InvalidTxid,
            other => Self::Generic(other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_match_core() {
        assert_eq!(RpcError::NotFound("nope".into()).code(), -32601);
        assert_eq!(RpcError::WalletMissing.code(), -19);
        assert_eq!(RpcError::WalletNotLoaded("w".into()).code(), -18);
        assert_eq!(RpcError::WalletExists.code(), -4);
        assert_eq!(RpcError::InsufficientFunds.code(), -4);
        assert_eq!(RpcError::InvalidTxid.code(), -5);
        assert_eq!(RpcError::BadArgs("p".into()).code(), -8);
        assert_eq!(RpcError::InvalidTx("t".into()).code(), -22);
        assert_eq!(RpcError::Generic("g".into()).code(), -500);
        assert_eq!(RpcError::Misc("m".into()).code(), -1);
    }

    #[test]
    fn error_object_shape() {
        let obj =
            RpcError::WalletMissing.to_error_object();
        assert_eq!(obj["code"], -19);
        assert_eq!(obj["message"], "Wallet file not specified");
    }
}
