//! Persistence for the gateway: the transactional entity store (wallets,
//! descriptors, scripts, UTXOs, transactions) and the content-addressed
//! raw-transaction blob cache.

pub mod db;
pub mod models;
pub mod txcache;

pub use db::{Db, StoreError, WriteTxn};
pub use models::{
    electrum_scripthash, Descriptor, Script, Tx, TxCategory, Utxo, Wallet,
};
pub use txcache::{TxCache, TxCacheError};
