//! The JSON-RPC translation layer: a Bitcoin-Core-compatible method
//! surface answered from the local index plus direct Electrum calls.
//!
//! [`Spectrum`] is the process-wide lifecycle object wiring the transport,
//! store, indexer and wallet service together; the dispatcher maps
//! incoming `{method, params, id}` requests (single or batch) onto it.
//! Outward HTTP framing is the embedder's concern; the wallet name arrives
//! here as an optional call-context string.

pub mod dispatcher;
pub mod error;
pub mod node;
pub mod params;

mod chain_methods;
mod wallet_methods;

pub use dispatcher::{RpcRequest, RpcResponse};
pub use error::RpcError;
pub use node::{Spectrum, SpectrumConfig};
