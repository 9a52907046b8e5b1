//! Shared leaf crate for the spectrum workspace: satoshi amounts, hex,
//! chain detection, RNG, and small tokio synchronization utilities used by
//! the transport and indexer.

pub mod amount;
pub mod chain;
pub mod hex;
pub mod notify;
pub mod rng;
pub mod shutdown;
pub mod task;
