//! Wallet-level services: wallet and descriptor management (creation,
//! import, script pools, addresses, labels) and the PSBT builder.

pub mod descriptors;
pub mod psbt;
pub mod service;

pub use psbt::{FundedPsbt, InputRef, ProcessedPsbt, PsbtOptions};
pub use service::{WalletError, WalletService};
