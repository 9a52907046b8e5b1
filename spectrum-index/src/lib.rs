//! The indexing engine: turns Electrum script-hash subscriptions and
//! history responses into a consistent local view of wallets, scripts,
//! UTXOs and transactions.
//!
//! The [`NotificationRouter`] runs under the transport's notifier worker
//! and offloads reconcile jobs to the [`Indexer`]'s work queue; the
//! [`Indexer`] serializes writes per script and keeps the shared
//! [`ChainState`] (tip, chain, sync progress) current.

pub mod chain;
pub mod headers;
pub mod indexer;
pub mod router;

pub use chain::ChainState;
pub use indexer::{IndexError, Indexer, ReconcileJob};
pub use router::NotificationRouter;
