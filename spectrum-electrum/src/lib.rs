//! The Electrum transport: a self-healing, multiplexed request/response +
//! notification channel over a single TCP (optionally TLS, optionally
//! SOCKS5h-proxied) connection.
//!
//! [`ElectrumSocket`] owns the connection. Four cooperating workers (writer,
//! reader, pinger, notifier) move bytes and route frames; a supervisor task
//! recreates the socket and the workers whenever any of them dies, and
//! invokes a reconnect callback so the application can re-subscribe.
//!
//! [`ElectrumApi`] is the typed client surface; the indexer and RPC layers
//! depend on the trait rather than the socket so tests can script a server.

pub mod api;
pub mod config;
mod conn;
pub mod protocol;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use api::ElectrumApi;
pub use config::{ElectrumConfig, Socks5Proxy};
pub use protocol::{Notification, ServerError};
pub use transport::{ElectrumSocket, Status, TransportError};
