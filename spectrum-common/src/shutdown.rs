//! Synchronization utility which sends a notification to all consumers
//! *once*, used for shutdown signals and for stopping a generation of
//! transport workers.
//!
//! Features:
//!
//! - Multi-producer and multi-consumer - simply clone to get another handle.
//! - Every clone observes a signal at-most-once. If the signal has already
//!   been sent, new clones can still observe it once.
//! - Consumers can receive signals that were sent prior to 'subscribing' to
//!   the channel (unlike [`tokio::sync::broadcast`]).
//! - It is safe to send a signal multiple times (e.g. by accident).
//!
//! The underlying implementation (ab)uses the fact that calling [`acquire`]
//! on a [`Semaphore`] with 0 permits only returns once the [`Semaphore`] has
//! been closed. Closing the [`Semaphore`] is equivalent to sending a signal,
//! and receiving an [`AcquireError`] from [`acquire`] is equivalent to
//! receiving one.
//!
//! [`acquire`]: Semaphore::acquire
//! [`AcquireError`]: tokio::sync::AcquireError

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A send-once/observe-once notification channel.
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Send a signal, causing all actors waiting on this channel to complete
    /// their call to [`recv`](Self::recv).
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for a signal. Completes immediately if one was already sent.
    pub async fn recv(&self) {
        // The only way to get an error here is for the semaphore to have
        // been closed, i.e. for a signal to have been sent.
        let _ = self.inner.acquire().await;
    }

    /// Immediately returns whether a signal has been sent.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn multiple_receivers_observe_signal() {
        let shutdown = ShutdownChannel::new();
        let shutdown2 = shutdown.clone();
        assert!(!shutdown.try_recv());

        shutdown.send();
        // Sending twice is fine.
        shutdown.send();

        shutdown.recv().await;
        shutdown2.recv().await;
        assert!(shutdown2.try_recv());

        // Clones created after the signal still observe it.
        let shutdown3 = shutdown.clone();
        shutdown3.recv().await;
    }
}
