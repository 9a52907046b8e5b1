//! A thin wrapper around [`tokio::task::JoinHandle`] that:
//!
//! (1) propagates panics instead of catching them, and
//! (2) carries a task name for debuggability: the transport's workers and
//!     the indexer's sync tasks all log their name and status when they
//!     finish.
//!
//! `#[must_use]` encourages joining spawned tasks; [`SpTask::detach`] makes
//! it explicit when a task is intentionally left running on its own.

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// A named task handle.
#[must_use]
pub struct SpTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T: Send + 'static> SpTask<T> {
    /// Spawns a named task which inherits from the current span.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> SpTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        let span = tracing::Span::current();
        SpTask {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the task. Awaiting an aborted task that did not finish first
    /// panics, mirroring the panic-propagation behavior below; prefer
    /// cooperative shutdown via a flag or channel.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Detach the task, letting it run until completion on its own. The
    /// task's result is logged when it finishes.
    pub fn detach(self) {
        let name = self.name.clone();
        let task = self.task;
        // A small anonymous reaper preserves panic visibility.
        tokio::spawn(async move {
            match task.await {
                Ok(_) => debug!("Detached task finished: {name}"),
                Err(e) if e.is_cancelled() =>
                    debug!("Detached task cancelled: {name}"),
                Err(e) => warn!("Detached task panicked: {name}: {e}"),
            }
        });
    }
}

impl<T> Future for SpTask<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(val)) => Poll::Ready(val),
            Poll::Ready(Err(join_err)) => match join_err.try_into_panic() {
                // Resume the panic on the task that polled us.
                Ok(panic_reason) =>
                    std::panic::resume_unwind(panic_reason),
                Err(join_err) => panic!(
                    "Task `{}` was cancelled: {join_err:#}",
                    self.name
                ),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}
