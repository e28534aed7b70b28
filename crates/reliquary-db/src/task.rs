//! Background execution of storage operations.
//!
//! Every CRUD call runs its blocking database work on the tokio blocking
//! pool and hands back a [`Pending`] right away. The work starts at submission,
//! not at first poll, and runs to completion even if the handle is dropped.
//! Errors never escape synchronously; they complete the `Pending`.

use reliquary_core::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// Handle to a submitted storage operation.
#[must_use = "a Pending does nothing visible unless awaited"]
pub struct Pending<T> {
    state: State<T>,
}

enum State<T> {
    Running(JoinHandle<Result<T>>),
    Failed(Option<Error>),
}

impl<T> Pending<T> {
    /// A handle that completes with `error`.
    pub fn failed(error: Error) -> Self {
        Self {
            state: State::Failed(Some(error)),
        }
    }

    /// Whether the operation has finished.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Running(handle) => handle.is_finished(),
            State::Failed(_) => true,
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Running(handle) => Pin::new(handle).poll(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(Error::internal(format!("storage task failed: {e}"))),
            }),
            State::Failed(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or_else(|| Error::internal("storage task polled after completion")))),
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Run `work` on the blocking pool of the current tokio runtime.
///
/// Failures are logged here as well as returned, so an operation whose
/// handle nobody awaits still leaves a trace.
pub fn submit<T, F>(operation: &'static str, work: F) -> Pending<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            return Pending::failed(Error::internal(format!(
                "{operation}: no tokio runtime available"
            )))
        }
    };

    let task = handle.spawn_blocking(move || {
        let result = work();
        if let Err(e) = &result {
            tracing::warn!(operation, "Storage operation failed: {e}");
        }
        result
    });

    Pending {
        state: State::Running(task),
    }
}
