//! Thin wrappers around the async runtime: background task spawning with a
//! joinable, abortable handle.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{Error, Result};

/// Spawns a task in the background to run a future. The task keeps running
/// when the handle is dropped.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle(tokio::task::spawn(fut))
}

/// Handle to a spawned task. Awaiting it yields the task's output; `abort`
/// cancels the task at its next suspension point.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.map_err(|e| Error::internal(format!("task failed: {}", e))))
    }
}
