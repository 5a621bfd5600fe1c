//! The future returned by every asynchronous VM operation.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::error::VmError;

/// Settles exactly once: on the matching reply, on the boot deadline, or when
/// the VM stops.
#[must_use = "a pending operation does nothing observable unless awaited"]
pub struct Pending<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    pub(crate) fn new(future: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self { inner: future.boxed() }
    }

    pub(crate) fn ready(result: Result<T>) -> Self {
        Self::new(futures::future::ready(result))
    }

    /// Waits on a tunnel and decodes its payload with `decode`.
    pub(crate) fn reply(
        rx: oneshot::Receiver<Result<Value>>,
        decode: impl FnOnce(Value) -> Result<T> + Send + 'static,
    ) -> Self {
        Self::new(async move {
            match rx.await {
                Ok(Ok(payload)) => decode(payload),
                Ok(Err(e)) => Err(e),
                // The tunnel was dropped with the VM.
                Err(_) => Err(VmError::Stopped),
            }
        })
    }
}

impl<T: DeserializeOwned + Send + 'static> Pending<T> {
    /// Waits on a tunnel and deserializes its payload as `T`.
    pub(crate) fn decoded(rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self::reply(rx, |payload| {
            serde_json::from_value(payload).map_err(|e| VmError::Decode(e.to_string()))
        })
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}
