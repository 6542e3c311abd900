mod acknowledged_message;
mod stream;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    stream::{AsyncStream, DEFAULT_CONNECT_TIMEOUT},
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
///
/// If the runtime is still running, this will spawn the future onto it. Otherwise (e.g. when
/// called from a `Drop` implementation during shutdown), the future is silently dropped.
pub(crate) fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
    }
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::network_timeout())
}
