use std::future::Future;

use tokio::task::JoinHandle;

/// Background task that keeps a lease alive.
///
/// The task is aborted when this value is dropped, so a lease is never
/// renewed past the lifetime of the handle that owns it, even when the
/// handle is dropped without being released.
pub(crate) struct RenewalTask(JoinHandle<()>);

impl RenewalTask {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    pub(crate) fn stop(&self) {
        self.0.abort();
    }
}

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
