//! Stopping background tasks.

use tokio::task::JoinHandle;

/// Cancels a background task, and waits for it to stop.
///
/// A task which panicked before being cancelled re-raises its panic here.
pub(crate) async fn abort_and_join(handle: JoinHandle<()>) {
    handle.abort();
    match handle.await {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) => match err.try_into_panic() {
            Ok(payload) => std::panic::resume_unwind(payload),
            Err(err) => panic!("Background task failed: {err}"),
        },
    }
}
