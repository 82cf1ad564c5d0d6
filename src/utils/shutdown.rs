//! Cooperative shutdown signalling for long-running loops.
//!
//! Loops hold a `watch::Receiver<bool>`; flipping the value to `true` (or
//! dropping the sender) asks every loop to stop at its next suspension point.

use std::time::Duration;

use tokio::sync::watch;

/// Receiving half handed to each loop.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Creates a shutdown channel in the "running" state.
pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    watch::channel(false)
}

/// Sleeps for `duration` unless shutdown is requested first.
///
/// Returns `true` if the caller should stop.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut ShutdownSignal) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
