//! Process-wide shutdown signal.
//!
//! A [`tokio::sync::watch`] channel carrying `true` once shutdown has been
//! requested. Long-running tasks take a [`ShutdownSignal`] and race it
//! against their own work with [`requested`].

use tokio::sync::watch;

pub type ShutdownSignal = watch::Receiver<bool>;
pub type ShutdownTrigger = watch::Sender<bool>;

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    watch::channel(false)
}

/// Resolve once shutdown is requested or the trigger is dropped.
pub async fn requested(signal: &mut ShutdownSignal) {
    let _ = signal.wait_for(|stop| *stop).await;
}

/// Non-blocking check.
pub fn is_requested(signal: &ShutdownSignal) -> bool {
    *signal.borrow()
}
