//! The seam between viewers and the producer link.
//!
//! Viewer handlers never hold the TCP client directly; they forward commands
//! through a [`CommandSink`]. [`ProducerClient`][crate::producer::ProducerClient]
//! is the production implementation; tests substitute a recorder.

use async_trait::async_trait;
use voltbridge_types::BridgeError;

/// Anything that can carry a viewer command to the producer.
///
/// # Contract
///
/// * `send_command` delivers `command` once. It fails with
///   [`BridgeError::NotConnected`] when there is no live link, and the
///   caller decides what to do; implementations never retry on their own.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, command: &str) -> Result<(), BridgeError>;
}
