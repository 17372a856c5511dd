//! `voltbridge-cockpit` – The Viewer-Facing Bridge
//!
//! Boots one HTTP + WebSocket listener (default port `5177`) that:
//!
//! 1. **Streams** channel telemetry to every connected browser tab as
//!    `{"type":"channelUpdate", ...}` messages, starting with a full
//!    snapshot on connect.
//!
//! 2. **Forwards** viewer requests of the form `{"command": "ChStatus_all"}`
//!    to the producer and acknowledges successful sends to the issuing tab.
//!
//! 3. **Serves** the static dashboard and the `/api/contact` endpoint.
//!
//! While the producer is unreachable a [`SyntheticFeed`] keeps the
//! dashboard moving with small random-walk updates.
//!
//! # Usage
//!
//! ```rust,no_run
//! use voltbridge_cockpit::{Bridge, BridgeSettings};
//! use voltbridge_middleware::shutdown;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_trigger, signal) = shutdown::channel();
//!     Bridge::new(BridgeSettings::default())
//!         .run(signal)
//!         .await
//!         .expect("bridge failed");
//! }
//! ```

pub mod bridge;
pub mod server;
pub mod synthetic;

pub use bridge::{Bridge, BridgeSettings, ViewerLink};
pub use server::{CockpitServer, DEFAULT_PORT, DEFAULT_WS_PATH};
pub use synthetic::SyntheticFeed;
