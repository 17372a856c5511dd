//! `voltbridge-middleware` – The Plumbing
//!
//! Moves telemetry from the battery-pack producer to browser viewers
//! without caring how either end renders it.
//!
//! # Modules
//!
//! - [`codec`] – 8-hex-digit length-prefixed framing used on the producer
//!   TCP link.
//! - [`store`] – Thread-safe per-channel latest-measurement table.
//! - [`hub`] – Viewer registry and bounded fan-out of JSON updates.
//! - [`producer`] – Reconnecting TCP client that feeds the store and hub and
//!   carries viewer commands upstream.
//! - [`producer_sim`] – TCP server that imitates the producer for demos and
//!   tests.
//! - [`adapter`] – [`CommandSink`] seam between viewers and the producer.
//! - [`shutdown`] – Watch-channel shutdown signal shared by every task.

pub mod adapter;
pub mod codec;
pub mod hub;
pub mod producer;
pub mod producer_sim;
pub mod shutdown;
pub mod store;

pub use adapter::CommandSink;
pub use hub::{Hub, HubSettings, Viewer};
pub use producer::{LinkState, ProducerClient, ProducerSettings};
pub use producer_sim::ProducerSim;
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use store::ChannelStore;
