//! Reconnecting TCP client for the telemetry producer.
//!
//! [`ProducerClient`] owns the single outbound connection to the producer
//! and drives it through
//! `Disconnected → Connecting → Connected → Disconnected` for as long as the
//! process runs:
//!
//! 1. **Connect** with a bounded timeout. On failure, wait the reconnect
//!    backoff (plus random jitter) and try again.
//! 2. **Read** frames on a dedicated task with a per-frame deadline. Bulk
//!    snapshots and per-channel details are applied to the
//!    [`ChannelStore`] and the new state is broadcast through the [`Hub`].
//!    Undecodable frames are logged and skipped; transport or framing
//!    failures end the connection.
//! 3. **Poll** the producer with `ChStatus_all` on a fixed interval so bulk
//!    updates keep arriving without a viewer asking.
//!
//! Outbound commands go through [`ProducerClient::send_command`] and fail
//! fast with [`BridgeError::NotConnected`] while no connection is live.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::Interval;
use tracing::{debug, info, warn};
use voltbridge_types::{BridgeError, ProducerCommand, ProducerMessage, ViewerMessage};

use crate::adapter::CommandSink;
use crate::codec;
use crate::hub::Hub;
use crate::shutdown::{self, ShutdownSignal};
use crate::store::ChannelStore;

/// Default producer address.
pub const DEFAULT_PRODUCER_ADDR: &str = "127.0.0.1:1688";

/// Lifecycle of the producer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Timing and addressing for a [`ProducerClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    pub addr: String,
    pub connect_timeout: Duration,
    /// Longest silence tolerated on a live connection before it is recycled.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub reconnect_jitter: Duration,
    /// `None` disables status polling.
    pub poll_interval: Option<Duration>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_PRODUCER_ADDR.to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(10),
            reconnect_jitter: Duration::from_secs(1),
            poll_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl ProducerSettings {
    /// Backoff plus a random share of the configured jitter.
    pub fn backoff_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.reconnect_jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.reconnect_backoff + Duration::from_millis(extra)
    }
}

/// The bridge's end of the producer link.
pub struct ProducerClient {
    settings: ProducerSettings,
    store: Arc<ChannelStore>,
    hub: Hub,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<LinkState>,
}

impl ProducerClient {
    pub fn new(settings: ProducerSettings, store: Arc<ChannelStore>, hub: Hub) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            settings,
            store,
            hub,
            writer: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch link state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Connect, serve, and reconnect until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        info!(addr = %self.settings.addr, "producer client started");

        while !shutdown::is_requested(&shutdown) {
            self.state.send_replace(LinkState::Connecting);

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = shutdown::requested(&mut shutdown) => break,
            };

            match connected {
                Ok(stream) => {
                    info!(addr = %self.settings.addr, "connected to producer");
                    self.serve_connection(stream, &mut shutdown).await;
                }
                Err(e) => {
                    warn!(addr = %self.settings.addr, error = %e, "failed to connect to producer");
                }
            }

            self.state.send_replace(LinkState::Disconnected);
            if shutdown::is_requested(&shutdown) {
                break;
            }

            let delay = self.settings.backoff_delay();
            info!(delay_ms = delay.as_millis() as u64, "retrying producer connection after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown::requested(&mut shutdown) => break,
            }
        }

        self.close_writer().await;
        self.state.send_replace(LinkState::Disconnected);
        info!("producer client stopped");
    }

    async fn connect(&self) -> Result<TcpStream, BridgeError> {
        let attempt = TcpStream::connect(self.settings.addr.as_str());
        let stream = tokio::time::timeout(self.settings.connect_timeout, attempt)
            .await
            .map_err(|_| {
                BridgeError::Transport(format!(
                    "connect timed out after {:?}",
                    self.settings.connect_timeout
                ))
            })?
            .map_err(|e| BridgeError::Transport(format!("connect error: {e}")))?;
        // Commands are tiny; don't let Nagle hold them back.
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Run one connection until the read task ends or shutdown fires.
    async fn serve_connection(self: &Arc<Self>, stream: TcpStream, shutdown: &mut ShutdownSignal) {
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.state.send_replace(LinkState::Connected);

        let mut read_task = tokio::spawn(Arc::clone(self).read_loop(reader));
        let mut poll = self.settings.poll_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                joined = &mut read_task => {
                    match joined {
                        Ok(Ok(())) => info!("producer closed the connection"),
                        Ok(Err(e)) => warn!(error = %e, "producer connection lost"),
                        Err(e) => warn!(error = %e, "producer read task failed"),
                    }
                    break;
                }
                _ = next_poll(&mut poll) => {
                    if let Err(e) = self.send_command(ProducerCommand::STATUS_ALL).await {
                        warn!(error = %e, "status poll failed");
                    }
                }
                _ = shutdown::requested(shutdown) => {
                    read_task.abort();
                    info!("closing producer connection for shutdown");
                    break;
                }
            }
        }

        self.close_writer().await;
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) -> Result<(), BridgeError> {
        let deadline = self.settings.read_timeout;
        loop {
            let frame = tokio::time::timeout(deadline, codec::read_frame(&mut reader))
                .await
                .map_err(|_| BridgeError::Transport(format!("no frame within {deadline:?}")))??;
            let Some(payload) = frame else {
                return Ok(());
            };
            self.handle_payload(&payload);
        }
    }

    /// Apply one producer frame to the store and broadcast the result.
    pub fn handle_payload(&self, payload: &[u8]) {
        match ProducerMessage::parse(payload) {
            Ok(ProducerMessage::Bulk(bulk)) => {
                self.store.apply_bulk(&bulk.channels, Utc::now());
                debug!(channels = bulk.channels.len(), total_v = bulk.total_voltage, "applied bulk snapshot");
                self.broadcast_snapshot();
            }
            Ok(ProducerMessage::Detail(detail)) => {
                if self.store.apply_detail(&detail, Utc::now()) {
                    debug!(channel = detail.ch, "applied channel detail");
                    self.broadcast_snapshot();
                } else {
                    debug!(channel = detail.ch, "detail for unknown channel ignored");
                }
            }
            Ok(ProducerMessage::Fault(reason)) => {
                warn!(%reason, "producer rejected a command");
            }
            Err(e) => {
                warn!(error = %e, len = payload.len(), "discarding producer frame");
            }
        }
    }

    fn broadcast_snapshot(&self) {
        self.hub.broadcast(ViewerMessage::ChannelUpdate {
            channels: self.store.snapshot(),
        });
    }

    /// Frame `command` and write it to the live connection.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::NotConnected`] – no live connection.
    /// * [`BridgeError::Transport`] – the write failed or timed out.
    pub async fn send_command(&self, command: &str) -> Result<(), BridgeError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::NotConnected)?;
        let deadline = self.settings.write_timeout;
        tokio::time::timeout(deadline, codec::write_frame(writer, command.as_bytes()))
            .await
            .map_err(|_| BridgeError::Transport(format!("write timed out after {deadline:?}")))??;
        debug!(command, "sent producer command");
        Ok(())
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[async_trait]
impl CommandSink for ProducerClient {
    async fn send_command(&self, command: &str) -> Result<(), BridgeError> {
        ProducerClient::send_command(self, command).await
    }
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
