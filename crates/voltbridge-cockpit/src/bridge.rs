//! [`Bridge`] – wires the store, hub, producer link, synthetic feed, and
//! HTTP/WebSocket server into one running system.
//!
//! Each browser tab is served by [`serve_viewer`]: a writer task drains the
//! viewer's hub queue into the socket while the calling task reads
//! `{"command": "..."}` requests and forwards them upstream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use voltbridge_middleware::shutdown::{self, ShutdownSignal};
use voltbridge_middleware::store::DEFAULT_CHANNEL_COUNT;
use voltbridge_middleware::{
    ChannelStore, CommandSink, Hub, HubSettings, ProducerClient, ProducerSettings,
};
use voltbridge_types::{BridgeError, ViewerId, ViewerMessage, ViewerRequest};

use crate::server::{CockpitServer, DEFAULT_PORT, DEFAULT_WS_PATH};
use crate::synthetic::{DEFAULT_SYNTHETIC_INTERVAL, SyntheticFeed};

/// Everything needed to start a [`Bridge`].
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    pub http_port: u16,
    pub ws_path: String,
    pub static_dir: PathBuf,
    pub channel_count: u16,
    pub producer: ProducerSettings,
    pub hub: HubSettings,
    pub synthetic_interval: Duration,
    /// How long to wait for tasks to wind down before abandoning them.
    pub shutdown_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            static_dir: PathBuf::from("./static"),
            channel_count: DEFAULT_CHANNEL_COUNT,
            producer: ProducerSettings::default(),
            hub: HubSettings::default(),
            synthetic_interval: DEFAULT_SYNTHETIC_INTERVAL,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// The running telemetry bridge.
pub struct Bridge {
    settings: BridgeSettings,
    store: Arc<ChannelStore>,
}

impl Bridge {
    pub fn new(settings: BridgeSettings) -> Self {
        let store = Arc::new(ChannelStore::new(settings.channel_count));
        Self { settings, store }
    }

    /// Bind `0.0.0.0:<http_port>` and [`serve`](Self::serve) until
    /// `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the HTTP listener cannot bind.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), BridgeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.http_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Run every component on an already-bound HTTP listener.
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownSignal) {
        let Self { settings, store } = self;

        let (hub, hub_task) = Hub::spawn(Arc::clone(&store), settings.hub);
        let producer = Arc::new(ProducerClient::new(
            settings.producer.clone(),
            Arc::clone(&store),
            hub.clone(),
        ));
        let feed = SyntheticFeed::new(
            Arc::clone(&store),
            hub.clone(),
            producer.subscribe_state(),
            settings.synthetic_interval,
        );
        let viewers = ViewerLink::new(
            hub.clone(),
            Arc::clone(&producer) as Arc<dyn CommandSink>,
            settings.producer.write_timeout,
        );
        let server = CockpitServer::new(viewers)
            .with_ws_path(settings.ws_path.clone())
            .with_static_dir(settings.static_dir.clone());

        let producer_task = tokio::spawn(Arc::clone(&producer).run(shutdown.clone()));
        let feed_task = tokio::spawn(feed.run(shutdown.clone()));

        info!(
            channels = store.len(),
            producer = %settings.producer.addr,
            "bridge started"
        );
        server.serve(listener, shutdown).await;

        info!("bridge shutting down");
        hub.shutdown().await;
        let drain = async {
            let _ = producer_task.await;
            let _ = feed_task.await;
            let _ = hub_task.await;
        };
        if tokio::time::timeout(settings.shutdown_timeout, drain).await.is_err() {
            warn!(
                timeout_ms = settings.shutdown_timeout.as_millis() as u64,
                "shutdown timed out, abandoning remaining tasks"
            );
        }
        info!("bridge stopped");
    }
}

// ---------------------------------------------------------------------------
// Viewer sessions
// ---------------------------------------------------------------------------

/// What a viewer session needs from the rest of the bridge.
#[derive(Clone)]
pub struct ViewerLink {
    hub: Hub,
    commands: Arc<dyn CommandSink>,
    write_timeout: Duration,
}

impl ViewerLink {
    pub fn new(hub: Hub, commands: Arc<dyn CommandSink>, write_timeout: Duration) -> Self {
        Self {
            hub,
            commands,
            write_timeout,
        }
    }
}

/// Serve one upgraded WebSocket until the viewer leaves, its socket fails,
/// the hub drops it, or `shutdown` fires.
pub async fn serve_viewer<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    link: ViewerLink,
    mut shutdown: ShutdownSignal,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let viewer = match link.hub.register().await {
        Ok(viewer) => viewer,
        Err(e) => {
            warn!(%peer, error = %e, "viewer rejected");
            return;
        }
    };
    let id = viewer.id;
    let mut outbound = viewer.outbound;
    info!(%peer, viewer = %id, "viewer session started");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let write_timeout = link.write_timeout;

    // ── Downstream: hub queue → browser ─────────────────────────────────────
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let send = ws_tx.send(Message::text(frame.to_string()));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(viewer = %id, error = %e, "viewer write failed");
                    return;
                }
                Err(_) => {
                    warn!(viewer = %id, "viewer write timed out");
                    return;
                }
            }
        }
        // Queue closed by the hub.
        let _ = tokio::time::timeout(write_timeout, ws_tx.send(Message::Close(None))).await;
    });

    // ── Upstream: browser → producer ────────────────────────────────────────
    loop {
        tokio::select! {
            _ = &mut writer => break,
            _ = shutdown::requested(&mut shutdown) => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_viewer_text(text.as_str(), id, &link).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(viewer = %id, error = %e, "viewer read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    link.hub.unregister(id).await;
    if !writer.is_finished() {
        let _ = tokio::time::timeout(write_timeout, &mut writer).await;
    }
    info!(%peer, viewer = %id, "viewer session ended");
}

/// Parse one viewer text message and forward its command, if any.
///
/// Malformed JSON and forwarding failures are logged; the viewer stays
/// connected either way. A successful forward is acknowledged to the
/// issuing viewer only.
pub(crate) async fn handle_viewer_text(text: &str, id: ViewerId, link: &ViewerLink) {
    let request: ViewerRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(viewer = %id, error = %e, "malformed viewer message");
            return;
        }
    };
    let Some(command) = request.command() else {
        debug!(viewer = %id, "viewer message without command");
        return;
    };

    match link.commands.send_command(command).await {
        Ok(()) => {
            info!(viewer = %id, command, "command forwarded");
            link.hub.send_to(
                id,
                ViewerMessage::CommandAck {
                    command: command.to_string(),
                },
            );
        }
        Err(e) => warn!(viewer = %id, command, error = %e, "command not forwarded"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_tungstenite::connect_async;
    use voltbridge_middleware::{ProducerSim, Viewer};
    use voltbridge_types::ChannelStatus;

    /// Records commands; fails with `NotConnected` when `offline`.
    #[derive(Default)]
    struct RecordingSink {
        offline: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(&self, command: &str) -> Result<(), BridgeError> {
            if self.offline {
                return Err(BridgeError::NotConnected);
            }
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    async fn setup(sink: Arc<RecordingSink>) -> (ViewerLink, Viewer) {
        let store = Arc::new(ChannelStore::new(4));
        let (hub, _actor) = Hub::spawn(store, HubSettings::default());
        let mut viewer = hub.register().await.unwrap();
        viewer.outbound.recv().await.unwrap(); // initial snapshot
        let link = ViewerLink::new(hub, sink, Duration::from_secs(1));
        (link, viewer)
    }

    // ── Inbound message handling ──────────────────────────────────────────────

    #[tokio::test]
    async fn command_is_forwarded_and_acknowledged() {
        let sink = Arc::new(RecordingSink::default());
        let (link, mut viewer) = setup(Arc::clone(&sink)).await;

        handle_viewer_text(r#"{"command":"ChStatus_all"}"#, viewer.id, &link).await;

        assert_eq!(*sink.sent.lock().unwrap(), vec!["ChStatus_all".to_string()]);
        let ack: ViewerMessage =
            serde_json::from_str(&viewer.outbound.recv().await.unwrap()).unwrap();
        assert_eq!(
            ack,
            ViewerMessage::CommandAck {
                command: "ChStatus_all".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_forward_is_not_acknowledged() {
        let sink = Arc::new(RecordingSink {
            offline: true,
            ..Default::default()
        });
        let (link, mut viewer) = setup(sink).await;

        handle_viewer_text(r#"{"command":"ChStatus_03"}"#, viewer.id, &link).await;

        assert_eq!(link.hub.viewer_count().await, 1);
        assert!(viewer.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_missing_and_malformed_commands_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let (link, mut viewer) = setup(Arc::clone(&sink)).await;

        for text in [r#"{"command":""}"#, r#"{"other":1}"#, "not json", "[1,2]"] {
            handle_viewer_text(text, viewer.id, &link).await;
        }

        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(link.hub.viewer_count().await, 1);
        assert!(viewer.outbound.try_recv().is_err());
    }

    // ── End to end ────────────────────────────────────────────────────────────

    async fn next_text<S>(ws: &mut WebSocketStream<S>) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text.as_str().to_owned(),
                _ => continue,
            }
        }
    }

    fn test_settings(producer_addr: String) -> BridgeSettings {
        BridgeSettings {
            channel_count: 8,
            producer: ProducerSettings {
                addr: producer_addr,
                connect_timeout: Duration::from_millis(500),
                reconnect_backoff: Duration::from_millis(50),
                reconnect_jitter: Duration::ZERO,
                poll_interval: Some(Duration::from_millis(100)),
                ..ProducerSettings::default()
            },
            synthetic_interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(2),
            static_dir: PathBuf::from("/nonexistent-voltbridge-static"),
            ..BridgeSettings::default()
        }
    }

    #[tokio::test]
    async fn viewer_sees_producer_data_and_gets_command_acks() {
        let sim = ProducerSim::bind("127.0.0.1:0").await.unwrap();
        let producer_addr = sim.local_addr().unwrap().to_string();
        let (stop, signal) = shutdown::channel();
        tokio::spawn(sim.run(signal.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = listener.local_addr().unwrap();
        let bridge = tokio::spawn(Bridge::new(test_settings(producer_addr)).serve(listener, signal));

        let (mut ws, _) = connect_async(format!("ws://{http_addr}/ws")).await.unwrap();

        // Initial snapshot carries placeholders; polling soon brings real statuses.
        let alarm = loop {
            let msg: ViewerMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
            if let ViewerMessage::ChannelUpdate { channels } = msg {
                if let Some(m) = channels.values().find(|m| m.status == ChannelStatus::Alarm) {
                    break m.clone();
                }
            }
        };
        assert_eq!(alarm.voltage, 3.98);

        ws.send(Message::text(r#"{"command":"ChStatus_06"}"#)).await.unwrap();
        loop {
            let msg: ViewerMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
            if let ViewerMessage::CommandAck { command } = msg {
                assert_eq!(command, "ChStatus_06");
                break;
            }
        }

        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), bridge)
            .await
            .expect("bridge did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn viewer_stays_connected_without_producer() {
        // Bind and drop to get a port nobody listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let producer_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let (stop, signal) = shutdown::channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = listener.local_addr().unwrap();
        let bridge = tokio::spawn(Bridge::new(test_settings(producer_addr)).serve(listener, signal));

        let (mut ws, _) = connect_async(format!("ws://{http_addr}/ws")).await.unwrap();
        let first: ViewerMessage = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        let ViewerMessage::ChannelUpdate { channels } = first else {
            panic!("expected snapshot first");
        };
        assert_eq!(channels.len(), 8);

        ws.send(Message::text(r#"{"command":"ChStatus_all"}"#)).await.unwrap();
        ws.send(Message::text("garbage")).await.unwrap();
        ws.send(Message::Ping(Vec::new().into())).await.unwrap();

        // Still served: the pong comes back and no ack was sent.
        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no reply")
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Message::Pong(_)), "unexpected {reply:?}");

        stop.send_replace(true);
        // Hub shutdown closes the socket.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        tokio::time::timeout(Duration::from_secs(5), bridge)
            .await
            .expect("bridge did not stop")
            .unwrap();
    }
}
