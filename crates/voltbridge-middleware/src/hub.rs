//! WebSocket fan-out hub.
//!
//! A single actor task owns the registry of connected viewers. Every
//! [`Hub`] handle talks to it over one bounded command queue, so register,
//! unregister and broadcast are serialised without a lock around the
//! registry.
//!
//! Each viewer gets its own bounded outbound queue of pre-serialised text
//! frames. The viewer's socket writer drains that queue; the hub itself
//! never touches a socket, so one stuck viewer cannot stall the others.
//!
//! | Situation | Effect |
//! |---|---|
//! | Hub command queue full | [`Hub::broadcast`] drops the message and logs it |
//! | Viewer queue full | That viewer misses this message; others are unaffected |
//! | Viewer queue closed (writer died) | Viewer is evicted from the registry |

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use voltbridge_types::{BridgeError, ViewerId, ViewerMessage};

use crate::store::ChannelStore;

/// Default capacity of the hub's command queue.
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

/// Default capacity of each viewer's outbound queue.
pub const DEFAULT_VIEWER_CAPACITY: usize = 32;

/// A serialised text frame, shared between every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Queue sizes for a [`Hub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    pub command_capacity: usize,
    pub viewer_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            viewer_capacity: DEFAULT_VIEWER_CAPACITY,
        }
    }
}

/// A registered viewer: its id and the frames queued for its socket.
///
/// Dropping `outbound` (or the whole `Viewer`) marks the viewer dead; the
/// hub evicts it on the next delivery attempt.
#[derive(Debug)]
pub struct Viewer {
    pub id: ViewerId,
    pub outbound: mpsc::Receiver<Frame>,
}

#[derive(Debug)]
enum HubCommand {
    Register {
        id: ViewerId,
        outbound: mpsc::Sender<Frame>,
    },
    Unregister(ViewerId),
    Broadcast(ViewerMessage),
    SendTo {
        id: ViewerId,
        message: ViewerMessage,
    },
    Count(oneshot::Sender<usize>),
    Shutdown,
}

/// Cloneable handle to the hub actor.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    viewer_capacity: usize,
}

impl Hub {
    /// Spawn the hub actor on the current Tokio runtime.
    ///
    /// The actor exits after [`Hub::shutdown`] or once every handle has been
    /// dropped.
    pub fn spawn(store: Arc<ChannelStore>, settings: HubSettings) -> (Self, JoinHandle<()>) {
        let (hub, commands) = Self::channel(settings);
        let actor = HubActor {
            store,
            viewers: HashMap::new(),
        };
        (hub, tokio::spawn(actor.run(commands)))
    }

    fn channel(settings: HubSettings) -> (Self, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel(settings.command_capacity.max(1));
        let hub = Self {
            commands: tx,
            viewer_capacity: settings.viewer_capacity.max(1),
        };
        (hub, rx)
    }

    /// Register a new viewer.
    ///
    /// The viewer's queue receives a full snapshot of the store before any
    /// broadcast issued after this call returns.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Transport`] if the hub has shut down.
    pub async fn register(&self) -> Result<Viewer, BridgeError> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.viewer_capacity);
        self.commands
            .send(HubCommand::Register { id, outbound: tx })
            .await
            .map_err(|_| BridgeError::Transport("hub is shut down".to_string()))?;
        Ok(Viewer { id, outbound: rx })
    }

    /// Remove a viewer and close its queue. Unknown ids are ignored.
    pub async fn unregister(&self, id: ViewerId) {
        // A stopped hub has already dropped every viewer.
        let _ = self.commands.send(HubCommand::Unregister(id)).await;
    }

    /// Queue `message` for every registered viewer without waiting.
    ///
    /// Returns `false` when the message was dropped because the hub queue is
    /// full or the hub has stopped.
    pub fn broadcast(&self, message: ViewerMessage) -> bool {
        self.offer(HubCommand::Broadcast(message))
    }

    /// Queue `message` for a single viewer without waiting.
    pub fn send_to(&self, id: ViewerId, message: ViewerMessage) -> bool {
        self.offer(HubCommand::SendTo { id, message })
    }

    /// Number of viewers currently registered (0 once the hub has stopped).
    pub async fn viewer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Count(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the actor after the command it is currently handling. Every
    /// viewer queue is closed.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown).await;
    }

    fn offer(&self, command: HubCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("hub queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("hub stopped, dropping message");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct HubActor {
    store: Arc<ChannelStore>,
    viewers: HashMap<ViewerId, mpsc::Sender<Frame>>,
}

impl HubActor {
    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register { id, outbound } => self.register(id, outbound),
                HubCommand::Unregister(id) => self.unregister(id),
                HubCommand::Broadcast(message) => self.broadcast(&message),
                HubCommand::SendTo { id, message } => self.send_to(id, &message),
                HubCommand::Count(reply) => {
                    let _ = reply.send(self.viewers.len());
                }
                HubCommand::Shutdown => break,
            }
        }
        // Refuse new commands before the viewer queues close.
        drop(commands);
        info!(viewers = self.viewers.len(), "hub stopped");
    }

    fn register(&mut self, id: ViewerId, outbound: mpsc::Sender<Frame>) {
        let snapshot = ViewerMessage::ChannelUpdate {
            channels: self.store.snapshot(),
        };
        if let Some(frame) = serialize(&snapshot)
            && outbound.try_send(frame).is_err()
        {
            warn!(viewer = %id, "could not queue initial snapshot");
        }
        self.viewers.insert(id, outbound);
        info!(viewer = %id, viewers = self.viewers.len(), "viewer connected");
    }

    fn unregister(&mut self, id: ViewerId) {
        if self.viewers.remove(&id).is_some() {
            info!(viewer = %id, viewers = self.viewers.len(), "viewer disconnected");
        }
    }

    fn broadcast(&mut self, message: &ViewerMessage) {
        let Some(frame) = serialize(message) else {
            return;
        };
        self.viewers.retain(|id, outbound| match outbound.try_send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(viewer = %id, "viewer queue full, skipping update");
                true
            }
            Err(TrySendError::Closed(_)) => {
                info!(viewer = %id, "evicting dead viewer");
                false
            }
        });
        debug!(viewers = self.viewers.len(), "broadcast delivered");
    }

    fn send_to(&mut self, id: ViewerId, message: &ViewerMessage) {
        let Some(outbound) = self.viewers.get(&id) else {
            return;
        };
        let Some(frame) = serialize(message) else {
            return;
        };
        if let Err(TrySendError::Closed(_)) = outbound.try_send(frame) {
            info!(viewer = %id, "evicting dead viewer");
            self.viewers.remove(&id);
        }
    }
}

fn serialize(message: &ViewerMessage) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Frame::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize viewer message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use voltbridge_types::{ChannelId, ChannelMap};

    fn spawn_hub(settings: HubSettings) -> (Arc<ChannelStore>, Hub) {
        let store = Arc::new(ChannelStore::new(4));
        let (hub, _task) = Hub::spawn(Arc::clone(&store), settings);
        (store, hub)
    }

    async fn next_message(viewer: &mut Viewer) -> ViewerMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), viewer.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("viewer queue closed");
        serde_json::from_str(&frame).expect("frame is a viewer message")
    }

    fn ack(command: &str) -> ViewerMessage {
        ViewerMessage::CommandAck {
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn register_pushes_full_snapshot_first() {
        let (store, hub) = spawn_hub(HubSettings::default());
        let mut viewer = hub.register().await.unwrap();

        match next_message(&mut viewer).await {
            ViewerMessage::ChannelUpdate { channels } => {
                assert_eq!(channels.len(), store.len());
                assert!(channels.contains_key(&ChannelId(4)));
            }
            other => panic!("expected channelUpdate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_viewer() {
        let (_store, hub) = spawn_hub(HubSettings::default());
        let mut a = hub.register().await.unwrap();
        let mut b = hub.register().await.unwrap();
        next_message(&mut a).await;
        next_message(&mut b).await;

        assert!(hub.broadcast(ack("ChStatus_all")));

        assert_eq!(next_message(&mut a).await, ack("ChStatus_all"));
        assert_eq!(next_message(&mut b).await, ack("ChStatus_all"));
    }

    #[tokio::test]
    async fn dead_viewer_is_evicted_and_others_keep_receiving() {
        let (_store, hub) = spawn_hub(HubSettings::default());
        let dead = hub.register().await.unwrap();
        let mut alive = hub.register().await.unwrap();
        next_message(&mut alive).await;
        assert_eq!(hub.viewer_count().await, 2);

        drop(dead);
        hub.broadcast(ack("one"));
        assert_eq!(next_message(&mut alive).await, ack("one"));
        assert_eq!(hub.viewer_count().await, 1);

        hub.broadcast(ack("two"));
        assert_eq!(next_message(&mut alive).await, ack("two"));
    }

    #[tokio::test]
    async fn unregister_closes_queue_and_is_idempotent() {
        let (_store, hub) = spawn_hub(HubSettings::default());
        let mut viewer = hub.register().await.unwrap();
        next_message(&mut viewer).await;

        hub.unregister(viewer.id).await;
        hub.unregister(viewer.id).await;
        assert_eq!(hub.viewer_count().await, 0);

        hub.broadcast(ack("late"));
        assert!(viewer.outbound.recv().await.is_none(), "queue must be closed");
    }

    #[tokio::test]
    async fn send_to_targets_one_viewer() {
        let (_store, hub) = spawn_hub(HubSettings::default());
        let mut a = hub.register().await.unwrap();
        let mut b = hub.register().await.unwrap();
        next_message(&mut a).await;
        next_message(&mut b).await;

        hub.send_to(a.id, ack("ChStatus_01"));
        assert_eq!(next_message(&mut a).await, ack("ChStatus_01"));

        // Flush the actor so b's queue is settled before checking it.
        hub.viewer_count().await;
        assert!(b.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn stuck_viewer_does_not_stall_others() {
        let (_store, hub) = spawn_hub(HubSettings {
            command_capacity: 16,
            viewer_capacity: 1,
        });
        // `stuck` never drains; its queue holds only the initial snapshot.
        let stuck = hub.register().await.unwrap();
        let mut live = hub.register().await.unwrap();
        next_message(&mut live).await;

        for n in 0..3 {
            hub.broadcast(ack(&format!("cmd{n}")));
            assert_eq!(next_message(&mut live).await, ack(&format!("cmd{n}")));
        }
        // Full is not dead: the stuck viewer stays registered.
        assert_eq!(hub.viewer_count().await, 2);
        drop(stuck);
    }

    #[tokio::test]
    async fn broadcast_is_dropped_when_hub_queue_is_full() {
        // No actor drains this queue.
        let (hub, _commands) = Hub::channel(HubSettings {
            command_capacity: 1,
            viewer_capacity: 1,
        });
        assert!(hub.broadcast(ack("first")));
        assert!(!hub.broadcast(ack("second")));
    }

    #[tokio::test]
    async fn shutdown_closes_all_viewers() {
        let (_store, hub) = spawn_hub(HubSettings::default());
        let mut viewer = hub.register().await.unwrap();
        next_message(&mut viewer).await;

        hub.shutdown().await;
        assert!(viewer.outbound.recv().await.is_none());
        assert!(!hub.broadcast(ViewerMessage::ChannelUpdate {
            channels: ChannelMap::new()
        }));
        assert!(hub.register().await.is_err());
        assert_eq!(hub.viewer_count().await, 0);
    }
}
