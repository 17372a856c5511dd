//! Stand-in for the battery-pack hardware.
//!
//! [`ProducerSim`] listens on TCP, speaks the same length-prefixed framing
//! as the real producer, and answers the two status commands with a fixed
//! eight-channel pack:
//!
//! | Command | Reply |
//! |---|---|
//! | `ChStatus_all` | Bulk snapshot of channels 1–8 |
//! | `ChStatus_<n>`, `n` in 1–8 | Detail for channel `n` |
//! | anything else | `{"error": "unknown command: ..."}` |

use std::net::SocketAddr;

use chrono::Local;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};
use voltbridge_types::{
    BridgeError, BulkSnapshot, ChannelDetail, ChannelExtreme, ChannelInfo, ChannelStatus,
    ProducerCommand,
};

use crate::codec;
use crate::shutdown::{self, ShutdownSignal};

/// Channels the simulated pack reports.
pub const SIM_CHANNELS: u16 = 8;

/// TCP server that imitates the producer.
pub struct ProducerSim {
    listener: TcpListener,
}

impl ProducerSim {
    /// Bind the simulator to `addr`. Use port `0` for an ephemeral port.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("producer sim bind error: {e}")))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.listener
            .local_addr()
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "producer simulator listening");
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "producer simulator accepted connection");
                        tokio::spawn(serve(stream, peer, shutdown.clone()));
                    }
                    Err(e) => error!(error = %e, "producer simulator accept error"),
                },
                _ = shutdown::requested(&mut shutdown) => break,
            }
        }
        info!("producer simulator stopped");
    }

    /// Reply the simulator sends for `command`.
    pub fn respond(command: &str) -> String {
        let reply = match ProducerCommand::parse(command) {
            Some(ProducerCommand::StatusAll) => serde_json::to_string(&Self::bulk_snapshot()),
            Some(ProducerCommand::ChannelStatus(n)) if (1..=SIM_CHANNELS).contains(&n) => {
                serde_json::to_string(&Self::channel_detail(n))
            }
            _ => {
                warn!(command, "producer simulator got unknown command");
                return json!({ "error": format!("unknown command: {command}") }).to_string();
            }
        };
        reply.unwrap_or_else(|e| json!({ "error": format!("serialization failed: {e}") }).to_string())
    }

    /// The fixed pack state reported for `ChStatus_all`.
    pub fn bulk_snapshot() -> BulkSnapshot {
        let cells = [
            (1, 4.00, ChannelStatus::Run),
            (2, 3.99, ChannelStatus::Run),
            (3, 4.01, ChannelStatus::Finish),
            (4, 3.97, ChannelStatus::Finish),
            (5, 0.00, ChannelStatus::Standby),
            (6, 3.98, ChannelStatus::Alarm),
            (7, 0.00, ChannelStatus::OffLine),
            (8, 3.99, ChannelStatus::Rev),
        ];
        BulkSnapshot {
            total_voltage: 59.85,
            max: Some(ChannelExtreme { ch: 3, voltage: 4.01 }),
            min: Some(ChannelExtreme { ch: 4, voltage: 3.97 }),
            finished_channels: 2,
            channels: cells
                .into_iter()
                .map(|(ch, voltage, status)| ChannelInfo { ch, voltage, status })
                .collect(),
        }
    }

    fn channel_detail(ch: u16) -> ChannelDetail {
        ChannelDetail {
            ch,
            voltage: Some(3.99),
            current: Some(5.01),
            power: Some(20.0),
            amp_hours: Some(2.55),
            elapsed: Some(Local::now().format("%H:%M:%S").to_string()),
        }
    }
}

async fn serve(mut stream: TcpStream, peer: SocketAddr, mut shutdown: ShutdownSignal) {
    loop {
        let frame = tokio::select! {
            frame = codec::read_frame(&mut stream) => frame,
            _ = shutdown::requested(&mut shutdown) => break,
        };
        let command = match frame {
            Ok(Some(payload)) => String::from_utf8_lossy(&payload).into_owned(),
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "producer simulator read error");
                break;
            }
        };
        debug!(%peer, command, "producer simulator received command");

        let reply = ProducerSim::respond(&command);
        if let Err(e) = codec::write_frame(&mut stream, reply.as_bytes()).await {
            warn!(%peer, error = %e, "producer simulator write error");
            break;
        }
    }
    info!(%peer, "producer simulator connection closed");
}
