//! Synthetic telemetry for when no producer is reachable.
//!
//! While the producer link is anything other than
//! [`LinkState::Connected`], [`SyntheticFeed`] nudges every stored channel
//! by a small random amount on a fixed tick so viewers see a live dashboard.
//! It goes quiet the moment real data starts flowing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use voltbridge_middleware::shutdown::{self, ShutdownSignal};
use voltbridge_middleware::{ChannelStore, Hub, LinkState};
use voltbridge_types::{Measurement, ViewerMessage};

pub const DEFAULT_SYNTHETIC_INTERVAL: Duration = Duration::from_secs(2);

pub const VOLTAGE_STEP: f64 = 0.01;
pub const VOLTAGE_RANGE: (f64, f64) = (2.5, 4.5);
pub const CURRENT_STEP: f64 = 0.05;
pub const CURRENT_RANGE: (f64, f64) = (0.0, 2.0);

/// Random-walk generator gated on the producer link state.
pub struct SyntheticFeed {
    store: Arc<ChannelStore>,
    hub: Hub,
    link: watch::Receiver<LinkState>,
    interval: Duration,
}

impl SyntheticFeed {
    pub fn new(
        store: Arc<ChannelStore>,
        hub: Hub,
        link: watch::Receiver<LinkState>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            link,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(interval_ms = self.interval.as_millis() as u64, "synthetic feed started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut rng = rand::rng();
                    self.step(&mut rng);
                }
                _ = shutdown::requested(&mut shutdown) => break,
            }
        }
        info!("synthetic feed stopped");
    }

    /// Perturb and broadcast once. Returns `false` when the producer is
    /// connected and nothing was touched.
    pub fn step<R: Rng>(&self, rng: &mut R) -> bool {
        if *self.link.borrow() == LinkState::Connected {
            return false;
        }
        let now = Utc::now();
        let channels = self.store.update_all(|_, m| {
            let dv = rng.random_range(-VOLTAGE_STEP..=VOLTAGE_STEP);
            let di = rng.random_range(-CURRENT_STEP..=CURRENT_STEP);
            perturb(m, dv, di, now)
        });
        debug!(channels = channels.len(), "synthetic update");
        self.hub.broadcast(ViewerMessage::ChannelUpdate { channels });
        true
    }
}

/// Shift `m` by `dv`/`di`, clamp into the plausible cell range, and stamp
/// it with `now`. Status is carried over.
pub fn perturb(m: &Measurement, dv: f64, di: f64, now: DateTime<Utc>) -> Measurement {
    Measurement {
        voltage: (m.voltage + dv).clamp(VOLTAGE_RANGE.0, VOLTAGE_RANGE.1),
        current: (m.current + di).clamp(CURRENT_RANGE.0, CURRENT_RANGE.1),
        status: m.status.clone(),
        timestamp: now,
    }
}
