//! [`ChannelStore`] – latest-value cache of per-channel measurements.
//!
//! Every write replaces whole [`Measurement`] records under a single write
//! lock, so a reader never sees a record that mixes fields from two
//! different updates. Batch operations ([`ChannelStore::apply_bulk`],
//! [`ChannelStore::update_all`]) hold the lock for the entire batch.
//!
//! The lock is a blocking [`std::sync::RwLock`]; it is never held across an
//! `.await`.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use voltbridge_types::{
    ChannelDetail, ChannelId, ChannelInfo, ChannelMap, Measurement, CURRENT_NOT_REPORTED,
};

/// Default number of well-known channels.
pub const DEFAULT_CHANNEL_COUNT: u16 = 24;

/// Concurrency-safe map of channel id → latest [`Measurement`].
#[derive(Debug)]
pub struct ChannelStore {
    channels: RwLock<ChannelMap>,
}

impl ChannelStore {
    /// Create a store pre-populated with a placeholder for channels
    /// `1..=channel_count`.
    pub fn new(channel_count: u16) -> Self {
        let now = Utc::now();
        let channels = (1..=channel_count)
            .map(ChannelId)
            .map(|id| (id, Measurement::placeholder(id, now)))
            .collect();
        Self {
            channels: RwLock::new(channels),
        }
    }

    /// Replace the measurement for `id`, creating the entry if absent.
    pub fn upsert(&self, id: ChannelId, measurement: Measurement) {
        self.write().insert(id, measurement);
    }

    /// Return a copy of the measurement for `id`.
    pub fn get(&self, id: ChannelId) -> Option<Measurement> {
        self.read().get(&id).cloned()
    }

    /// Point-in-time copy of every channel.
    pub fn snapshot(&self) -> ChannelMap {
        self.read().clone()
    }

    /// Number of channels held. Never shrinks.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Apply every entry of a bulk snapshot as one atomic batch.
    ///
    /// Bulk reports carry no current, so each entry's current is set to
    /// [`CURRENT_NOT_REPORTED`].
    pub fn apply_bulk(&self, entries: &[ChannelInfo], now: DateTime<Utc>) {
        let mut channels = self.write();
        for entry in entries {
            channels.insert(
                ChannelId(entry.ch),
                Measurement {
                    voltage: entry.voltage,
                    current: CURRENT_NOT_REPORTED,
                    status: entry.status.clone(),
                    timestamp: now,
                },
            );
        }
    }

    /// Refresh voltage/current of an existing channel from a detail report.
    ///
    /// The status is left as it was. Fields missing from the report keep
    /// their previous values. Returns `false` (and changes nothing) when the
    /// channel is not in the store.
    pub fn apply_detail(&self, detail: &ChannelDetail, now: DateTime<Utc>) -> bool {
        let mut channels = self.write();
        let Some(existing) = channels.get(&ChannelId(detail.ch)) else {
            return false;
        };
        let updated = Measurement {
            voltage: detail.voltage.unwrap_or(existing.voltage),
            current: detail.current.unwrap_or(existing.current),
            status: existing.status.clone(),
            timestamp: now,
        };
        channels.insert(ChannelId(detail.ch), updated);
        true
    }

    /// Replace every record with `f(id, record)` in one atomic batch and
    /// return the resulting snapshot.
    pub fn update_all<F>(&self, mut f: F) -> ChannelMap
    where
        F: FnMut(ChannelId, &Measurement) -> Measurement,
    {
        let mut channels = self.write();
        for (id, measurement) in channels.iter_mut() {
            let next = f(*id, measurement);
            *measurement = next;
        }
        channels.clone()
    }

    // Records are replaced whole, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, ChannelMap> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChannelMap> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_COUNT)
    }
}
