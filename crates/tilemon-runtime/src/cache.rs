//! Per-device attribute cache.
//!
//! Each device owns one [`DeviceCache`] partition, created at startup and
//! written only by that device's poller. Readers never block on the network:
//! [`DeviceCache::read`] returns the last value immediately and annotates its
//! quality at read time, so an entry whose age exceeds
//! `polling_period + grace` is handed out as [`Quality::Stale`] even if the
//! poller has not noticed yet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tilemon_hal::DeviceEndpoint;
use tilemon_kernel::AttributeSource;
use tilemon_types::{AttributeValue, CacheEntry, DeviceId, DeviceSnapshot, Quality};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Slot {
    value: Option<AttributeValue>,
    quality: Quality,
    updated_at: Option<DateTime<Utc>>,
    read_at: Option<Instant>,
    period: Duration,
    unsupported: bool,
}

impl Slot {
    fn new(period: Duration) -> Self {
        Self {
            value: None,
            quality: Quality::Invalid,
            updated_at: None,
            read_at: None,
            period,
            unsupported: false,
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    slots: BTreeMap<String, Slot>,
    comm_fault: Option<String>,
}

/// Cache partition of one device.
pub struct DeviceCache {
    endpoint: Arc<DeviceEndpoint>,
    grace: Duration,
    inner: RwLock<Partition>,
}

impl DeviceCache {
    /// Create the partition with one invalid slot per polled attribute.
    pub fn new<'a, I>(endpoint: Arc<DeviceEndpoint>, grace: Duration, attributes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Duration)>,
    {
        let slots = attributes
            .into_iter()
            .map(|(name, period)| (name.to_string(), Slot::new(period)))
            .collect();
        Self {
            endpoint,
            grace,
            inner: RwLock::new(Partition {
                slots,
                comm_fault: None,
            }),
        }
    }

    pub fn device(&self) -> &DeviceId {
        self.endpoint.id()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// The entry for `attribute` as of `now`, `None` when it is not polled.
    pub fn read(&self, attribute: &str, now: Instant) -> Option<CacheEntry> {
        let inner = self.inner.read();
        inner
            .slots
            .get(attribute)
            .map(|slot| self.annotate(attribute, slot, now))
    }

    /// Every entry plus the endpoint's liveness, as of `now`.
    pub fn snapshot(&self, now: Instant) -> DeviceSnapshot {
        let inner = self.inner.read();
        let entries = inner
            .slots
            .iter()
            .map(|(name, slot)| (name.clone(), self.annotate(name, slot, now)))
            .collect();
        DeviceSnapshot {
            device: self.device().clone(),
            online: self.endpoint.is_online(),
            comm_fault: inner.comm_fault.clone(),
            entries,
        }
    }

    fn annotate(&self, name: &str, slot: &Slot, now: Instant) -> CacheEntry {
        let age = slot.read_at.map(|at| now.saturating_duration_since(at));
        let quality = match (slot.quality, age) {
            (Quality::Fresh, Some(age)) if age > slot.period + self.grace => Quality::Stale,
            (quality, _) => quality,
        };
        CacheEntry {
            name: name.to_string(),
            value: slot.value.clone(),
            quality,
            updated_at: slot.updated_at,
            age,
            polling_period: slot.period,
        }
    }

    /// Store a successful read. Returns the new value when it moved by more
    /// than `epsilon` from the previous one (or there was none).
    pub fn record_success(
        &self,
        attribute: &str,
        value: AttributeValue,
        epsilon: f64,
        now: Instant,
    ) -> Option<AttributeValue> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(attribute)?;
        let changed = slot
            .value
            .as_ref()
            .is_none_or(|previous| previous.differs_beyond(&value, epsilon));
        slot.value = Some(value);
        slot.quality = Quality::Fresh;
        slot.updated_at = Some(Utc::now());
        slot.read_at = Some(now);
        changed.then(|| slot.value.clone()).flatten()
    }

    /// A read attempt failed; the value is kept but no longer trusted.
    pub fn record_failure(&self, attribute: &str) {
        if let Some(slot) = self.inner.write().slots.get_mut(attribute) {
            if slot.quality == Quality::Fresh {
                slot.quality = Quality::Stale;
            }
        }
    }

    /// The hardware does not expose `attribute`: permanently invalid.
    pub fn mark_unsupported(&self, attribute: &str) {
        if let Some(slot) = self.inner.write().slots.get_mut(attribute) {
            slot.value = None;
            slot.quality = Quality::Invalid;
            slot.unsupported = true;
        }
    }

    pub fn is_unsupported(&self, attribute: &str) -> bool {
        self.inner
            .read()
            .slots
            .get(attribute)
            .is_some_and(|slot| slot.unsupported)
    }

    pub fn comm_fault(&self) -> Option<String> {
        self.inner.read().comm_fault.clone()
    }

    /// Raise the escalated communication fault and invalidate the whole
    /// attribute set.
    pub fn escalate(&self, details: String) {
        let mut inner = self.inner.write();
        inner.comm_fault = Some(details);
        for slot in inner.slots.values_mut() {
            slot.quality = Quality::Invalid;
        }
    }

    /// Clear the communication fault. Returns whether one was set.
    pub fn clear_fault(&self) -> bool {
        self.inner.write().comm_fault.take().is_some()
    }
}

/// Every cache partition of the station, keyed by device.
#[derive(Default)]
pub struct CacheStore {
    partitions: BTreeMap<DeviceId, Arc<DeviceCache>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cache: Arc<DeviceCache>) {
        self.partitions.insert(cache.device().clone(), cache);
    }

    pub fn get(&self, device: &DeviceId) -> Option<&Arc<DeviceCache>> {
        self.partitions.get(device)
    }

    /// Non-blocking read of one cached attribute.
    pub fn read(&self, device: &DeviceId, attribute: &str) -> Option<CacheEntry> {
        self.partitions.get(device)?.read(attribute, Instant::now())
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.partitions.keys()
    }
}

impl AttributeSource for CacheStore {
    fn snapshot(&self, device: &DeviceId) -> Option<DeviceSnapshot> {
        self.partitions
            .get(device)
            .map(|cache| cache.snapshot(Instant::now()))
    }
}
