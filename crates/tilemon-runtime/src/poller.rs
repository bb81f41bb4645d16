//! [`DevicePoller`] – recurring attribute refresh for one device.
//!
//! Every device gets its own tokio task. The task sleeps until the earliest
//! due attribute (pushed back by the backoff deadline after failures), an
//! out-of-cycle request from [`PollerHandle::force_poll`], or cancellation.
//!
//! A cycle reads each due attribute once through the device endpoint:
//!
//! * success refreshes the cache entry and publishes
//!   [`EventPayload::AttributeChanged`] when the value moved by more than the
//!   attribute's epsilon;
//! * [`TileError::UnsupportedAttribute`] marks the entry permanently invalid
//!   and the attribute is never read again;
//! * any other failure marks the entry stale, ends the cycle, and counts one
//!   consecutive failure. The next attempt waits
//!   `min(backoff_base * 2^(failures-1), backoff_max)`. When the count
//!   reaches `failure_threshold` the device is escalated: communication
//!   fault raised, every entry invalidated, liveness flag cleared.
//!
//! After every cycle the registered [`CycleObserver`]s run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tilemon_hal::DeviceEndpoint;
use tilemon_middleware::EventBus;
use tilemon_types::{DeviceId, Event, EventPayload, TileError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::DeviceCache;

const SOURCE: &str = "tilemon-runtime::poller";

/// How long an idle poller sleeps when nothing is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Station-wide polling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Tolerance added to each attribute's period before it reads as stale.
    pub grace_ms: u64,
    /// Consecutive failed cycles before a communication fault is raised.
    pub failure_threshold: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            grace_ms: 500,
            failure_threshold: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl PollerConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// # Errors
    ///
    /// [`TileError::Configuration`] on a zero threshold or a backoff ceiling
    /// below its base.
    pub fn validate(&self) -> Result<(), TileError> {
        if self.failure_threshold == 0 {
            return Err(TileError::Configuration(
                "poller failure_threshold must be at least 1".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(TileError::Configuration(
                "poller backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_epsilon() -> f64 {
    0.0
}

/// One attribute polled on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolledAttribute {
    pub name: String,
    pub period_ms: u64,
    /// Changes at or below this magnitude are not published.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

impl PolledAttribute {
    pub fn new(name: &str, period: Duration) -> Self {
        Self {
            name: name.to_string(),
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            epsilon: 0.0,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Notified after every poll cycle of every device.
pub trait CycleObserver: Send + Sync {
    fn cycle_completed(&self, device: &DeviceId);
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was due.
    Idle,
    Succeeded,
    /// The cycle failed; carries the consecutive failure count.
    Failed(u32),
}

#[derive(Debug)]
struct Schedule {
    next_due: HashMap<String, Instant>,
    failures: u32,
    backoff_until: Option<Instant>,
}

/// The poller of one device.
pub struct DevicePoller {
    endpoint: Arc<DeviceEndpoint>,
    cache: Arc<DeviceCache>,
    attributes: Vec<PolledAttribute>,
    config: PollerConfig,
    bus: EventBus,
    observers: Vec<Arc<dyn CycleObserver>>,
    schedule: Mutex<Schedule>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<Vec<String>>>>,
    requester: mpsc::UnboundedSender<Vec<String>>,
}

impl DevicePoller {
    pub fn new(
        endpoint: Arc<DeviceEndpoint>,
        cache: Arc<DeviceCache>,
        attributes: Vec<PolledAttribute>,
        config: PollerConfig,
        bus: EventBus,
    ) -> Self {
        let now = Instant::now();
        let next_due = attributes.iter().map(|a| (a.name.clone(), now)).collect();
        let (requester, requests) = mpsc::unbounded_channel();
        Self {
            endpoint,
            cache,
            attributes,
            config,
            bus,
            observers: Vec::new(),
            schedule: Mutex::new(Schedule {
                next_due,
                failures: 0,
                backoff_until: None,
            }),
            requests: Mutex::new(Some(requests)),
            requester,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn device(&self) -> &DeviceId {
        self.endpoint.id()
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.schedule.lock().failures
    }

    /// Read every attribute that is due now.
    pub async fn poll_cycle(&self) -> CycleOutcome {
        let now = Instant::now();
        let due: Vec<&PolledAttribute> = {
            let schedule = self.schedule.lock();
            self.attributes
                .iter()
                .filter(|a| schedule.next_due.get(&a.name).is_some_and(|at| *at <= now))
                .collect()
        };
        self.run_cycle(due).await
    }

    /// Read `names` right away, regardless of schedule and backoff. Names
    /// this device does not poll are ignored.
    pub async fn poll_now(&self, names: &[String]) -> CycleOutcome {
        let wanted: Vec<&PolledAttribute> = self
            .attributes
            .iter()
            .filter(|a| names.iter().any(|n| n == &a.name))
            .collect();
        self.run_cycle(wanted).await
    }

    async fn run_cycle(&self, attributes: Vec<&PolledAttribute>) -> CycleOutcome {
        let attributes: Vec<&PolledAttribute> = attributes
            .into_iter()
            .filter(|a| !self.cache.is_unsupported(&a.name))
            .collect();
        if attributes.is_empty() {
            return CycleOutcome::Idle;
        }

        let mut failure = None;
        let mut read_any = false;
        for attribute in attributes {
            let result = self.endpoint.get_attribute(&attribute.name).await;
            let now = Instant::now();
            self.schedule
                .lock()
                .next_due
                .insert(attribute.name.clone(), now + attribute.period());
            match result {
                Ok(reading) => {
                    read_any = true;
                    if let Some(value) =
                        self.cache
                            .record_success(&attribute.name, reading.value, attribute.epsilon, now)
                    {
                        self.bus.publish(Event::new(
                            SOURCE,
                            EventPayload::AttributeChanged {
                                device: self.device().clone(),
                                attribute: attribute.name.clone(),
                                value,
                            },
                        ));
                    }
                }
                Err(TileError::UnsupportedAttribute { .. }) => {
                    info!(device = %self.device(), attribute = %attribute.name, "attribute unsupported, no longer polled");
                    self.cache.mark_unsupported(&attribute.name);
                }
                Err(e) => {
                    debug!(device = %self.device(), attribute = %attribute.name, error = %e, "poll failed");
                    self.cache.record_failure(&attribute.name);
                    failure = Some(e);
                    break;
                }
            }
        }

        let outcome = match failure {
            Some(error) => self.on_failure(error),
            None => {
                if read_any {
                    self.on_success();
                }
                CycleOutcome::Succeeded
            }
        };
        for observer in &self.observers {
            observer.cycle_completed(self.device());
        }
        outcome
    }

    fn on_success(&self) {
        {
            let mut schedule = self.schedule.lock();
            schedule.failures = 0;
            schedule.backoff_until = None;
        }
        if self.cache.clear_fault() {
            self.endpoint.set_online(true);
            info!(device = %self.device(), "communication restored");
            self.bus.publish(Event::new(
                SOURCE,
                EventPayload::CommunicationRestored {
                    device: self.device().clone(),
                },
            ));
        }
    }

    fn on_failure(&self, error: TileError) -> CycleOutcome {
        let failures = {
            let mut schedule = self.schedule.lock();
            schedule.failures = schedule.failures.saturating_add(1);
            schedule.backoff_until = Some(Instant::now() + self.config.backoff(schedule.failures));
            schedule.failures
        };
        let details = match &error {
            TileError::Communication { details, .. } => details.clone(),
            other => other.to_string(),
        };
        if failures >= self.config.failure_threshold && self.cache.comm_fault().is_none() {
            warn!(
                device = %self.device(),
                consecutive_failures = failures,
                details = %details,
                "communication fault, device marked offline"
            );
            self.cache.escalate(details.clone());
            self.endpoint.set_online(false);
            self.bus.publish(Event::new(
                SOURCE,
                EventPayload::CommunicationFault {
                    device: self.device().clone(),
                    consecutive_failures: failures,
                    details,
                },
            ));
        }
        CycleOutcome::Failed(failures)
    }

    /// When the next scheduled cycle is due.
    pub fn next_wake(&self) -> Instant {
        let schedule = self.schedule.lock();
        let earliest = self
            .attributes
            .iter()
            .filter(|a| !self.cache.is_unsupported(&a.name))
            .filter_map(|a| schedule.next_due.get(&a.name).copied())
            .min()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKE);
        match schedule.backoff_until {
            Some(until) => earliest.max(until),
            None => earliest,
        }
    }

    /// Run the polling loop on a new task until `cancel` fires.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the loop was already started.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>, TileError> {
        let requests = self.requests.lock().take().ok_or_else(|| {
            TileError::Configuration(format!("poller for {} already running", self.device()))
        })?;
        let poller = Arc::clone(self);
        Ok(tokio::spawn(poller.run(cancel, requests)))
    }

    async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut requests: mpsc::UnboundedReceiver<Vec<String>>,
    ) {
        debug!(device = %self.device(), attributes = self.attributes.len(), "poller started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(names) = requests.recv() => {
                    self.poll_now(&names).await;
                }
                _ = sleep_until(wake) => {
                    self.poll_cycle().await;
                }
            }
        }
        debug!(device = %self.device(), "poller stopped");
    }

    fn requester(&self) -> mpsc::UnboundedSender<Vec<String>> {
        self.requester.clone()
    }
}

/// Cloneable handle for out-of-cycle poll requests.
#[derive(Clone, Default)]
pub struct PollerHandle {
    requesters: Arc<BTreeMap<DeviceId, mpsc::UnboundedSender<Vec<String>>>>,
}

impl PollerHandle {
    pub fn new<'a>(pollers: impl IntoIterator<Item = &'a Arc<DevicePoller>>) -> Self {
        let requesters = pollers
            .into_iter()
            .map(|p| (p.device().clone(), p.requester()))
            .collect();
        Self {
            requesters: Arc::new(requesters),
        }
    }

    /// Ask `device`'s poller to read `attributes` now. Returns `false` when
    /// the device has no poller or nothing was asked for.
    pub fn force_poll(&self, device: &DeviceId, attributes: &[String]) -> bool {
        if attributes.is_empty() {
            return false;
        }
        match self.requesters.get(device) {
            Some(tx) => tx.send(attributes.to_vec()).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemon_hal::{DeviceAdapter, SimDevice};
    use tilemon_middleware::Topic;
    use tilemon_types::{AttributeValue, Quality};

    fn poller(sim: &Arc<SimDevice>, config: PollerConfig) -> (DevicePoller, EventBus) {
        let endpoint = Arc::new(DeviceEndpoint::new(
            sim.id().clone(),
            "sim://tile1",
            DeviceAdapter::Simulated(Arc::clone(sim)),
            Duration::from_millis(200),
        ));
        let attributes = vec![
            PolledAttribute::new("board_temperature", Duration::from_secs(1)).with_epsilon(0.5),
            PolledAttribute::new("fpga_temperature", Duration::from_secs(1)),
        ];
        let cache = Arc::new(DeviceCache::new(
            Arc::clone(&endpoint),
            config.grace(),
            attributes.iter().map(|a| (a.name.as_str(), a.period())),
        ));
        let bus = EventBus::default();
        (
            DevicePoller::new(endpoint, cache, attributes, config, bus.clone()),
            bus,
        )
    }

    fn sim() -> Arc<SimDevice> {
        Arc::new(
            SimDevice::new("tile1")
                .with_attribute("board_temperature", 45.0)
                .with_attribute("fpga_temperature", 60.0),
        )
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let config = PollerConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(10), Duration::from_secs(30));
        assert_eq!(config.backoff(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_reads_only_due_attributes() {
        let sim = sim();
        let (poller, _bus) = poller(&sim, PollerConfig::default());

        assert_eq!(poller.poll_cycle().await, CycleOutcome::Succeeded);
        assert_eq!(sim.network_calls(), 2);
        assert_eq!(poller.poll_cycle().await, CycleOutcome::Idle);
        assert_eq!(sim.network_calls(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        poller.poll_cycle().await;
        assert_eq!(sim.network_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn changes_beyond_epsilon_are_published() {
        let sim = sim();
        let (poller, bus) = poller(&sim, PollerConfig::default());
        let mut changes = bus.subscribe_to(Topic::Attributes);

        poller.poll_cycle().await;
        // First reads of both attributes count as changes.
        changes.recv().await.unwrap();
        changes.recv().await.unwrap();

        sim.set_attribute_value("board_temperature", 45.2);
        tokio::time::advance(Duration::from_secs(1)).await;
        poller.poll_cycle().await;
        sim.set_attribute_value("board_temperature", 47.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        poller.poll_cycle().await;

        let event = changes.recv().await.unwrap();
        match event.payload {
            EventPayload::AttributeChanged { attribute, value, .. } => {
                assert_eq!(attribute, "board_temperature");
                assert_eq!(value, AttributeValue::Float(47.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_attribute_is_never_polled_again() {
        let sim = Arc::new(
            SimDevice::new("tile1")
                .with_attribute("board_temperature", 45.0)
                .with_unsupported("fpga_temperature"),
        );
        let (poller, _bus) = poller(&sim, PollerConfig::default());

        assert_eq!(poller.poll_cycle().await, CycleOutcome::Succeeded);
        assert_eq!(sim.network_calls(), 2);
        assert!(poller.cache().is_unsupported("fpga_temperature"));

        tokio::time::advance(Duration::from_secs(1)).await;
        poller.poll_cycle().await;
        assert_eq!(sim.network_calls(), 3);
        let entry = poller.cache().read("fpga_temperature", Instant::now()).unwrap();
        assert_eq!(entry.quality, Quality::Invalid);
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_on_threshold_and_recovers() {
        let sim = sim();
        let (poller, bus) = poller(&sim, PollerConfig::default());
        let mut faults = bus.subscribe_to(Topic::Faults);
        poller.poll_cycle().await;

        sim.set_reachable(false);
        for expected in 1..=2 {
            tokio::time::sleep_until(poller.next_wake()).await;
            assert_eq!(poller.poll_cycle().await, CycleOutcome::Failed(expected));
            assert!(poller.cache().comm_fault().is_none());
            assert!(poller.endpoint.is_online());
        }
        tokio::time::sleep_until(poller.next_wake()).await;
        assert_eq!(poller.poll_cycle().await, CycleOutcome::Failed(3));
        assert!(poller.cache().comm_fault().is_some());
        assert!(!poller.endpoint.is_online());
        let snapshot = poller.cache().snapshot(Instant::now());
        assert!(snapshot.entries.values().all(|e| e.quality == Quality::Invalid));
        assert!(matches!(
            faults.recv().await.unwrap().payload,
            EventPayload::CommunicationFault { consecutive_failures: 3, .. }
        ));

        sim.set_reachable(true);
        tokio::time::sleep_until(poller.next_wake()).await;
        assert_eq!(poller.poll_cycle().await, CycleOutcome::Succeeded);
        assert!(poller.endpoint.is_online());
        assert!(poller.cache().comm_fault().is_none());
        assert!(matches!(
            faults.recv().await.unwrap().payload,
            EventPayload::CommunicationRestored { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_pushes_next_wake() {
        let sim = sim();
        let (poller, _bus) = poller(&sim, PollerConfig::default());
        sim.set_reachable(false);
        let start = Instant::now();
        poller.poll_cycle().await;
        poller.poll_cycle().await; // board failed, fpga is still due
        assert_eq!(poller.consecutive_failures(), 2);
        assert!(poller.next_wake() >= start + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_serves_force_requests_and_stops_on_cancel() {
        let sim = sim();
        let (poller, _bus) = poller(&sim, PollerConfig::default());
        let poller = Arc::new(poller);
        let handle = PollerHandle::new([&poller]);
        let cancel = CancellationToken::new();
        let task = poller.spawn(cancel.clone()).unwrap();
        assert!(poller.spawn(cancel.clone()).is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_first = sim.network_calls();
        assert_eq!(after_first, 2);

        sim.set_attribute_value("board_temperature", 80.0);
        assert!(handle.force_poll(&"tile1".into(), &["board_temperature".to_string()]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sim.network_calls(), 3);
        let entry = poller.cache().read("board_temperature", Instant::now()).unwrap();
        assert_eq!(entry.value, Some(AttributeValue::Float(80.0)));

        assert!(!handle.force_poll(&"tile9".into(), &["board_temperature".to_string()]));
        cancel.cancel();
        task.await.unwrap();
    }
}
