//! [`ProgrammingMonitor`] – runs the per-board programming state machines.
//!
//! The monitor sits on both sides of the station:
//!
//! * as a [`CycleObserver`] it re-derives a board's state after each of its
//!   poll cycles and feeds the result to the board's
//!   [`ProgrammingStateMachine`], then collects expired transition deadlines;
//! * as a [`TransitionTracker`] it sets the pending shadow marker when the
//!   executor accepts a state-driving command, arms the watchdog when that
//!   command completes, and drops the marker when it fails.
//!
//! State changes and stuck transitions are published on the event bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tilemon_kernel::{
    AttributeSource, CommandSpec, ProgrammingStateMachine, StateChange, TransitionWatchdog,
    derive_programming_state,
};
use tilemon_middleware::EventBus;
use tilemon_types::{
    CommandStatus, DeviceId, Event, EventPayload, PowerState, ProgrammingState, ProgrammingStatus,
    TileError,
};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::executor::TransitionTracker;
use crate::poller::CycleObserver;
use crate::power::PowerTree;

const SOURCE: &str = "tilemon-runtime::programming";

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

pub struct ProgrammingMonitor {
    cache: Arc<CacheStore>,
    power: Arc<PowerTree>,
    machines: BTreeMap<DeviceId, Mutex<ProgrammingStateMachine>>,
    watchdog: Mutex<TransitionWatchdog>,
    bus: EventBus,
}

impl ProgrammingMonitor {
    /// Track the programming lifecycle of `boards`.
    pub fn new(
        boards: impl IntoIterator<Item = DeviceId>,
        cache: Arc<CacheStore>,
        power: Arc<PowerTree>,
        bus: EventBus,
    ) -> Self {
        let machines = boards
            .into_iter()
            .map(|id| (id.clone(), Mutex::new(ProgrammingStateMachine::new(id))))
            .collect();
        Self {
            cache,
            power,
            machines,
            watchdog: Mutex::new(TransitionWatchdog::new()),
            bus,
        }
    }

    pub fn boards(&self) -> impl Iterator<Item = &DeviceId> {
        self.machines.keys()
    }

    pub fn is_tracked(&self, device: &DeviceId) -> bool {
        self.machines.contains_key(device)
    }

    pub fn state(&self, device: &DeviceId) -> Option<ProgrammingState> {
        self.machines.get(device).map(|m| m.lock().state())
    }

    /// Confirmed state plus pending marker and fault cause.
    pub fn status(&self, device: &DeviceId) -> Option<ProgrammingStatus> {
        self.machines.get(device).map(|m| m.lock().status())
    }

    pub fn stuck_fault(&self, device: &DeviceId) -> Option<TileError> {
        self.machines
            .get(device)
            .and_then(|m| m.lock().stuck_fault().cloned())
    }

    /// A power-off is about to be issued outside the command catalog's
    /// reset commands.
    pub fn expect_reset(&self, device: &DeviceId) {
        if let Some(machine) = self.machines.get(device) {
            machine.lock().expect_reset();
        }
    }

    /// Explicit reset of a board to `UNCONNECTED`; the next poll cycle
    /// re-derives the state.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] when `device` is not tracked.
    pub fn reset(&self, device: &DeviceId) -> Result<(), TileError> {
        let machine = self
            .machines
            .get(device)
            .ok_or_else(|| TileError::UnknownDevice(device.clone()))?;
        let change = machine.lock().reset();
        self.watchdog.lock().disarm(device);
        info!(%device, "programming state reset");
        if let Some(change) = change {
            self.publish_change(device, change);
        }
        Ok(())
    }

    /// Re-derive `device`'s state from the cache and feed the machine.
    pub fn refresh(&self, device: &DeviceId) {
        let Some(machine) = self.machines.get(device) else {
            return;
        };
        let Some(snapshot) = self.cache.snapshot(device) else {
            return;
        };
        let power = self.power.observed(device, &self.cache);
        // A switched board whose supply has not been read yet may well be off.
        let undecided = power == PowerState::Unknown
            && snapshot.comm_fault.is_none()
            && self.power.node(device).is_some();
        let derived = if undecided {
            None
        } else {
            derive_programming_state(&snapshot, power)
        };
        let (change, pending) = {
            let mut machine = machine.lock();
            (machine.observe(derived), machine.pending())
        };
        if pending.is_none() {
            self.watchdog.lock().disarm(device);
        }
        if let Some(change) = change {
            self.publish_change(device, change);
        }
    }

    /// Turn every expired transition deadline into a stuck-transition fault.
    pub fn check_deadlines(&self) {
        let missed = self.watchdog.lock().take_expired(now());
        for miss in missed {
            let Some(machine) = self.machines.get(&miss.device) else {
                continue;
            };
            let waited_ms = u64::try_from(miss.waited.as_millis()).unwrap_or(u64::MAX);
            let change = machine.lock().stuck(miss.expected, waited_ms);
            warn!(device = %miss.device, expected = %miss.expected, waited_ms, "stuck transition");
            self.bus.publish(Event::new(
                SOURCE,
                EventPayload::StuckTransition {
                    device: miss.device.clone(),
                    expected: miss.expected,
                },
            ));
            if let Some(change) = change {
                self.publish_change(&miss.device, change);
            }
        }
    }

    fn publish_change(&self, device: &DeviceId, change: StateChange) {
        info!(%device, from = %change.from, to = %change.to, "programming state changed");
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::ProgrammingStateChanged {
                device: device.clone(),
                from: change.from,
                to: change.to,
            },
        ));
    }
}

impl CycleObserver for ProgrammingMonitor {
    fn cycle_completed(&self, device: &DeviceId) {
        self.refresh(device);
        self.check_deadlines();
    }
}

impl TransitionTracker for ProgrammingMonitor {
    fn accept(&self, device: &DeviceId, spec: &CommandSpec) -> Result<(), TileError> {
        if spec.pending_state.is_none() && !spec.resets_programming {
            return Ok(());
        }
        match self.machines.get(device) {
            Some(machine) => {
                machine
                    .lock()
                    .begin(&spec.name, spec.pending_state, spec.resets_programming)
            }
            None => Ok(()),
        }
    }

    fn finished(&self, device: &DeviceId, spec: &CommandSpec, status: CommandStatus) {
        if spec.pending_state.is_none() && !spec.resets_programming {
            return;
        }
        let Some(machine) = self.machines.get(device) else {
            return;
        };
        if status == CommandStatus::Completed {
            let pending = machine.lock().pending();
            if let Some(target) = pending.filter(|p| Some(*p) == spec.pending_state) {
                self.watchdog
                    .lock()
                    .arm(device.clone(), target, spec.confirm_within(), now());
            }
        } else {
            machine.lock().abandon();
            self.watchdog.lock().disarm(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tilemon_hal::{DeviceEndpoint, DeviceRegistry, SimDevice};
    use tilemon_kernel::CommandCatalog;
    use tilemon_middleware::Topic;
    use tilemon_types::RejectReason;

    use crate::cache::DeviceCache;

    struct Fixture {
        monitor: ProgrammingMonitor,
        cache: Arc<DeviceCache>,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimDevice::new("tile1"));
        let registry = DeviceRegistry::simulated([sim], Duration::from_secs(1)).unwrap();
        let endpoint: Arc<DeviceEndpoint> = Arc::clone(registry.require(&"tile1".into()).unwrap());
        let cache = Arc::new(DeviceCache::new(
            endpoint,
            Duration::ZERO,
            [
                ("is_programmed", Duration::from_secs(1)),
                ("is_initialised", Duration::from_secs(1)),
            ],
        ));
        let mut store = CacheStore::new();
        store.insert(Arc::clone(&cache));
        let bus = EventBus::default();
        let monitor = ProgrammingMonitor::new(
            ["tile1".into()],
            Arc::new(store),
            Arc::new(PowerTree::default()),
            bus.clone(),
        );
        Fixture { monitor, cache, bus }
    }

    fn set(fx: &Fixture, programmed: bool, initialised: bool) {
        let now = tokio::time::Instant::now();
        fx.cache.record_success("is_programmed", programmed.into(), 0.0, now);
        fx.cache.record_success("is_initialised", initialised.into(), 0.0, now);
    }

    fn tile() -> DeviceId {
        "tile1".into()
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_cache_forward() {
        let fx = fixture();
        let mut state = fx.bus.subscribe_to(Topic::State);
        set(&fx, false, false);
        fx.monitor.cycle_completed(&tile());
        assert_eq!(fx.monitor.state(&tile()), Some(ProgrammingState::Unprogrammed));

        set(&fx, true, true);
        fx.monitor.cycle_completed(&tile());
        assert_eq!(fx.monitor.state(&tile()), Some(ProgrammingState::Initialised));

        let first = state.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            EventPayload::ProgrammingStateChanged { to: ProgrammingState::Unprogrammed, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_marker_blocks_duplicates_until_confirmed() {
        let fx = fixture();
        set(&fx, true, false);
        fx.monitor.cycle_completed(&tile());
        let catalog = CommandCatalog::standard();
        let initialise = catalog.get("Initialise").unwrap();

        fx.monitor.accept(&tile(), initialise).unwrap();
        let status = fx.monitor.status(&tile()).unwrap();
        assert_eq!(status.pending, Some(ProgrammingState::Initialised));
        assert_eq!(status.state, ProgrammingState::Programmed);
        match fx.monitor.accept(&tile(), initialise) {
            Err(TileError::CommandRejected { reason, .. }) => {
                assert_eq!(reason, RejectReason::DuplicateTransition(ProgrammingState::Initialised));
            }
            other => panic!("expected duplicate rejection, got {other:?}"),
        }

        fx.monitor.finished(&tile(), initialise, CommandStatus::Completed);
        set(&fx, true, true);
        fx.monitor.cycle_completed(&tile());
        let status = fx.monitor.status(&tile()).unwrap();
        assert_eq!(status.state, ProgrammingState::Initialised);
        assert_eq!(status.pending, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_transition_becomes_stuck() {
        let fx = fixture();
        let mut faults = fx.bus.subscribe_to(Topic::Faults);
        set(&fx, true, false);
        fx.monitor.cycle_completed(&tile());
        let catalog = CommandCatalog::standard();
        let initialise = catalog.get("Initialise").unwrap();
        fx.monitor.accept(&tile(), initialise).unwrap();
        fx.monitor.finished(&tile(), initialise, CommandStatus::Completed);

        tokio::time::advance(initialise.confirm_within() + Duration::from_millis(1)).await;
        set(&fx, true, false);
        fx.monitor.cycle_completed(&tile());

        assert_eq!(fx.monitor.state(&tile()), Some(ProgrammingState::Fault));
        assert!(matches!(fx.monitor.stuck_fault(&tile()), Some(TileError::StuckTransition { .. })));
        assert!(matches!(
            faults.recv().await.unwrap().payload,
            EventPayload::StuckTransition { expected: ProgrammingState::Initialised, .. }
        ));

        fx.monitor.reset(&tile()).unwrap();
        assert_eq!(fx.monitor.state(&tile()), Some(ProgrammingState::Unconnected));
        fx.monitor.cycle_completed(&tile());
        assert_eq!(fx.monitor.state(&tile()), Some(ProgrammingState::Programmed));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_command_drops_the_marker() {
        let fx = fixture();
        set(&fx, true, false);
        fx.monitor.cycle_completed(&tile());
        let catalog = CommandCatalog::standard();
        let initialise = catalog.get("Initialise").unwrap();
        fx.monitor.accept(&tile(), initialise).unwrap();
        fx.monitor.finished(&tile(), initialise, CommandStatus::Failed);
        assert_eq!(fx.monitor.status(&tile()).unwrap().pending, None);
        fx.monitor.accept(&tile(), initialise).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_devices_are_ignored() {
        let fx = fixture();
        let catalog = CommandCatalog::standard();
        let initialise = catalog.get("Initialise").unwrap();
        fx.monitor.accept(&"subrack1".into(), initialise).unwrap();
        fx.monitor.cycle_completed(&"subrack1".into());
        assert!(fx.monitor.state(&"subrack1".into()).is_none());
        assert!(fx.monitor.reset(&"subrack1".into()).is_err());
    }
}
