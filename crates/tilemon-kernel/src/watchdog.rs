//! [`TransitionWatchdog`] – deadline table for expected state transitions.
//!
//! When a command that drives a board towards a programming state
//! completes, the expected state must be observed by the poller within a
//! bounded interval. The watchdog holds one deadline per device; the
//! programming monitor disarms it when the state shows up and calls
//! [`TransitionWatchdog::take_expired`] after every poll cycle to collect
//! the transitions that never arrived.
//!
//! Time is passed in explicitly, so the table is a pure data structure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tilemon_types::{DeviceId, ProgrammingState};

struct Deadline {
    expected: ProgrammingState,
    armed_at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.armed_at) > self.timeout
    }
}

/// A transition that was not observed in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedTransition {
    pub device: DeviceId,
    pub expected: ProgrammingState,
    pub waited: Duration,
}

/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use tilemon_kernel::watchdog::TransitionWatchdog;
/// use tilemon_types::ProgrammingState;
///
/// let start = Instant::now();
/// let mut wd = TransitionWatchdog::new();
/// wd.arm("tile1".into(), ProgrammingState::Initialised, Duration::from_secs(5), start);
///
/// assert!(wd.take_expired(start + Duration::from_secs(5)).is_empty());
/// assert!(wd.take_expired(start + Duration::from_secs(6)).len() == 1);
/// ```
#[derive(Default)]
pub struct TransitionWatchdog {
    deadlines: HashMap<DeviceId, Deadline>,
}

impl TransitionWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `device` to reach `expected` within `timeout` of `now`.
    ///
    /// Re-arming a device replaces its previous deadline.
    pub fn arm(
        &mut self,
        device: DeviceId,
        expected: ProgrammingState,
        timeout: Duration,
        now: Instant,
    ) {
        self.deadlines.insert(
            device,
            Deadline {
                expected,
                armed_at: now,
                timeout,
            },
        );
    }

    /// Drop the deadline of `device`. Returns the state it was waiting for.
    pub fn disarm(&mut self, device: &DeviceId) -> Option<ProgrammingState> {
        self.deadlines.remove(device).map(|d| d.expected)
    }

    pub fn expected(&self, device: &DeviceId) -> Option<ProgrammingState> {
        self.deadlines.get(device).map(|d| d.expected)
    }

    /// Remove and return every deadline that has passed. Each missed
    /// transition is reported once.
    pub fn take_expired(&mut self, now: Instant) -> Vec<MissedTransition> {
        let expired: Vec<DeviceId> = self
            .deadlines
            .iter()
            .filter(|(_, d)| d.expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut missed: Vec<MissedTransition> = expired
            .into_iter()
            .filter_map(|device| {
                let d = self.deadlines.remove(&device)?;
                Some(MissedTransition {
                    device,
                    expected: d.expected,
                    waited: now.saturating_duration_since(d.armed_at),
                })
            })
            .collect();
        missed.sort_by(|a, b| a.device.cmp(&b.device));
        missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(n: u8) -> DeviceId {
        format!("tile{n}").into()
    }

    #[test]
    fn deadline_expires_only_past_its_timeout() {
        let now = Instant::now();
        let mut wd = TransitionWatchdog::new();
        wd.arm(tile(1), ProgrammingState::Programmed, Duration::from_secs(5), now);
        assert!(wd.take_expired(now + Duration::from_secs(5)).is_empty());
        assert_eq!(wd.expected(&tile(1)), Some(ProgrammingState::Programmed));
        assert_eq!(wd.take_expired(now + Duration::from_secs(6)).len(), 1);
        assert_eq!(wd.expected(&tile(1)), None);
    }

    #[test]
    fn disarmed_device_is_idle() {
        let now = Instant::now();
        let mut wd = TransitionWatchdog::new();
        wd.arm(tile(1), ProgrammingState::Initialised, Duration::from_secs(1), now);
        assert_eq!(wd.disarm(&tile(1)), Some(ProgrammingState::Initialised));
        assert_eq!(wd.expected(&tile(1)), None);
        assert!(wd.take_expired(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn expired_deadlines_are_reported_once() {
        let now = Instant::now();
        let mut wd = TransitionWatchdog::new();
        wd.arm(tile(2), ProgrammingState::Synchronised, Duration::from_secs(1), now);
        wd.arm(tile(1), ProgrammingState::Synchronised, Duration::from_secs(1), now);
        wd.arm(tile(3), ProgrammingState::Synchronised, Duration::from_secs(60), now);

        let later = now + Duration::from_secs(2);
        let missed = wd.take_expired(later);
        assert_eq!(missed.len(), 2);
        assert_eq!(missed[0].device, tile(1));
        assert_eq!(missed[0].waited, Duration::from_secs(2));
        assert!(wd.take_expired(later).is_empty());
        assert_eq!(wd.expected(&tile(3)), Some(ProgrammingState::Synchronised));
    }

    #[test]
    fn rearm_replaces_deadline() {
        let now = Instant::now();
        let mut wd = TransitionWatchdog::new();
        wd.arm(tile(1), ProgrammingState::Programmed, Duration::from_secs(1), now);
        wd.arm(tile(1), ProgrammingState::Initialised, Duration::from_secs(60), now);
        assert!(wd.take_expired(now + Duration::from_secs(2)).is_empty());
        assert_eq!(wd.expected(&tile(1)), Some(ProgrammingState::Initialised));
    }
}
