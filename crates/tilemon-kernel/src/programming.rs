//! Per-board programming lifecycle.
//!
//! The confirmed [`ProgrammingState`] of a board is never set by a command.
//! It is a pure function of the latest cache snapshot and observed power
//! ([`derive_programming_state`]); the [`ProgrammingStateMachine`] only
//! decides whether an observed move is legal:
//!
//! * forward along `UNCONNECTED → OFF → UNPROGRAMMED → PROGRAMMED →
//!   INITIALISED → SYNCHRONISED` (skipping states is fine);
//! * back to `UNCONNECTED` whenever the board becomes unreachable;
//! * backwards otherwise only while a reset (power-off, `ResetFault`) is
//!   pending, else the board enters `FAULT`;
//! * out of `FAULT` only through a reset.
//!
//! Accepting a command sets a `<state>-PENDING` shadow marker that blocks
//! duplicate submissions until the poller confirms the transition.

use tilemon_types::{
    DeviceId, DeviceSnapshot, PowerState, ProgrammingState, ProgrammingStatus, RejectReason,
    TileError,
};
use tracing::warn;

pub const IS_PROGRAMMED: &str = "is_programmed";
pub const IS_INITIALISED: &str = "is_initialised";
pub const IS_SYNCHRONISED: &str = "is_synchronised";
/// Hardware-reported fault flag.
pub const HARDWARE_FAULT: &str = "hardware_fault";

/// Derive the programming state from a cache snapshot and observed power.
///
/// Returns `None` when the flags needed to decide are stale or missing; the
/// caller then holds the previous state.
pub fn derive_programming_state(
    snapshot: &DeviceSnapshot,
    power: PowerState,
) -> Option<ProgrammingState> {
    if snapshot.fresh_bool(HARDWARE_FAULT) == Some(true) {
        return Some(ProgrammingState::Fault);
    }
    if matches!(power, PowerState::Off | PowerState::Standby) {
        return Some(ProgrammingState::Off);
    }
    if !snapshot.online || snapshot.comm_fault.is_some() {
        return Some(ProgrammingState::Unconnected);
    }
    let ladder = [
        (IS_SYNCHRONISED, ProgrammingState::Synchronised),
        (IS_INITIALISED, ProgrammingState::Initialised),
        (IS_PROGRAMMED, ProgrammingState::Programmed),
    ];
    for (attribute, state) in ladder {
        match snapshot.entry(attribute) {
            // Not polled on this board; only `is_programmed` is mandatory.
            None if attribute != IS_PROGRAMMED => continue,
            None => return None,
            Some(entry) => match entry.fresh_value().and_then(|v| v.as_bool()) {
                Some(true) => return Some(state),
                Some(false) => continue,
                None => return None,
            },
        }
    }
    Some(ProgrammingState::Unprogrammed)
}

/// An accepted move of the confirmed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ProgrammingState,
    pub to: ProgrammingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    target: ProgrammingState,
    /// Only the exact target confirms (reset targets lie behind the
    /// current state).
    exact: bool,
}

/// Programming state machine of one board.
#[derive(Debug, Clone)]
pub struct ProgrammingStateMachine {
    device: DeviceId,
    state: ProgrammingState,
    pending: Option<Pending>,
    reset_pending: bool,
    fault_cause: Option<String>,
    stuck: Option<TileError>,
}

impl ProgrammingStateMachine {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            state: ProgrammingState::Unconnected,
            pending: None,
            reset_pending: false,
            fault_cause: None,
            stuck: None,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn state(&self) -> ProgrammingState {
        self.state
    }

    pub fn pending(&self) -> Option<ProgrammingState> {
        self.pending.map(|p| p.target)
    }

    pub fn status(&self) -> ProgrammingStatus {
        ProgrammingStatus {
            state: self.state,
            pending: self.pending(),
            fault_cause: self.fault_cause.clone(),
        }
    }

    /// The stuck-transition fault that put the board in `FAULT`, if any.
    pub fn stuck_fault(&self) -> Option<&TileError> {
        self.stuck.as_ref()
    }

    /// Record acceptance of `command`, which drives the board towards
    /// `target` and/or legitimises a backward move.
    ///
    /// # Errors
    ///
    /// [`RejectReason::DuplicateTransition`] when the same target is
    /// already pending.
    pub fn begin(
        &mut self,
        command: &str,
        target: Option<ProgrammingState>,
        resets: bool,
    ) -> Result<(), TileError> {
        if let Some(target) = target {
            if self.pending() == Some(target) {
                return Err(TileError::rejected(
                    &self.device,
                    command,
                    RejectReason::DuplicateTransition(target),
                ));
            }
            self.pending = Some(Pending {
                target,
                exact: resets,
            });
        }
        if resets {
            self.reset_pending = true;
        }
        Ok(())
    }

    /// The triggering command failed; nothing is expected any more.
    pub fn abandon(&mut self) {
        self.pending = None;
        self.reset_pending = false;
    }

    /// A reset (power-off) was requested from outside the command path.
    pub fn expect_reset(&mut self) {
        self.reset_pending = true;
    }

    /// Explicit reset: back to `UNCONNECTED`, to be re-derived by the next
    /// poll cycle.
    pub fn reset(&mut self) -> Option<StateChange> {
        let from = self.state;
        self.state = ProgrammingState::Unconnected;
        self.pending = None;
        self.reset_pending = false;
        self.fault_cause = None;
        self.stuck = None;
        (from != self.state).then_some(StateChange {
            from,
            to: self.state,
        })
    }

    /// Feed one derived observation. Returns the accepted move, if any.
    pub fn observe(&mut self, derived: Option<ProgrammingState>) -> Option<StateChange> {
        let observed = derived?;
        let from = self.state;

        if observed == ProgrammingState::Fault {
            if from == ProgrammingState::Fault {
                return None;
            }
            return self.fault("hardware reported a fault".to_string());
        }
        if from == ProgrammingState::Fault {
            if !self.reset_pending {
                return None;
            }
            self.reset_pending = false;
            self.fault_cause = None;
            self.stuck = None;
            return self.move_to(observed);
        }
        if observed == from {
            self.confirm(observed);
            return None;
        }
        let forward = from.allows_forward(observed);
        if forward || observed == ProgrammingState::Unconnected {
            self.move_to(observed)
        } else if self.reset_pending {
            self.reset_pending = false;
            self.move_to(observed)
        } else {
            self.fault(format!("unexpected regression {from} -> {observed}"))
        }
    }

    /// The watchdog gave up on the pending transition.
    pub fn stuck(&mut self, expected: ProgrammingState, waited_ms: u64) -> Option<StateChange> {
        let error = TileError::StuckTransition {
            device: self.device.clone(),
            expected,
            waited_ms,
        };
        let change = self.fault(error.to_string());
        self.stuck = Some(error);
        change
    }

    fn move_to(&mut self, to: ProgrammingState) -> Option<StateChange> {
        let from = self.state;
        self.state = to;
        self.confirm(to);
        Some(StateChange { from, to })
    }

    fn confirm(&mut self, observed: ProgrammingState) {
        let Some(pending) = self.pending else {
            return;
        };
        let reached = observed == pending.target
            || (!pending.exact
                && observed != ProgrammingState::Fault
                && pending.target.allows_forward(observed));
        if reached {
            self.pending = None;
        }
    }

    fn fault(&mut self, cause: String) -> Option<StateChange> {
        let from = self.state;
        warn!(device = %self.device, %from, %cause, "programming fault");
        self.state = ProgrammingState::Fault;
        self.pending = None;
        self.reset_pending = false;
        self.fault_cause = Some(cause);
        (from != ProgrammingState::Fault).then_some(StateChange {
            from,
            to: ProgrammingState::Fault,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tilemon_types::{AttributeValue, CacheEntry, Quality};

    fn entry(name: &str, value: bool, quality: Quality) -> (String, CacheEntry) {
        (
            name.to_string(),
            CacheEntry {
                name: name.to_string(),
                value: Some(AttributeValue::Bool(value)),
                quality,
                updated_at: None,
                age: None,
                polling_period: Duration::from_secs(1),
            },
        )
    }

    fn snapshot(flags: &[(&str, bool, Quality)]) -> DeviceSnapshot {
        DeviceSnapshot {
            device: "tile1".into(),
            online: true,
            comm_fault: None,
            entries: flags
                .iter()
                .map(|(n, v, q)| entry(n, *v, *q))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn highest_fresh_flag_wins() {
        let snap = snapshot(&[
            (IS_PROGRAMMED, true, Quality::Fresh),
            (IS_INITIALISED, true, Quality::Fresh),
            (IS_SYNCHRONISED, false, Quality::Fresh),
        ]);
        assert_eq!(
            derive_programming_state(&snap, PowerState::On),
            Some(ProgrammingState::Initialised)
        );
    }

    #[test]
    fn stale_flag_holds_state() {
        let snap = snapshot(&[
            (IS_PROGRAMMED, true, Quality::Fresh),
            (IS_INITIALISED, true, Quality::Stale),
        ]);
        assert_eq!(derive_programming_state(&snap, PowerState::On), None);
    }

    #[test]
    fn power_and_fault_take_precedence() {
        let snap = snapshot(&[
            (IS_PROGRAMMED, true, Quality::Fresh),
            (HARDWARE_FAULT, false, Quality::Fresh),
        ]);
        assert_eq!(
            derive_programming_state(&snap, PowerState::Standby),
            Some(ProgrammingState::Off)
        );
        let faulty = snapshot(&[(HARDWARE_FAULT, true, Quality::Fresh)]);
        assert_eq!(
            derive_programming_state(&faulty, PowerState::On),
            Some(ProgrammingState::Fault)
        );
    }

    #[test]
    fn unreachable_board_is_unconnected() {
        let mut snap = snapshot(&[]);
        snap.online = false;
        assert_eq!(
            derive_programming_state(&snap, PowerState::Unknown),
            Some(ProgrammingState::Unconnected)
        );
    }

    #[test]
    fn pending_marker_blocks_duplicates_until_confirmed() {
        let mut m = ProgrammingStateMachine::new("tile1".into());
        m.observe(Some(ProgrammingState::Unprogrammed));
        m.begin("DownloadFirmware", Some(ProgrammingState::Programmed), false)
            .unwrap();
        assert_eq!(m.status().to_string(), "PROGRAMMED-PENDING");
        assert_eq!(m.state(), ProgrammingState::Unprogrammed);

        let err = m
            .begin("DownloadFirmware", Some(ProgrammingState::Programmed), false)
            .unwrap_err();
        assert!(matches!(
            err,
            TileError::CommandRejected {
                reason: RejectReason::DuplicateTransition(ProgrammingState::Programmed),
                ..
            }
        ));

        let change = m.observe(Some(ProgrammingState::Programmed)).unwrap();
        assert_eq!(change.to, ProgrammingState::Programmed);
        assert_eq!(m.pending(), None);
    }

    #[test]
    fn unexpected_regression_is_a_fault() {
        let mut m = ProgrammingStateMachine::new("tile1".into());
        m.observe(Some(ProgrammingState::Initialised));
        let change = m.observe(Some(ProgrammingState::Programmed)).unwrap();
        assert_eq!(change.to, ProgrammingState::Fault);
        assert!(m.status().fault_cause.unwrap().contains("INITIALISED -> PROGRAMMED"));

        // Stays in FAULT until a reset.
        assert_eq!(m.observe(Some(ProgrammingState::Initialised)), None);
        assert_eq!(m.state(), ProgrammingState::Fault);
    }

    #[test]
    fn power_off_legitimises_backward_move() {
        let mut m = ProgrammingStateMachine::new("tile1".into());
        m.observe(Some(ProgrammingState::Synchronised));
        m.begin("PowerOff", Some(ProgrammingState::Off), true).unwrap();
        // Before the power drop is seen the marker must survive.
        assert_eq!(m.observe(Some(ProgrammingState::Synchronised)), None);
        assert_eq!(m.pending(), Some(ProgrammingState::Off));

        let change = m.observe(Some(ProgrammingState::Off)).unwrap();
        assert_eq!(change.to, ProgrammingState::Off);
        assert_eq!(m.pending(), None);
    }

    #[test]
    fn reset_fault_leaves_fault() {
        let mut m = ProgrammingStateMachine::new("tile1".into());
        m.observe(Some(ProgrammingState::Fault));
        m.begin("ResetFault", None, true).unwrap();
        let change = m.observe(Some(ProgrammingState::Programmed)).unwrap();
        assert_eq!(change.from, ProgrammingState::Fault);
        assert_eq!(m.status().fault_cause, None);
    }

    #[test]
    fn stuck_transition_faults_with_cause() {
        let mut m = ProgrammingStateMachine::new("tile1".into());
        m.observe(Some(ProgrammingState::Programmed));
        m.begin("Initialise", Some(ProgrammingState::Initialised), false)
            .unwrap();
        m.stuck(ProgrammingState::Initialised, 5000).unwrap();
        assert_eq!(m.state(), ProgrammingState::Fault);
        assert!(matches!(m.stuck_fault(), Some(TileError::StuckTransition { .. })));

        m.reset();
        assert_eq!(m.state(), ProgrammingState::Unconnected);
        assert!(m.stuck_fault().is_none());
        assert!(m.observe(Some(ProgrammingState::Programmed)).is_some());
    }

    #[test]
    fn losing_contact_is_not_a_regression() {
        let mut m = ProgrammingStateMachine::new("tile1".into());
        m.observe(Some(ProgrammingState::Initialised));
        let change = m.observe(Some(ProgrammingState::Unconnected)).unwrap();
        assert_eq!(change.to, ProgrammingState::Unconnected);
    }
}
