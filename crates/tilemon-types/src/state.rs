//! Programming and power state enums.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::AttributeValue;

/// Observed lifecycle stage of a processing board.
///
/// The forward chain is `Unconnected → Off → Unprogrammed → Programmed →
/// Initialised → Synchronised`; `Fault` sits outside the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgrammingState {
    Unconnected,
    Off,
    Unprogrammed,
    Programmed,
    Initialised,
    Synchronised,
    Fault,
}

impl ProgrammingState {
    /// Position on the forward chain. `None` for [`ProgrammingState::Fault`].
    pub fn rank(self) -> Option<u8> {
        match self {
            ProgrammingState::Unconnected => Some(0),
            ProgrammingState::Off => Some(1),
            ProgrammingState::Unprogrammed => Some(2),
            ProgrammingState::Programmed => Some(3),
            ProgrammingState::Initialised => Some(4),
            ProgrammingState::Synchronised => Some(5),
            ProgrammingState::Fault => None,
        }
    }

    /// `true` when moving from `self` to `next` does not go backwards.
    pub fn allows_forward(self, next: ProgrammingState) -> bool {
        match (self.rank(), next.rank()) {
            (Some(a), Some(b)) => b >= a,
            _ => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProgrammingState::Unconnected => "UNCONNECTED",
            ProgrammingState::Off => "OFF",
            ProgrammingState::Unprogrammed => "UNPROGRAMMED",
            ProgrammingState::Programmed => "PROGRAMMED",
            ProgrammingState::Initialised => "INITIALISED",
            ProgrammingState::Synchronised => "SYNCHRONISED",
            ProgrammingState::Fault => "FAULT",
        }
    }
}

impl fmt::Display for ProgrammingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Confirmed programming state plus the shadow marker of an accepted but
/// not yet observed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammingStatus {
    pub state: ProgrammingState,
    pub pending: Option<ProgrammingState>,
    pub fault_cause: Option<String>,
}

impl fmt::Display for ProgrammingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pending {
            Some(target) => write!(f, "{}-PENDING", target),
            None => write!(f, "{}", self.state),
        }
    }
}

/// Power level of a power-tree node. Ordered `Unknown < Off < Standby < On`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    #[default]
    Unknown,
    Off,
    Standby,
    On,
}

impl PowerState {
    /// Interpret a hardware power reading.
    ///
    /// Accepts booleans, `"ON"`/`"OFF"`/`"STANDBY"` text in any case, and
    /// the integer encoding `0 = off`, `1 = standby`, `2 = on`.
    pub fn from_value(value: &AttributeValue) -> PowerState {
        match value {
            AttributeValue::Bool(true) => PowerState::On,
            AttributeValue::Bool(false) => PowerState::Off,
            AttributeValue::Int(0) => PowerState::Off,
            AttributeValue::Int(1) => PowerState::Standby,
            AttributeValue::Int(2) => PowerState::On,
            AttributeValue::Text(s) => match s.to_ascii_uppercase().as_str() {
                "ON" => PowerState::On,
                "OFF" => PowerState::Off,
                "STANDBY" => PowerState::Standby,
                _ => PowerState::Unknown,
            },
            _ => PowerState::Unknown,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Unknown => "UNKNOWN",
            PowerState::Off => "OFF",
            PowerState::Standby => "STANDBY",
            PowerState::On => "ON",
        };
        f.write_str(s)
    }
}
