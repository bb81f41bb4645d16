//! The fault taxonomy shared by every crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DeviceId, TaskId};
use crate::state::ProgrammingState;

/// Why a command was refused before (or instead of) being executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The device already has an in-flight task, or the hardware reported
    /// it is executing another mutating request.
    Busy,
    InvalidParameters(String),
    UnknownCommand,
    /// The same transition is already pending confirmation.
    DuplicateTransition(ProgrammingState),
    DeviceOffline,
    /// Descendants in the power tree are still on.
    DependentsPowered(Vec<DeviceId>),
    /// An ancestor in the power tree is below standby.
    AncestorUnpowered(DeviceId),
    /// The hardware answered with an error status.
    Hardware(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Busy => f.write_str("BUSY"),
            RejectReason::InvalidParameters(why) => write!(f, "invalid parameters: {why}"),
            RejectReason::UnknownCommand => f.write_str("unknown command"),
            RejectReason::DuplicateTransition(target) => {
                write!(f, "transition to {target} already pending")
            }
            RejectReason::DeviceOffline => f.write_str("device offline"),
            RejectReason::DependentsPowered(ids) => {
                let names: Vec<&str> = ids.iter().map(DeviceId::as_str).collect();
                write!(f, "dependents still powered: {}", names.join(", "))
            }
            RejectReason::AncestorUnpowered(id) => write!(f, "ancestor {id} below STANDBY"),
            RejectReason::Hardware(why) => write!(f, "hardware error: {why}"),
        }
    }
}

/// Fault taxonomy spanning communication, command, state-machine and
/// configuration failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TileError {
    /// A network call failed. `permanent` is set once the poller escalated
    /// the device after consecutive failures.
    #[error("Communication fault on {device}: {details}")]
    Communication {
        device: DeviceId,
        details: String,
        permanent: bool,
    },

    #[error("Command {command} rejected by {device}: {reason}")]
    CommandRejected {
        device: DeviceId,
        command: String,
        reason: RejectReason,
    },

    #[error("Command {command} on {device} timed out after {timeout_ms} ms")]
    CommandTimeout {
        device: DeviceId,
        command: String,
        timeout_ms: u64,
    },

    #[error("Stuck transition on {device}: {expected} not observed within {waited_ms} ms")]
    StuckTransition {
        device: DeviceId,
        expected: ProgrammingState,
        waited_ms: u64,
    },

    #[error("Configuration fault: {0}")]
    Configuration(String),

    #[error("Attribute {attribute} is not supported by {device}")]
    UnsupportedAttribute { device: DeviceId, attribute: String },

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// The task never existed or was purged after the retention window.
    #[error("Task {task_id} on {device} is no longer retained")]
    UnknownTask { device: DeviceId, task_id: TaskId },
}

impl TileError {
    /// Transient communication failure.
    pub fn communication(device: &DeviceId, details: impl Into<String>) -> Self {
        TileError::Communication {
            device: device.clone(),
            details: details.into(),
            permanent: false,
        }
    }

    pub fn rejected(device: &DeviceId, command: &str, reason: RejectReason) -> Self {
        TileError::CommandRejected {
            device: device.clone(),
            command: command.to_string(),
            reason,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TileError::CommandRejected {
                reason: RejectReason::Busy,
                ..
            }
        )
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, TileError::Communication { .. })
    }
}
