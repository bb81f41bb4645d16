//! Events routed over the station event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DeviceId;
use crate::command::{CommandStatus, TaskId};
use crate::state::ProgrammingState;
use crate::value::AttributeValue;

/// Unified event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"tilemon-runtime::poller"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    /// Device the event concerns.
    pub fn device(&self) -> &DeviceId {
        match &self.payload {
            EventPayload::AttributeChanged { device, .. }
            | EventPayload::CommunicationFault { device, .. }
            | EventPayload::CommunicationRestored { device }
            | EventPayload::CommandFinished { device, .. }
            | EventPayload::StuckTransition { device, .. }
            | EventPayload::ProgrammingStateChanged { device, .. } => device,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A polled value moved by more than its epsilon.
    AttributeChanged {
        device: DeviceId,
        attribute: String,
        value: AttributeValue,
    },
    /// Consecutive poll failures reached the escalation threshold.
    CommunicationFault {
        device: DeviceId,
        consecutive_failures: u32,
        details: String,
    },
    CommunicationRestored {
        device: DeviceId,
    },
    CommandFinished {
        device: DeviceId,
        task_id: TaskId,
        command: String,
        status: CommandStatus,
    },
    StuckTransition {
        device: DeviceId,
        expected: ProgrammingState,
    },
    ProgrammingStateChanged {
        device: DeviceId,
        from: ProgrammingState,
        to: ProgrammingState,
    },
}
