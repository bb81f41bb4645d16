//! Command tasks and the hardware command response envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DeviceId;

/// Reserved command name for the hardware's "is this command still
/// running" query. Called with `{"command": <name>}`.
pub const COMPLETION_QUERY: &str = "command_completed";

pub type TaskId = Uuid;

/// Lifecycle status of a [`CommandTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Accepted locally, not yet dispatched to the hardware.
    Pending,
    /// Dispatched and acknowledged by the hardware.
    InProgress,
    Completed,
    Failed,
    TimedOut,
    /// Completion polling stopped by the caller. The hardware mutation, if
    /// already issued, is not retracted.
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, CommandStatus::Pending | CommandStatus::InProgress)
    }
}

/// One submitted command and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTask {
    pub id: TaskId,
    pub device: DeviceId,
    pub command: String,
    /// Parameters after local validation.
    pub params: serde_json::Value,
    pub status: CommandStatus,
    pub issued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CommandTask {
    pub fn new(device: DeviceId, command: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            command: command.into(),
            params,
            status: CommandStatus::Pending,
            issued_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            device: self.device.clone(),
            command: self.command.clone(),
        }
    }
}

/// Caller-side reference to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub device: DeviceId,
    pub command: String,
}

/// Status word of a hardware command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Executed to completion.
    Ok,
    /// Accepted and running in the background.
    Started,
    /// Refused because another mutating request is being executed.
    Busy,
    Error,
}

/// `{status, result | error}` as returned by `execute_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(result: Option<serde_json::Value>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            result,
            error: None,
        }
    }

    pub fn started() -> Self {
        Self {
            status: ResponseStatus::Started,
            result: None,
            error: None,
        }
    }

    pub fn busy() -> Self {
        Self {
            status: ResponseStatus::Busy,
            result: None,
            error: Some("device busy".to_string()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Answer to a [`COMPLETION_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionState {
    Running,
    Completed,
    Failed(String),
}

impl CompletionState {
    /// Parse `{"state": "running" | "completed" | "failed", "error": ..}`.
    pub fn from_result(result: &serde_json::Value) -> Option<Self> {
        match result.get("state")?.as_str()? {
            "running" => Some(CompletionState::Running),
            "completed" => Some(CompletionState::Completed),
            "failed" => Some(CompletionState::Failed(
                result
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("command failed")
                    .to_string(),
            )),
            _ => None,
        }
    }

    pub fn to_result(&self) -> serde_json::Value {
        match self {
            CompletionState::Running => serde_json::json!({ "state": "running" }),
            CompletionState::Completed => serde_json::json!({ "state": "completed" }),
            CompletionState::Failed(error) => {
                serde_json::json!({ "state": "failed", "error": error })
            }
        }
    }
}
