//! `tilemon-types` – shared data model for the station monitoring core.
//!
//! Every other crate in the workspace speaks in these types: device
//! identifiers, attribute values and cache entries, command tasks, the
//! programming / power / health state enums, bus events, and the single
//! [`TileError`] fault taxonomy.

pub mod command;
pub mod error;
pub mod event;
pub mod health;
pub mod state;
pub mod value;

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use command::{
    COMPLETION_QUERY, CommandResponse, CommandStatus, CommandTask, CompletionState,
    ResponseStatus, TaskHandle, TaskId,
};
pub use error::{RejectReason, TileError};
pub use event::{Event, EventPayload};
pub use health::{HealthRule, HealthVerdict, RuleBound, Severity, Violation};
pub use state::{PowerState, ProgrammingState, ProgrammingStatus};
pub use value::{AttributeReading, AttributeValue, CacheEntry, DeviceSnapshot, Quality};

/// Stable identifier of a device endpoint or power-tree node, e.g.
/// `"subrack1"` or `"tile3"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn device_id_is_transparent_in_json() {
        let id = DeviceId::from("tile1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tile1\"");
    }

    #[test]
    fn device_id_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(DeviceId::from("subrack1"), 7);
        assert_eq!(map.get("subrack1"), Some(&7));
    }
}
