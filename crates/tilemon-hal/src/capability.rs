//! The uniform hardware capability.
//!
//! The core never speaks HTTP or register maps directly. Every adapter
//! variant presents the same three operations, and everything above the HAL
//! (poller, executor, orchestrators) talks only to this trait through a
//! [`DeviceEndpoint`][crate::registry::DeviceEndpoint].

use async_trait::async_trait;
use tilemon_types::{
    AttributeReading, AttributeValue, COMPLETION_QUERY, CommandResponse, CompletionState,
    DeviceId, ResponseStatus, TileError,
};

/// `{get_attribute, set_attribute, execute_command}` over one device.
///
/// # Contract
///
/// * `get_attribute` – read one monitored value. An attribute the hardware
///   variant does not expose answers [`TileError::UnsupportedAttribute`] so
///   the poller can stop asking for it.
/// * `set_attribute` – write one value.
/// * `execute_command` – run a command. Long-running commands answer
///   [`ResponseStatus::Started`]; their progress is queried with the reserved
///   [`COMPLETION_QUERY`] command (see [`query_completion`]).
#[async_trait]
pub trait HardwareCapability: Send + Sync {
    async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError>;

    async fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<(), TileError>;

    async fn execute_command(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<CommandResponse, TileError>;
}

/// Ask the hardware whether `command` is still running.
///
/// A busy answer counts as still running. A malformed report or an error
/// status is a communication failure, which the caller may retry since the
/// query does not mutate anything.
pub async fn query_completion<C>(
    capability: &C,
    device: &DeviceId,
    command: &str,
) -> Result<CompletionState, TileError>
where
    C: HardwareCapability + ?Sized,
{
    let params = serde_json::json!({ "command": command });
    let response = capability.execute_command(COMPLETION_QUERY, &params).await?;
    match response.status {
        ResponseStatus::Ok => response
            .result
            .as_ref()
            .and_then(CompletionState::from_result)
            .ok_or_else(|| {
                TileError::communication(device, format!("malformed completion report for {command}"))
            }),
        ResponseStatus::Busy | ResponseStatus::Started => Ok(CompletionState::Running),
        ResponseStatus::Error => Err(TileError::communication(
            device,
            response
                .error
                .unwrap_or_else(|| format!("completion query for {command} failed")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(CommandResponse);

    #[async_trait]
    impl HardwareCapability for Scripted {
        async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError> {
            Err(TileError::UnsupportedAttribute {
                device: "x".into(),
                attribute: name.to_string(),
            })
        }

        async fn set_attribute(&self, _: &str, _: &AttributeValue) -> Result<(), TileError> {
            Ok(())
        }

        async fn execute_command(
            &self,
            name: &str,
            params: &serde_json::Value,
        ) -> Result<CommandResponse, TileError> {
            assert_eq!(name, COMPLETION_QUERY);
            assert_eq!(params["command"], "Initialise");
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn completed_report_is_parsed() {
        let cap = Scripted(CommandResponse::ok(Some(CompletionState::Completed.to_result())));
        let state = query_completion(&cap, &"tile1".into(), "Initialise").await.unwrap();
        assert_eq!(state, CompletionState::Completed);
    }

    #[tokio::test]
    async fn busy_means_running() {
        let cap = Scripted(CommandResponse::busy());
        let state = query_completion(&cap, &"tile1".into(), "Initialise").await.unwrap();
        assert_eq!(state, CompletionState::Running);
    }

    #[tokio::test]
    async fn malformed_report_is_a_communication_error() {
        let cap = Scripted(CommandResponse::ok(Some(serde_json::json!({ "done": 1 }))));
        let err = query_completion(&cap, &"tile1".into(), "Initialise").await.unwrap_err();
        assert!(err.is_communication());
    }
}
