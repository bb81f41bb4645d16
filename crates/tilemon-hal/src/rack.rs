//! [`RackHttpAdapter`] – HTTP/JSON access to rack-management boards.
//!
//! Subrack management boards expose a small web API. Every operation is a
//! `GET {base}/get/` with query parameters:
//!
//! | Operation | Query |
//! |---|---|
//! | read attribute | `type=getattribute&param=<name>` |
//! | write attribute | `type=setattribute&param=<name>&value=<json>` |
//! | command | `type=command&param=<name>&value=<json params>` |
//!
//! and answers a JSON envelope `{"status", "info", "retvalue"}` where
//! `status` is one of `OK`, `STARTED`, `BUSY`, `ERROR`, `UNSUPPORTED`.
//!
//! The board's own `command_completed` command returns a boolean; it is
//! translated into the uniform `{"state": ..}` completion report.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tilemon_types::{
    AttributeReading, AttributeValue, COMPLETION_QUERY, CommandResponse, CompletionState,
    DeviceId, RejectReason, TileError,
};
use tracing::debug;

use crate::capability::HardwareCapability;

/// Response envelope of the management board.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RackReply {
    status: String,
    #[serde(default)]
    info: String,
    #[serde(default)]
    retvalue: serde_json::Value,
}

impl RackReply {
    fn status(&self) -> &str {
        self.status.as_str()
    }

    fn info_or(&self, fallback: &str) -> String {
        if self.info.is_empty() {
            fallback.to_string()
        } else {
            self.info.clone()
        }
    }

    pub(crate) fn into_reading(self, device: &DeviceId, name: &str) -> Result<AttributeReading, TileError> {
        match self.status() {
            "OK" => AttributeValue::from_json(&self.retvalue)
                .map(AttributeReading::fresh)
                .ok_or_else(|| {
                    TileError::communication(device, format!("attribute {name} returned no value"))
                }),
            "UNSUPPORTED" => Err(TileError::UnsupportedAttribute {
                device: device.clone(),
                attribute: name.to_string(),
            }),
            _ => Err(TileError::communication(device, self.info_or("read failed"))),
        }
    }

    pub(crate) fn into_write(self, device: &DeviceId, name: &str) -> Result<(), TileError> {
        match self.status() {
            "OK" => Ok(()),
            "UNSUPPORTED" => Err(TileError::UnsupportedAttribute {
                device: device.clone(),
                attribute: name.to_string(),
            }),
            "BUSY" => Err(TileError::rejected(device, name, RejectReason::Busy)),
            _ => Err(TileError::rejected(
                device,
                name,
                RejectReason::Hardware(self.info_or("write failed")),
            )),
        }
    }

    pub(crate) fn into_command_response(self, name: &str) -> CommandResponse {
        if name == COMPLETION_QUERY {
            let state = match (self.status(), self.retvalue.as_bool()) {
                ("OK", Some(true)) => CompletionState::Completed,
                ("OK", _) | ("BUSY", _) => CompletionState::Running,
                _ => CompletionState::Failed(self.info_or("command failed")),
            };
            return CommandResponse::ok(Some(state.to_result()));
        }
        match self.status() {
            "OK" => CommandResponse::ok(match &self.retvalue {
                serde_json::Value::Null => None,
                other => Some(other.clone()),
            }),
            "STARTED" => CommandResponse::started(),
            "BUSY" => CommandResponse::busy(),
            "UNSUPPORTED" => CommandResponse::error(format!("command {name} not supported")),
            _ => CommandResponse::error(self.info_or("command failed")),
        }
    }
}

/// Adapter for one rack-management board.
pub struct RackHttpAdapter {
    device: DeviceId,
    base_url: String,
    client: reqwest::Client,
}

impl RackHttpAdapter {
    /// Create an adapter for the board at `base_url` (e.g.
    /// `"http://10.0.10.80:8081"`).
    ///
    /// `connect_timeout` bounds connection setup only. Request deadlines are
    /// enforced by the endpoint, so a synchronous command may run for its
    /// own command timeout.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the HTTP client cannot be built.
    pub fn new(
        device: DeviceId,
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TileError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TileError::Configuration(format!("http client for {device}: {e}")))?;
        let base_url: String = base_url.into();
        Ok(Self {
            device,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(
        &self,
        kind: &str,
        param: &str,
        value: Option<String>,
    ) -> Result<RackReply, TileError> {
        let url = format!("{}/get/", self.base_url);
        let mut query = vec![("type", kind.to_string()), ("param", param.to_string())];
        if let Some(value) = value {
            query.push(("value", value));
        }
        debug!(device = %self.device, kind, param, "rack request");
        let comm = |e: reqwest::Error| TileError::communication(&self.device, e.to_string());
        self.client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(comm)?
            .error_for_status()
            .map_err(comm)?
            .json::<RackReply>()
            .await
            .map_err(comm)
    }
}

#[async_trait]
impl HardwareCapability for RackHttpAdapter {
    async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError> {
        self.request("getattribute", name, None)
            .await?
            .into_reading(&self.device, name)
    }

    async fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<(), TileError> {
        self.request("setattribute", name, Some(value.to_json().to_string()))
            .await?
            .into_write(&self.device, name)
    }

    async fn execute_command(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<CommandResponse, TileError> {
        let value = match params {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) if map.is_empty() => None,
            other => Some(other.to_string()),
        };
        Ok(self
            .request("command", name, value)
            .await?
            .into_command_response(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemon_types::ResponseStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn reply(json: serde_json::Value) -> RackReply {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn ok_reading_is_fresh() {
        let device = DeviceId::from("subrack1");
        let reading = reply(serde_json::json!({
            "status": "OK", "info": "", "retvalue": [41.5, 43.0]
        }))
        .into_reading(&device, "board_temperatures")
        .unwrap();
        assert_eq!(
            reading.value,
            AttributeValue::List(vec![41.5.into(), 43.0.into()])
        );
    }

    #[test]
    fn unsupported_attribute_is_reported_as_such() {
        let device = DeviceId::from("subrack1");
        let err = reply(serde_json::json!({ "status": "UNSUPPORTED" }))
            .into_reading(&device, "fan_speed")
            .unwrap_err();
        assert!(matches!(err, TileError::UnsupportedAttribute { .. }));
    }

    #[test]
    fn error_reading_is_a_communication_fault() {
        let device = DeviceId::from("subrack1");
        let err = reply(serde_json::json!({ "status": "ERROR", "info": "i2c timeout" }))
            .into_reading(&device, "power_supply_status")
            .unwrap_err();
        assert_eq!(
            err,
            TileError::Communication {
                device,
                details: "i2c timeout".into(),
                permanent: false
            }
        );
    }

    #[test]
    fn busy_write_is_rejected() {
        let device = DeviceId::from("subrack1");
        let err = reply(serde_json::json!({ "status": "BUSY" }))
            .into_write(&device, "fan_mode")
            .unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn command_statuses_map_onto_response() {
        let started = reply(serde_json::json!({ "status": "STARTED" }))
            .into_command_response("PowerOnTpm");
        assert_eq!(started.status, ResponseStatus::Started);

        let busy = reply(serde_json::json!({ "status": "BUSY" })).into_command_response("PowerOnTpm");
        assert_eq!(busy.status, ResponseStatus::Busy);

        let failed = reply(serde_json::json!({ "status": "ERROR", "info": "slot empty" }))
            .into_command_response("PowerOnTpm");
        assert_eq!(failed.error.as_deref(), Some("slot empty"));
    }

    #[test]
    fn completion_boolean_is_translated() {
        let done = reply(serde_json::json!({ "status": "OK", "retvalue": true }))
            .into_command_response(COMPLETION_QUERY);
        assert_eq!(
            done.result.as_ref().and_then(CompletionState::from_result),
            Some(CompletionState::Completed)
        );

        let running = reply(serde_json::json!({ "status": "OK", "retvalue": false }))
            .into_command_response(COMPLETION_QUERY);
        assert_eq!(
            running.result.as_ref().and_then(CompletionState::from_result),
            Some(CompletionState::Running)
        );
    }

    #[test]
    fn base_url_is_normalised() {
        let adapter =
            RackHttpAdapter::new("subrack1".into(), "http://10.0.10.80:8081/", Duration::from_secs(1))
                .unwrap();
        assert_eq!(adapter.base_url(), "http://10.0.10.80:8081");
    }

    #[tokio::test]
    async fn command_reply_may_take_longer_than_the_connect_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            tokio::time::sleep(Duration::from_millis(400)).await;
            let body = r#"{"status":"OK","info":"","retvalue":null}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let adapter = RackHttpAdapter::new(
            "subrack1".into(),
            format!("http://{address}"),
            Duration::from_millis(100),
        )
        .unwrap();
        let response = adapter
            .execute_command("PowerOnTpm", &serde_json::json!({ "tpm_slot": 1 }))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
    }
}
