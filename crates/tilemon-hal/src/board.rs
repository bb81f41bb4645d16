//! [`BoardAdapter`] – register-map access to processing boards.
//!
//! Processing boards are driven through a flat 32-bit register space. The
//! transport that moves register reads and writes over the network is a
//! separate concern behind the [`RegisterAccess`] trait; this adapter only
//! knows the [`RegisterMap`]: which register holds which attribute, and
//! which register writes make up each command.
//!
//! Long-running commands name a `busy` register. While it reads non-zero the
//! command is still running; afterwards an optional `error` register
//! distinguishes success from failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tilemon_types::{
    AttributeReading, AttributeValue, COMPLETION_QUERY, CommandResponse, CompletionState,
    DeviceId, RejectReason, TileError,
};

use crate::capability::HardwareCapability;

/// Raw register transport of one board.
#[async_trait]
pub trait RegisterAccess: Send + Sync {
    async fn read_register(&self, address: u32) -> Result<u32, TileError>;

    async fn write_register(&self, address: u32, value: u32) -> Result<(), TileError>;
}

/// How a register's raw word maps onto an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Non-zero is `true`.
    Bool,
    #[default]
    Unsigned,
    /// Two's-complement word multiplied by the field's `scale`.
    Scaled,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterField {
    pub address: u32,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

impl RegisterField {
    pub fn new(address: u32, kind: FieldKind) -> Self {
        Self {
            address,
            kind,
            scale: 1.0,
        }
    }

    pub fn scaled(address: u32, scale: f64) -> Self {
        Self {
            address,
            kind: FieldKind::Scaled,
            scale,
        }
    }
}

impl RegisterField {
    fn decode(&self, raw: u32) -> AttributeValue {
        match self.kind {
            FieldKind::Bool => AttributeValue::Bool(raw != 0),
            FieldKind::Unsigned => AttributeValue::Int(i64::from(raw)),
            FieldKind::Scaled => AttributeValue::Float(f64::from(raw as i32) * self.scale),
        }
    }

    fn encode(&self, value: &AttributeValue) -> Option<u32> {
        match (self.kind, value) {
            (FieldKind::Bool, v) => v.as_bool().map(u32::from),
            (FieldKind::Unsigned, AttributeValue::Int(v)) => u32::try_from(*v).ok(),
            (FieldKind::Scaled, v) if self.scale != 0.0 => {
                let raw = (v.as_f64()? / self.scale).round();
                (raw >= f64::from(i32::MIN) && raw <= f64::from(i32::MAX))
                    .then_some(raw as i32 as u32)
            }
            _ => None,
        }
    }
}

/// Source of a value written by a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteSource {
    Constant(u32),
    /// Take the named (already validated) command parameter.
    Param { param: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub address: u32,
    pub value: WriteSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegisterCommand {
    pub writes: Vec<RegisterWrite>,
    /// Non-zero while the command runs. Commands without one complete
    /// synchronously.
    #[serde(default)]
    pub busy: Option<u32>,
    #[serde(default)]
    pub error: Option<u32>,
}

/// Attribute and command layout of a board firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegisterMap {
    #[serde(default)]
    pub attributes: BTreeMap<String, RegisterField>,
    #[serde(default)]
    pub commands: BTreeMap<String, RegisterCommand>,
}

/// Adapter for one processing board.
pub struct BoardAdapter {
    device: DeviceId,
    map: RegisterMap,
    registers: Arc<dyn RegisterAccess>,
}

impl BoardAdapter {
    pub fn new(device: DeviceId, map: RegisterMap, registers: Arc<dyn RegisterAccess>) -> Self {
        Self {
            device,
            map,
            registers,
        }
    }

    fn field(&self, name: &str) -> Result<&RegisterField, TileError> {
        self.map
            .attributes
            .get(name)
            .ok_or_else(|| TileError::UnsupportedAttribute {
                device: self.device.clone(),
                attribute: name.to_string(),
            })
    }

    fn resolve(
        &self,
        command: &str,
        source: &WriteSource,
        params: &serde_json::Value,
    ) -> Result<u32, TileError> {
        match source {
            WriteSource::Constant(v) => Ok(*v),
            WriteSource::Param { param } => params
                .get(param)
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    TileError::rejected(
                        &self.device,
                        command,
                        RejectReason::InvalidParameters(format!(
                            "{param} does not fit a 32-bit register"
                        )),
                    )
                }),
        }
    }

    async fn completion(&self, command: &str) -> Result<CompletionState, TileError> {
        let Some(spec) = self.map.commands.get(command) else {
            return Ok(CompletionState::Failed(format!("unknown command {command}")));
        };
        if let Some(busy) = spec.busy {
            if self.registers.read_register(busy).await? != 0 {
                return Ok(CompletionState::Running);
            }
        }
        if let Some(error) = spec.error {
            let code = self.registers.read_register(error).await?;
            if code != 0 {
                return Ok(CompletionState::Failed(format!("error code {code:#x}")));
            }
        }
        Ok(CompletionState::Completed)
    }
}

#[async_trait]
impl HardwareCapability for BoardAdapter {
    async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError> {
        let field = self.field(name)?;
        let raw = self.registers.read_register(field.address).await?;
        Ok(AttributeReading::fresh(field.decode(raw)))
    }

    async fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<(), TileError> {
        let field = self.field(name)?;
        let raw = field.encode(value).ok_or_else(|| {
            TileError::rejected(
                &self.device,
                name,
                RejectReason::InvalidParameters(format!("{value} does not fit register {name}")),
            )
        })?;
        self.registers.write_register(field.address, raw).await
    }

    async fn execute_command(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<CommandResponse, TileError> {
        if name == COMPLETION_QUERY {
            let command = params
                .get("command")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let state = self.completion(command).await?;
            return Ok(CommandResponse::ok(Some(state.to_result())));
        }
        let Some(spec) = self.map.commands.get(name) else {
            return Ok(CommandResponse::error(format!("command {name} not in register map")));
        };
        if let Some(busy) = spec.busy {
            if self.registers.read_register(busy).await? != 0 {
                return Ok(CommandResponse::busy());
            }
        }
        for write in &spec.writes {
            let value = self.resolve(name, &write.value, params)?;
            self.registers.write_register(write.address, value).await?;
        }
        Ok(if spec.busy.is_some() {
            CommandResponse::started()
        } else {
            CommandResponse::ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryRegisters;
    use tilemon_types::ResponseStatus;

    const TEMP: u32 = 0x10;
    const PROGRAMMED: u32 = 0x20;
    const START_TIME: u32 = 0x30;
    const START_STROBE: u32 = 0x34;
    const BUSY: u32 = 0x38;

    fn adapter(regs: Arc<MemoryRegisters>) -> BoardAdapter {
        let mut map = RegisterMap::default();
        map.attributes.insert(
            "board_temperature".into(),
            RegisterField::scaled(TEMP, 0.01),
        );
        map.attributes.insert(
            "is_programmed".into(),
            RegisterField::new(PROGRAMMED, FieldKind::Bool),
        );
        map.commands.insert(
            "StartAcquisition".into(),
            RegisterCommand {
                writes: vec![
                    RegisterWrite {
                        address: START_TIME,
                        value: WriteSource::Param {
                            param: "start_time".into(),
                        },
                    },
                    RegisterWrite {
                        address: START_STROBE,
                        value: WriteSource::Constant(1),
                    },
                ],
                busy: Some(BUSY),
                error: None,
            },
        );
        BoardAdapter::new("tile1".into(), map, regs)
    }

    #[tokio::test]
    async fn scaled_and_boolean_registers_decode() {
        let regs = Arc::new(MemoryRegisters::new());
        regs.set(TEMP, 7200);
        regs.set(PROGRAMMED, 1);
        let board = adapter(regs);

        let temp = board.get_attribute("board_temperature").await.unwrap();
        assert!((temp.value.as_f64().unwrap() - 72.0).abs() < 1e-9);
        let programmed = board.get_attribute("is_programmed").await.unwrap();
        assert_eq!(programmed.value, AttributeValue::Bool(true));
    }

    #[tokio::test]
    async fn unmapped_attribute_is_unsupported() {
        let board = adapter(Arc::new(MemoryRegisters::new()));
        let err = board.get_attribute("fan_speed").await.unwrap_err();
        assert!(matches!(err, TileError::UnsupportedAttribute { .. }));
    }

    #[tokio::test]
    async fn command_writes_parameters_then_reports_progress() {
        let regs = Arc::new(MemoryRegisters::new());
        let board = adapter(regs.clone());

        let response = board
            .execute_command("StartAcquisition", &serde_json::json!({ "start_time": 1_700_000_000u64 }))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Started);
        assert_eq!(regs.get(START_TIME), 1_700_000_000);
        assert_eq!(regs.get(START_STROBE), 1);

        regs.set(BUSY, 1);
        let query = serde_json::json!({ "command": "StartAcquisition" });
        let running = board.execute_command(COMPLETION_QUERY, &query).await.unwrap();
        assert_eq!(
            running.result.as_ref().and_then(CompletionState::from_result),
            Some(CompletionState::Running)
        );

        regs.set(BUSY, 0);
        let done = board.execute_command(COMPLETION_QUERY, &query).await.unwrap();
        assert_eq!(
            done.result.as_ref().and_then(CompletionState::from_result),
            Some(CompletionState::Completed)
        );
    }

    #[tokio::test]
    async fn busy_register_refuses_a_second_command() {
        let regs = Arc::new(MemoryRegisters::new());
        regs.set(BUSY, 1);
        let board = adapter(regs);
        let response = board
            .execute_command("StartAcquisition", &serde_json::json!({ "start_time": 5 }))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Busy);
    }

    #[test]
    fn scaled_encoding_round_trips_negative_values() {
        let field = RegisterField::scaled(0, 0.5);
        let raw = field.encode(&AttributeValue::Float(-3.0)).unwrap();
        assert_eq!(field.decode(raw), AttributeValue::Float(-3.0));
    }
}
