//! [`DeviceAdapter`] – the closed set of hardware variants.
//!
//! Device kinds are known at configuration time, so the variants are an
//! enum rather than open-ended trait objects. Each variant delegates to its
//! own [`HardwareCapability`] implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tilemon_types::{AttributeReading, AttributeValue, CommandResponse, DeviceId, TileError};

use crate::board::{BoardAdapter, RegisterAccess, RegisterMap};
use crate::capability::HardwareCapability;
use crate::rack::RackHttpAdapter;
use crate::sim::{MemoryRegisters, SimConfig, SimDevice};

/// Address prefix selecting the in-memory register file for a board.
pub const MEMORY_TRANSPORT: &str = "mem://";

/// How a configured device is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    /// HTTP/JSON management board at `address`.
    Rack,
    /// Register-mapped processing board.
    Board {
        #[serde(default)]
        registers: RegisterMap,
    },
    /// In-process simulation.
    Simulated(SimConfig),
}

pub enum DeviceAdapter {
    Rack(RackHttpAdapter),
    Board(BoardAdapter),
    Simulated(Arc<SimDevice>),
}

impl DeviceAdapter {
    /// Build the adapter for a configured device.
    ///
    /// Boards need a register transport; only the in-memory one
    /// (`mem://...` addresses) can be built from configuration. Other
    /// transports are supplied through [`DeviceAdapter::board`].
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the adapter cannot be built.
    pub fn from_config(
        id: &DeviceId,
        address: &str,
        config: &AdapterConfig,
        io_timeout: Duration,
    ) -> Result<Self, TileError> {
        match config {
            AdapterConfig::Rack => Ok(DeviceAdapter::Rack(RackHttpAdapter::new(
                id.clone(),
                address,
                io_timeout,
            )?)),
            AdapterConfig::Board { registers } if address.starts_with(MEMORY_TRANSPORT) => Ok(
                DeviceAdapter::board(id.clone(), registers.clone(), Arc::new(MemoryRegisters::new())),
            ),
            AdapterConfig::Board { .. } => Err(TileError::Configuration(format!(
                "{id}: no register transport for {address}"
            ))),
            AdapterConfig::Simulated(sim) => Ok(DeviceAdapter::Simulated(Arc::new(
                SimDevice::from_config(id.clone(), sim)?,
            ))),
        }
    }

    pub fn board(id: DeviceId, map: RegisterMap, registers: Arc<dyn RegisterAccess>) -> Self {
        DeviceAdapter::Board(BoardAdapter::new(id, map, registers))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceAdapter::Rack(_) => "rack",
            DeviceAdapter::Board(_) => "board",
            DeviceAdapter::Simulated(_) => "simulated",
        }
    }

    fn inner(&self) -> &dyn HardwareCapability {
        match self {
            DeviceAdapter::Rack(a) => a,
            DeviceAdapter::Board(a) => a,
            DeviceAdapter::Simulated(a) => a.as_ref(),
        }
    }
}

#[async_trait]
impl HardwareCapability for DeviceAdapter {
    async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError> {
        self.inner().get_attribute(name).await
    }

    async fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<(), TileError> {
        self.inner().set_attribute(name, value).await
    }

    async fn execute_command(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<CommandResponse, TileError> {
        self.inner().execute_command(name, params).await
    }
}
