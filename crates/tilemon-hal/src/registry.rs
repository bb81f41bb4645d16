//! [`DeviceRegistry`] – owner of every device endpoint.
//!
//! The registry is built once from configuration and never changes while
//! the station runs. Each [`DeviceEndpoint`] wraps one [`DeviceAdapter`]
//! with the policies every caller must get for free:
//!
//! * calls to one endpoint are serialized by a per-endpoint
//!   `tokio::sync::Mutex`, since the hardware handles one request at a time;
//! * every call carries an explicit `tokio::time::timeout`;
//! * a liveness flag, cleared by the poller when it escalates a
//!   communication fault and checked by the executor before submitting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tilemon_types::{
    AttributeReading, AttributeValue, CommandResponse, CompletionState, DeviceId, TileError,
};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::adapter::DeviceAdapter;
use crate::capability::{HardwareCapability, query_completion};
use crate::sim::SimDevice;

/// Per-call network timeout used when none is configured.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(3);

/// One network-attached device.
pub struct DeviceEndpoint {
    id: DeviceId,
    address: String,
    adapter: DeviceAdapter,
    io_timeout: Duration,
    online: AtomicBool,
    io_lock: Mutex<()>,
}

impl DeviceEndpoint {
    pub fn new(
        id: DeviceId,
        address: impl Into<String>,
        adapter: DeviceAdapter,
        io_timeout: Duration,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            adapter,
            io_timeout,
            online: AtomicBool::new(true),
            io_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn adapter(&self) -> &DeviceAdapter {
        &self.adapter
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Set the liveness flag, returning the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    fn timed_out(&self, what: &str) -> TileError {
        TileError::communication(
            &self.id,
            format!("{what} timed out after {} ms", self.io_timeout.as_millis()),
        )
    }

    pub async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError> {
        let call = async {
            let _io = self.io_lock.lock().await;
            self.adapter.get_attribute(name).await
        };
        timeout(self.io_timeout, call)
            .await
            .map_err(|_| self.timed_out(&format!("read of {name}")))?
    }

    pub async fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<(), TileError> {
        let call = async {
            let _io = self.io_lock.lock().await;
            self.adapter.set_attribute(name, value).await
        };
        timeout(self.io_timeout, call)
            .await
            .map_err(|_| self.timed_out(&format!("write of {name}")))?
    }

    /// Send a command, bounded by `deadline` (the command's own timeout for
    /// synchronous commands, the network timeout otherwise).
    ///
    /// # Errors
    ///
    /// [`TileError::CommandTimeout`] when the deadline elapses, or whatever
    /// the adapter reports.
    pub async fn execute_command(
        &self,
        name: &str,
        params: &serde_json::Value,
        deadline: Duration,
    ) -> Result<CommandResponse, TileError> {
        let call = async {
            let _io = self.io_lock.lock().await;
            self.adapter.execute_command(name, params).await
        };
        timeout(deadline, call)
            .await
            .map_err(|_| TileError::CommandTimeout {
                device: self.id.clone(),
                command: name.to_string(),
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Ask whether `command` is still running.
    pub async fn query_completion(&self, command: &str) -> Result<CompletionState, TileError> {
        let call = async {
            let _io = self.io_lock.lock().await;
            query_completion(&self.adapter, &self.id, command).await
        };
        timeout(self.io_timeout, call)
            .await
            .map_err(|_| self.timed_out(&format!("completion query for {command}")))?
    }
}

/// Every endpoint of the station, keyed by id.
#[derive(Default)]
pub struct DeviceRegistry {
    endpoints: BTreeMap<DeviceId, Arc<DeviceEndpoint>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of simulated devices reachable at `sim://<id>`.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] on duplicate ids.
    pub fn simulated<I>(devices: I, io_timeout: Duration) -> Result<Self, TileError>
    where
        I: IntoIterator<Item = Arc<SimDevice>>,
    {
        let mut registry = Self::new();
        for device in devices {
            let id = device.id().clone();
            let address = format!("sim://{id}");
            registry.register(DeviceEndpoint::new(
                id,
                address,
                DeviceAdapter::Simulated(device),
                io_timeout,
            ))?;
        }
        Ok(registry)
    }

    /// Add an endpoint.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the id is already registered.
    pub fn register(&mut self, endpoint: DeviceEndpoint) -> Result<(), TileError> {
        let id = endpoint.id().clone();
        if self.endpoints.contains_key(&id) {
            return Err(TileError::Configuration(format!("duplicate device id {id}")));
        }
        self.endpoints.insert(id, Arc::new(endpoint));
        Ok(())
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Arc<DeviceEndpoint>> {
        self.endpoints.get(id)
    }

    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] when `id` is not registered.
    pub fn require(&self, id: &DeviceId) -> Result<&Arc<DeviceEndpoint>, TileError> {
        self.endpoints
            .get(id)
            .ok_or_else(|| TileError::UnknownDevice(id.clone()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.endpoints.keys()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<DeviceEndpoint>> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCommand;

    fn registry(device: Arc<SimDevice>) -> DeviceRegistry {
        DeviceRegistry::simulated([device], Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let a = Arc::new(SimDevice::new("tile1"));
        let b = Arc::new(SimDevice::new("tile1"));
        let err = DeviceRegistry::simulated([a, b], DEFAULT_IO_TIMEOUT).err().unwrap();
        assert!(matches!(err, TileError::Configuration(_)));
    }

    #[test]
    fn unknown_device_is_reported() {
        let reg = registry(Arc::new(SimDevice::new("tile1")));
        let err = reg.require(&"tile9".into()).err().unwrap();
        assert_eq!(err, TileError::UnknownDevice("tile9".into()));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_read_times_out_as_communication_fault() {
        let device = Arc::new(SimDevice::new("tile1").with_attribute("board_temperature", 40.0));
        device.set_hang(true);
        let reg = registry(device);
        let endpoint = reg.require(&"tile1".into()).unwrap();
        let err = endpoint.get_attribute("board_temperature").await.unwrap_err();
        assert!(err.is_communication());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_hits_its_deadline() {
        let device = Arc::new(SimDevice::new("tile1").with_command("PowerOn", SimCommand::instant()));
        device.set_hang(true);
        let reg = registry(device);
        let endpoint = reg.require(&"tile1".into()).unwrap();
        let err = endpoint
            .execute_command("PowerOn", &serde_json::Value::Null, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::CommandTimeout { timeout_ms: 2000, .. }));
    }

    #[test]
    fn liveness_flag_swaps() {
        let reg = registry(Arc::new(SimDevice::new("tile1")));
        let endpoint = reg.require(&"tile1".into()).unwrap();
        assert!(endpoint.is_online());
        assert!(endpoint.set_online(false));
        assert!(!endpoint.is_online());
    }
}
