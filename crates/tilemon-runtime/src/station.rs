//! [`Station`] – the assembled supervisory core.
//!
//! [`Station::start`] wires every component from a [`DeviceRegistry`] and a
//! [`StationConfig`], spawns one poller task per device and hands back the
//! facade the supervisory layer talks to: per-device status snapshots,
//! command submission, power and synchronisation orchestration, health
//! roll-ups. [`Station::shutdown`] cancels the pollers and joins them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tilemon_hal::DeviceRegistry;
use tilemon_kernel::health::COMMUNICATION;
use tilemon_kernel::programming::IS_PROGRAMMED;
use tilemon_kernel::{AttributeSource, CommandCatalog, HealthAggregator, HealthRuleTable};
use tilemon_middleware::EventBus;
use tilemon_types::{
    CacheEntry, CommandStatus, DeviceId, HealthRule, HealthVerdict, PowerState, ProgrammingState,
    ProgrammingStatus, TaskHandle, TileError, Violation,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheStore, DeviceCache};
use crate::executor::{CommandExecutor, ExecutorConfig};
use crate::poller::{DevicePoller, PolledAttribute, PollerConfig, PollerHandle};
use crate::power::{PowerConfig, PowerNode, PowerOrchestrator, PowerTree};
use crate::programming::ProgrammingMonitor;
use crate::sync::{SyncConfig, SynchronizationCoordinator};

/// Attributes polled on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePolling {
    pub device: DeviceId,
    pub attributes: Vec<PolledAttribute>,
}

/// Everything the station needs besides the device endpoints.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub poller: PollerConfig,
    pub executor: ExecutorConfig,
    pub sync: SyncConfig,
    pub power: PowerConfig,
    pub polling: Vec<DevicePolling>,
    pub power_nodes: Vec<PowerNode>,
    pub health_rules: Vec<HealthRule>,
    pub catalog: CommandCatalog,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            executor: ExecutorConfig::default(),
            sync: SyncConfig::default(),
            power: PowerConfig::default(),
            polling: Vec::new(),
            power_nodes: Vec::new(),
            health_rules: Vec::new(),
            catalog: CommandCatalog::standard(),
        }
    }
}

/// Class of the worst unresolved fault of a device, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    LastCommand,
    HealthRule,
    Programming,
    StuckTransition,
    Communication,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultSummary {
    pub kind: FaultKind,
    pub cause: String,
}

/// Upward view of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: DeviceId,
    pub online: bool,
    /// `None` for devices without a programming lifecycle.
    pub programming_state: Option<ProgrammingStatus>,
    pub power_state: PowerState,
    pub health_state: HealthVerdict,
    pub attributes: BTreeMap<String, CacheEntry>,
    pub worst_fault: Option<FaultSummary>,
}

pub struct Station {
    registry: Arc<DeviceRegistry>,
    cache: Arc<CacheStore>,
    pollers: PollerHandle,
    executor: CommandExecutor,
    monitor: Arc<ProgrammingMonitor>,
    power: PowerOrchestrator,
    sync: SynchronizationCoordinator,
    health: HealthAggregator,
    bus: EventBus,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Station {
    /// Validate `config`, assemble the components and start polling.
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] for any invalid part of the
    /// configuration; nothing is started in that case.
    pub fn start(registry: DeviceRegistry, config: StationConfig) -> Result<Self, TileError> {
        config.poller.validate()?;
        config.executor.validate()?;
        config.sync.validate()?;

        let mut polling: BTreeMap<DeviceId, Vec<PolledAttribute>> = BTreeMap::new();
        for entry in config.polling {
            if registry.get(&entry.device).is_none() {
                return Err(TileError::Configuration(format!(
                    "polling configured for unregistered device {}",
                    entry.device
                )));
            }
            let mut names = HashSet::new();
            for attribute in &entry.attributes {
                if attribute.period_ms == 0 {
                    return Err(TileError::Configuration(format!(
                        "{}: attribute {} has a zero polling period",
                        entry.device, attribute.name
                    )));
                }
                if !names.insert(attribute.name.as_str()) {
                    return Err(TileError::Configuration(format!(
                        "{}: attribute {} polled twice",
                        entry.device, attribute.name
                    )));
                }
            }
            if polling.insert(entry.device.clone(), entry.attributes).is_some() {
                return Err(TileError::Configuration(format!(
                    "polling for {} configured twice",
                    entry.device
                )));
            }
        }

        let tree = Arc::new(PowerTree::new(config.power_nodes, &registry)?);
        let health = HealthAggregator::new(HealthRuleTable::new(config.health_rules)?);
        let bus = EventBus::default();

        let mut store = CacheStore::new();
        let mut partitions = Vec::new();
        for endpoint in registry.endpoints() {
            let attributes = polling.remove(endpoint.id()).unwrap_or_default();
            let cache = Arc::new(DeviceCache::new(
                Arc::clone(endpoint),
                config.poller.grace(),
                attributes.iter().map(|a| (a.name.as_str(), a.period())),
            ));
            store.insert(Arc::clone(&cache));
            partitions.push((Arc::clone(endpoint), cache, attributes));
        }
        let cache = Arc::new(store);

        let boards: Vec<DeviceId> = partitions
            .iter()
            .filter(|(_, _, attributes)| attributes.iter().any(|a| a.name == IS_PROGRAMMED))
            .map(|(endpoint, _, _)| endpoint.id().clone())
            .collect();
        let monitor = Arc::new(ProgrammingMonitor::new(
            boards,
            Arc::clone(&cache),
            Arc::clone(&tree),
            bus.clone(),
        ));

        let pollers: Vec<Arc<DevicePoller>> = partitions
            .into_iter()
            .map(|(endpoint, cache, attributes)| {
                Arc::new(
                    DevicePoller::new(endpoint, cache, attributes, config.poller.clone(), bus.clone())
                        .with_observer(monitor.clone()),
                )
            })
            .collect();
        let handle = PollerHandle::new(&pollers);

        let registry = Arc::new(registry);
        let executor = CommandExecutor::with_tracker(
            Arc::clone(&registry),
            config.catalog,
            config.executor,
            handle.clone(),
            bus.clone(),
            monitor.clone(),
        );
        let power = PowerOrchestrator::new(
            Arc::clone(&tree),
            executor.clone(),
            Arc::clone(&cache),
            handle.clone(),
            config.power,
        )
        .with_monitor(Arc::clone(&monitor));
        let sync = SynchronizationCoordinator::new(
            executor.clone(),
            Arc::clone(&monitor),
            handle.clone(),
            config.sync,
        );

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(pollers.len());
        for poller in &pollers {
            tasks.push(poller.spawn(cancel.child_token())?);
        }
        info!(
            devices = registry.len(),
            boards = monitor.boards().count(),
            rules = health.table().len(),
            "station started"
        );

        Ok(Self {
            registry,
            cache,
            pollers: handle,
            executor,
            monitor,
            power,
            sync,
            health,
            bus,
            cancel,
            tasks,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn pollers(&self) -> &PollerHandle {
        &self.pollers
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn programming(&self) -> &ProgrammingMonitor {
        &self.monitor
    }

    pub fn power(&self) -> &PowerOrchestrator {
        &self.power
    }

    pub fn sync(&self) -> &SynchronizationCoordinator {
        &self.sync
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Non-blocking read of one cached attribute.
    pub fn read(&self, device: &DeviceId, attribute: &str) -> Option<CacheEntry> {
        self.cache.read(device, attribute)
    }

    /// Submit a command through the executor.
    ///
    /// # Errors
    ///
    /// See [`CommandExecutor::submit`].
    pub async fn submit(
        &self,
        device: &DeviceId,
        command: &str,
        params: serde_json::Value,
    ) -> Result<TaskHandle, TileError> {
        self.executor.submit(device, command, params).await
    }

    /// Submit and wait for a terminal status.
    ///
    /// # Errors
    ///
    /// Any refusal of [`CommandExecutor::submit`].
    pub async fn run(
        &self,
        device: &DeviceId,
        command: &str,
        params: serde_json::Value,
    ) -> Result<CommandStatus, TileError> {
        let handle = self.executor.submit(device, command, params).await?;
        self.executor.wait(&handle).await
    }

    /// `{attribute: verdict}` for one device.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] for an unregistered device.
    pub fn evaluate(&self, device: &DeviceId) -> Result<BTreeMap<String, HealthVerdict>, TileError> {
        self.health.evaluate(self.cache.as_ref(), device)
    }

    /// Roll up `devices`, or the whole station when empty.
    pub fn aggregate(&self, devices: &[DeviceId]) -> (HealthVerdict, Vec<Violation>) {
        if devices.is_empty() {
            let all: Vec<DeviceId> = self.registry.ids().cloned().collect();
            self.health.aggregate(self.cache.as_ref(), &all)
        } else {
            self.health.aggregate(self.cache.as_ref(), devices)
        }
    }

    /// Upward status of one device.
    ///
    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] for an unregistered device.
    pub fn snapshot(&self, device: &DeviceId) -> Result<DeviceStatus, TileError> {
        let snapshot = self
            .cache
            .snapshot(device)
            .ok_or_else(|| TileError::UnknownDevice(device.clone()))?;
        let health = self.health.assess(&snapshot);
        let programming = self.monitor.status(device);

        let worst_fault = if let Some(details) = &snapshot.comm_fault {
            Some(FaultSummary {
                kind: FaultKind::Communication,
                cause: details.clone(),
            })
        } else if let Some(stuck) = self.monitor.stuck_fault(device) {
            Some(FaultSummary {
                kind: FaultKind::StuckTransition,
                cause: stuck.to_string(),
            })
        } else if let Some(status) = programming
            .as_ref()
            .filter(|s| s.state == ProgrammingState::Fault)
        {
            Some(FaultSummary {
                kind: FaultKind::Programming,
                cause: status
                    .fault_cause
                    .clone()
                    .unwrap_or_else(|| "programming fault".to_string()),
            })
        } else if let Some(violation) = health
            .violations
            .iter()
            .find(|v| v.verdict == HealthVerdict::Failed && v.attribute != COMMUNICATION)
        {
            Some(FaultSummary {
                kind: FaultKind::HealthRule,
                cause: violation.to_string(),
            })
        } else {
            self.executor
                .last_failure(device)
                .map(|error| FaultSummary {
                    kind: FaultKind::LastCommand,
                    cause: error.to_string(),
                })
        };

        Ok(DeviceStatus {
            device: device.clone(),
            online: snapshot.online,
            programming_state: programming,
            power_state: self.power.power_state(device),
            health_state: health.verdict(),
            attributes: snapshot.entries,
            worst_fault,
        })
    }

    /// Cancel every poller and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "poller task ended abnormally");
            }
        }
        info!("station stopped");
    }
}
