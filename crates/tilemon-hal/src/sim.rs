//! In-process simulated devices for tests and hardware-free runs.
//!
//! [`SimDevice`] implements [`HardwareCapability`] on top of an in-memory
//! attribute table. Commands are scripted with [`SimCommand`]: they may
//! finish at once, run for a while (answering `STARTED` and then reporting
//! progress through the completion query), fail, or change attributes when
//! they complete. Every hardware call is counted so tests can assert that a
//! rejected request never reached the network.
//!
//! Time is taken from `tokio::time`, so paused-clock tests drive long
//! commands deterministically.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tilemon_hal::sim::{SimCommand, SimDevice};
//!
//! let tile = SimDevice::new("tile1")
//!     .with_attribute("is_programmed", false)
//!     .with_command(
//!         "DownloadFirmware",
//!         SimCommand::slow(Duration::from_secs(2)).sets("is_programmed", true),
//!     );
//! assert_eq!(tile.network_calls(), 0);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tilemon_types::{
    AttributeReading, AttributeValue, COMPLETION_QUERY, CommandResponse, CompletionState,
    DeviceId, TileError,
};
use tokio::time::Instant;

use crate::board::RegisterAccess;
use crate::capability::HardwareCapability;

type Effect = Arc<dyn Fn(&serde_json::Value, &mut HashMap<String, AttributeValue>) + Send + Sync>;

/// Shared record of executed commands across several simulated devices,
/// as `"device:command"` strings in execution order.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Scripted behaviour of one simulated command.
#[derive(Clone, Default)]
pub struct SimCommand {
    duration: Duration,
    failure: Option<String>,
    sets: Vec<(String, AttributeValue)>,
    effect: Option<Effect>,
}

impl fmt::Debug for SimCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCommand")
            .field("duration", &self.duration)
            .field("failure", &self.failure)
            .field("sets", &self.sets)
            .finish_non_exhaustive()
    }
}

impl SimCommand {
    /// Completes within the call.
    pub fn instant() -> Self {
        Self::default()
    }

    /// Answers `STARTED` and completes after `duration`.
    pub fn slow(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    /// Set `attribute` to `value` when the command completes.
    pub fn sets(mut self, attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.sets.push((attribute.into(), value.into()));
        self
    }

    /// Run `effect` against the attribute table when the command completes.
    pub fn effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&serde_json::Value, &mut HashMap<String, AttributeValue>) + Send + Sync + 'static,
    {
        self.effect = Some(Arc::new(effect));
        self
    }

    /// Fail with `why` instead of completing. No attribute changes apply.
    pub fn failing(mut self, why: impl Into<String>) -> Self {
        self.failure = Some(why.into());
        self
    }

    fn finish(
        &self,
        params: &serde_json::Value,
        attributes: &mut HashMap<String, AttributeValue>,
    ) -> CompletionState {
        if let Some(why) = &self.failure {
            return CompletionState::Failed(why.clone());
        }
        for (name, value) in &self.sets {
            attributes.insert(name.clone(), value.clone());
        }
        if let Some(effect) = &self.effect {
            effect(params, attributes);
        }
        CompletionState::Completed
    }
}

struct Running {
    command: String,
    params: serde_json::Value,
    done_at: Instant,
}

#[derive(Default)]
struct SimState {
    attributes: HashMap<String, AttributeValue>,
    unsupported: HashSet<String>,
    commands: HashMap<String, SimCommand>,
    running: Option<Running>,
    finished: HashMap<String, CompletionState>,
    executed: Vec<(String, serde_json::Value)>,
    latency: Duration,
    reachable: bool,
    hang: bool,
    /// Calls still to be refused before the device answers again.
    dropped: usize,
}

impl SimState {
    /// Complete the running command if its time has come.
    fn settle(&mut self, now: Instant) {
        let due = self.running.as_ref().is_some_and(|r| now >= r.done_at);
        if !due {
            return;
        }
        if let Some(run) = self.running.take() {
            let outcome = match self.commands.get(&run.command) {
                Some(spec) => spec.finish(&run.params, &mut self.attributes),
                None => CompletionState::Failed(format!("{} vanished", run.command)),
            };
            self.finished.insert(run.command, outcome);
        }
    }
}

/// A simulated device endpoint.
pub struct SimDevice {
    id: DeviceId,
    state: Mutex<SimState>,
    calls: AtomicUsize,
    journal: Option<Journal>,
}

impl SimDevice {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(SimState {
                reachable: true,
                ..SimState::default()
            }),
            calls: AtomicUsize::new(0),
            journal: None,
        }
    }

    /// Build from declarative configuration.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when an attribute value is not a
    /// scalar, string or list.
    pub fn from_config(id: impl Into<DeviceId>, config: &SimConfig) -> Result<Self, TileError> {
        let id = id.into();
        let convert = |name: &str, value: &serde_json::Value| {
            AttributeValue::from_json(value).ok_or_else(|| {
                TileError::Configuration(format!("simulated {id}: bad value for {name}"))
            })
        };
        let mut device = SimDevice::new(id.clone())
            .with_latency(Duration::from_millis(config.latency_ms));
        for (name, value) in &config.attributes {
            device = device.with_attribute(name, convert(name, value)?);
        }
        for name in &config.unsupported {
            device = device.with_unsupported(name);
        }
        for (name, spec) in &config.commands {
            let mut command = SimCommand::slow(Duration::from_millis(spec.duration_ms));
            for (attribute, value) in &spec.sets {
                command = command.sets(attribute, convert(attribute, value)?);
            }
            if let Some(why) = &spec.fails {
                command = command.failing(why);
            }
            device = device.with_command(name, command);
        }
        Ok(device)
    }

    pub fn with_attribute(self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.state.lock().attributes.insert(name.into(), value.into());
        self
    }

    /// The hardware variant does not expose `name`.
    pub fn with_unsupported(self, name: impl Into<String>) -> Self {
        self.state.lock().unsupported.insert(name.into());
        self
    }

    pub fn with_command(self, name: impl Into<String>, command: SimCommand) -> Self {
        self.state.lock().commands.insert(name.into(), command);
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Number of hardware calls received so far.
    pub fn network_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Commands accepted for execution, in order, with their parameters.
    pub fn executed(&self) -> Vec<(String, serde_json::Value)> {
        self.state.lock().executed.clone()
    }

    /// When unreachable, every call fails with a communication error.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// When hung, every call blocks until the caller's timeout fires.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    /// Refuse the next `calls` calls with a communication error, then
    /// answer normally.
    pub fn drop_next(&self, calls: usize) {
        self.state.lock().dropped = calls;
    }

    /// Change a value behind the supervisor's back, as hardware does.
    pub fn set_attribute_value(&self, name: &str, value: impl Into<AttributeValue>) {
        self.state.lock().attributes.insert(name.to_string(), value.into());
    }

    /// Current simulated value of `name`, settling any due command first.
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.attributes.get(name).cloned()
    }

    /// Count the call, apply latency, and refuse it if unreachable.
    async fn enter(&self) -> Result<(), TileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (latency, hang, reachable) = {
            let mut state = self.state.lock();
            let dropped = state.dropped > 0;
            state.dropped = state.dropped.saturating_sub(1);
            (state.latency, state.hang, state.reachable && !dropped)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if reachable {
            Ok(())
        } else {
            Err(TileError::communication(&self.id, "connection refused"))
        }
    }

    fn record(&self, command: &str) {
        if let Some(journal) = &self.journal {
            journal.lock().push(format!("{}:{command}", self.id));
        }
    }
}

#[async_trait]
impl HardwareCapability for SimDevice {
    async fn get_attribute(&self, name: &str) -> Result<AttributeReading, TileError> {
        self.enter().await?;
        let mut state = self.state.lock();
        state.settle(Instant::now());
        match state.attributes.get(name) {
            Some(value) if !state.unsupported.contains(name) => {
                Ok(AttributeReading::fresh(value.clone()))
            }
            _ => Err(TileError::UnsupportedAttribute {
                device: self.id.clone(),
                attribute: name.to_string(),
            }),
        }
    }

    async fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<(), TileError> {
        self.enter().await?;
        let mut state = self.state.lock();
        if state.unsupported.contains(name) {
            return Err(TileError::UnsupportedAttribute {
                device: self.id.clone(),
                attribute: name.to_string(),
            });
        }
        state.attributes.insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn execute_command(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<CommandResponse, TileError> {
        self.enter().await?;
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.settle(now);

        if name == COMPLETION_QUERY {
            let command = params
                .get("command")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let report = match &state.running {
                Some(run) if run.command == command => CompletionState::Running,
                _ => state
                    .finished
                    .get(command)
                    .cloned()
                    .unwrap_or_else(|| CompletionState::Failed(format!("{command} never started"))),
            };
            return Ok(CommandResponse::ok(Some(report.to_result())));
        }

        if state.running.is_some() {
            return Ok(CommandResponse::busy());
        }
        let Some(spec) = state.commands.get(name).cloned() else {
            return Ok(CommandResponse::error(format!("unknown command {name}")));
        };
        state.executed.push((name.to_string(), params.clone()));
        self.record(name);

        if spec.duration.is_zero() {
            let outcome = spec.finish(params, &mut state.attributes);
            state.finished.insert(name.to_string(), outcome.clone());
            return Ok(match outcome {
                CompletionState::Failed(why) => CommandResponse::error(why),
                _ => CommandResponse::ok(None),
            });
        }
        state.finished.remove(name);
        state.running = Some(Running {
            command: name.to_string(),
            params: params.clone(),
            done_at: now + spec.duration,
        });
        Ok(CommandResponse::started())
    }
}

/// Declarative description of a simulated device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub unsupported: Vec<String>,
    #[serde(default)]
    pub commands: BTreeMap<String, SimCommandConfig>,
    #[serde(default)]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimCommandConfig {
    /// Zero completes within the call.
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub sets: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub fails: Option<String>,
}

/// Register file held in memory, for boards without a network transport.
#[derive(Debug, Default)]
pub struct MemoryRegisters {
    words: Mutex<HashMap<u32, u32>>,
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u32) -> u32 {
        self.words.lock().get(&address).copied().unwrap_or(0)
    }

    pub fn set(&self, address: u32, value: u32) {
        self.words.lock().insert(address, value);
    }
}

#[async_trait]
impl RegisterAccess for MemoryRegisters {
    async fn read_register(&self, address: u32) -> Result<u32, TileError> {
        Ok(self.get(address))
    }

    async fn write_register(&self, address: u32, value: u32) -> Result<(), TileError> {
        self.set(address, value);
        Ok(())
    }
}
