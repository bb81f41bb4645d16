//! Power dependency tree and the [`PowerOrchestrator`].
//!
//! # Tree
//!
//! Enclosure → subrack → bay → board. Each [`PowerNode`] names the device
//! and commands that switch it, and the cached attribute (optionally one
//! element of a list) that reports its observed [`PowerState`]. A node's
//! `supply_level` is the level it must be at before any child may be
//! switched on; it is never below `STANDBY`.
//!
//! # Orchestration
//!
//! * `set_power(node, ON | STANDBY)` walks the ancestors root first and
//!   raises each one below its supply level (with its standby command when
//!   it has one and `STANDBY` suffices, with its on command otherwise), waiting for the poller to observe
//!   it, then re-checks the whole chain before touching the target. A chain
//!   that is still below its supply level refuses the request with
//!   [`RejectReason::AncestorUnpowered`].
//! * `set_power(node, OFF)` refuses while any descendant is observed `ON`
//!   ([`RejectReason::DependentsPowered`]).
//! * `set_power_many` raises the shared ancestors once, then switches the
//!   targets grouped by control device: groups in parallel, members of a
//!   group one after the other with an inrush stagger. Failures are
//!   reported per device and nothing is rolled back.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tilemon_hal::DeviceRegistry;
use tilemon_types::{CommandStatus, DeviceId, PowerState, RejectReason, TileError};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheStore;
use crate::executor::CommandExecutor;
use crate::poller::PollerHandle;
use crate::programming::ProgrammingMonitor;

// ─────────────────────────────────────────────────────────────────────────────
// Tree
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Enclosure,
    Subrack,
    Bay,
    #[default]
    Board,
}

/// How a node is switched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerControl {
    /// Device the commands are sent to (usually the parent's manager).
    pub device: DeviceId,
    pub on: String,
    pub off: String,
    #[serde(default)]
    pub standby: Option<String>,
    /// Parameters sent with every power command, e.g. `{"tpm_slot": 3}`.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl PowerControl {
    fn command_for(&self, state: PowerState) -> Option<&str> {
        match state {
            PowerState::On => Some(&self.on),
            PowerState::Off => Some(&self.off),
            PowerState::Standby => self.standby.as_deref(),
            PowerState::Unknown => None,
        }
    }
}

/// Where a node's power state is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerObservation {
    pub device: DeviceId,
    pub attribute: String,
    /// Element of a list attribute, e.g. one slot of `tpm_power_states`.
    #[serde(default)]
    pub index: Option<usize>,
}

fn default_supply_level() -> PowerState {
    PowerState::Standby
}

fn default_transition_ms() -> u64 {
    15_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerNode {
    pub id: DeviceId,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub parent: Option<DeviceId>,
    pub control: PowerControl,
    pub observe: PowerObservation,
    /// Level this node must hold for its children to be switched on.
    #[serde(default = "default_supply_level")]
    pub supply_level: PowerState,
    /// How long an issued transition may take to be observed.
    #[serde(default = "default_transition_ms")]
    pub transition_timeout_ms: u64,
}

impl PowerNode {
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    /// Level an ancestor is raised to so it reaches its supply level:
    /// `STANDBY` when the node has a standby command and that is enough,
    /// `ON` otherwise.
    pub fn raise_level(&self) -> PowerState {
        if self.supply_level == PowerState::Standby && self.control.standby.is_some() {
            PowerState::Standby
        } else {
            PowerState::On
        }
    }
}

/// Validated power dependency tree.
#[derive(Debug, Clone, Default)]
pub struct PowerTree {
    nodes: BTreeMap<DeviceId, PowerNode>,
}

impl PowerTree {
    /// Validate `nodes` against the devices of `registry`.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] on duplicate ids, an unknown parent,
    /// control or observation device, a cycle, or a supply level below
    /// `STANDBY`.
    pub fn new(nodes: Vec<PowerNode>, registry: &DeviceRegistry) -> Result<Self, TileError> {
        let fail = |why: String| Err(TileError::Configuration(format!("power tree: {why}")));
        let mut by_id = BTreeMap::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return fail(format!("node {} declared twice", node.id));
            }
            by_id.insert(node.id.clone(), node);
        }
        for node in by_id.values() {
            if let Some(parent) = &node.parent {
                if !by_id.contains_key(parent) {
                    return fail(format!("node {} has unknown parent {parent}", node.id));
                }
            }
            for device in [&node.control.device, &node.observe.device] {
                if registry.get(device).is_none() {
                    return fail(format!("node {} refers to unregistered device {device}", node.id));
                }
            }
            if node.supply_level < PowerState::Standby {
                return fail(format!("node {} has supply level {} below STANDBY", node.id, node.supply_level));
            }
            if node.control.on.is_empty() || node.control.off.is_empty() {
                return fail(format!("node {} lacks on/off commands", node.id));
            }
            if node.transition_timeout_ms == 0 {
                return fail(format!("node {} has a zero transition timeout", node.id));
            }
        }
        let tree = Self { nodes: by_id };
        for id in tree.nodes.keys() {
            let mut seen = HashSet::new();
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                if !seen.insert(current) {
                    return fail(format!("cycle through {id}"));
                }
                cursor = tree.nodes.get(current).and_then(|n| n.parent.as_ref());
            }
        }
        Ok(tree)
    }

    pub fn node(&self, id: &DeviceId) -> Option<&PowerNode> {
        self.nodes.get(id)
    }

    /// # Errors
    ///
    /// [`TileError::UnknownDevice`] when `id` is not a node.
    pub fn require(&self, id: &DeviceId) -> Result<&PowerNode, TileError> {
        self.nodes
            .get(id)
            .ok_or_else(|| TileError::UnknownDevice(id.clone()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PowerNode> {
        self.nodes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestors of `id`, root first, excluding `id` itself.
    pub fn ancestors(&self, id: &DeviceId) -> Vec<&PowerNode> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(id).and_then(|n| n.parent.as_ref());
        while let Some(parent) = cursor {
            let Some(node) = self.nodes.get(parent) else {
                break;
            };
            chain.push(node);
            cursor = node.parent.as_ref();
        }
        chain.reverse();
        chain
    }

    /// Every node below `id`.
    pub fn descendants(&self, id: &DeviceId) -> Vec<&PowerNode> {
        self.nodes
            .values()
            .filter(|n| self.ancestors(&n.id).iter().any(|a| &a.id == id))
            .collect()
    }

    fn depth(&self, id: &DeviceId) -> usize {
        self.ancestors(id).len()
    }

    /// Power state of `id` as last observed by the poller. Anything not
    /// fresh is `UNKNOWN`.
    pub fn observed(&self, id: &DeviceId, cache: &CacheStore) -> PowerState {
        let Some(node) = self.nodes.get(id) else {
            return PowerState::Unknown;
        };
        let Some(entry) = cache.read(&node.observe.device, &node.observe.attribute) else {
            return PowerState::Unknown;
        };
        let value = match (entry.fresh_value(), node.observe.index) {
            (Some(value), Some(index)) => value.get(index),
            (value, None) => value,
            (None, Some(_)) => None,
        };
        value.map_or(PowerState::Unknown, PowerState::from_value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Pause between successive power-ups behind one control device.
    pub stagger_ms: u64,
    /// Interval between checks of the observed power state.
    pub settle_poll_ms: u64,
    /// How long to wait for an unknown power state to be read.
    pub observe_timeout_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 500,
            settle_poll_ms: 250,
            observe_timeout_ms: 2_000,
        }
    }
}

impl PowerConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms.max(1))
    }

    pub fn observe_timeout(&self) -> Duration {
        Duration::from_millis(self.observe_timeout_ms)
    }
}

/// Outcome of [`PowerOrchestrator::set_power_many`].
#[derive(Debug, Default)]
pub struct BatchPowerResult {
    pub succeeded: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, TileError)>,
}

impl BatchPowerResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_devices(&self) -> Vec<&DeviceId> {
        self.failed.iter().map(|(id, _)| id).collect()
    }
}

pub struct PowerOrchestrator {
    tree: Arc<PowerTree>,
    executor: CommandExecutor,
    cache: Arc<CacheStore>,
    pollers: PollerHandle,
    monitor: Option<Arc<ProgrammingMonitor>>,
    config: PowerConfig,
}

impl PowerOrchestrator {
    pub fn new(
        tree: Arc<PowerTree>,
        executor: CommandExecutor,
        cache: Arc<CacheStore>,
        pollers: PollerHandle,
        config: PowerConfig,
    ) -> Self {
        Self {
            tree,
            executor,
            cache,
            pollers,
            monitor: None,
            config,
        }
    }

    /// Announce power-offs to the programming monitor so the resulting
    /// backward moves are accepted.
    pub fn with_monitor(mut self, monitor: Arc<ProgrammingMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn tree(&self) -> &PowerTree {
        &self.tree
    }

    /// Observed power state of `device`.
    pub fn power_state(&self, device: &DeviceId) -> PowerState {
        self.tree.observed(device, &self.cache)
    }

    /// Bring `device` to `target`, powering its ancestors first.
    ///
    /// Returns the observed state once it matches `target`.
    ///
    /// # Errors
    ///
    /// * [`TileError::UnknownDevice`] when `device` is not in the tree.
    /// * [`RejectReason::AncestorUnpowered`] when an ancestor is still below
    ///   its supply level after the ancestor transitions.
    /// * [`RejectReason::DependentsPowered`] when switching off a node with
    ///   descendants still on.
    /// * [`TileError::CommandTimeout`] when the new state is not observed
    ///   within the node's transition timeout.
    /// * Any error of the underlying commands.
    #[instrument(skip_all, fields(device = %device, target = %target))]
    pub async fn set_power(&self, device: &DeviceId, target: PowerState) -> Result<PowerState, TileError> {
        let node = self.tree.require(device)?;
        match target {
            PowerState::Unknown => Err(TileError::Configuration(format!(
                "cannot switch {device} to {target}"
            ))),
            PowerState::Off => self.power_off(node).await,
            PowerState::Standby | PowerState::On => self.power_up(node, target).await,
        }
    }

    async fn power_up(&self, node: &PowerNode, target: PowerState) -> Result<PowerState, TileError> {
        let ancestors = self.tree.ancestors(&node.id);
        for ancestor in &ancestors {
            if self.current_level(ancestor).await < ancestor.supply_level {
                info!(ancestor = %ancestor.id, level = %ancestor.raise_level(), "raising ancestor");
                self.transition(ancestor, ancestor.raise_level()).await?;
            }
        }
        for ancestor in &ancestors {
            let level = self.current_level(ancestor).await;
            if level < ancestor.supply_level {
                warn!(ancestor = %ancestor.id, %level, "ancestor chain not powered, refusing");
                let command = node.control.command_for(target).unwrap_or(&node.control.on);
                return Err(TileError::rejected(
                    &node.control.device,
                    command,
                    RejectReason::AncestorUnpowered(ancestor.id.clone()),
                ));
            }
        }
        self.transition(node, target).await
    }

    async fn power_off(&self, node: &PowerNode) -> Result<PowerState, TileError> {
        let descendants = self.tree.descendants(&node.id);
        let mut powered = Vec::new();
        for descendant in &descendants {
            if self.current_level(descendant).await == PowerState::On {
                powered.push(descendant.id.clone());
            }
        }
        if !powered.is_empty() {
            return Err(TileError::rejected(
                &node.control.device,
                &node.control.off,
                RejectReason::DependentsPowered(powered),
            ));
        }
        if let Some(monitor) = &self.monitor {
            monitor.expect_reset(&node.id);
            for descendant in &descendants {
                monitor.expect_reset(&descendant.id);
            }
        }
        self.transition(node, PowerState::Off).await
    }

    /// Observed level, giving the poller a chance to read it when unknown.
    async fn current_level(&self, node: &PowerNode) -> PowerState {
        let deadline = Instant::now() + self.config.observe_timeout();
        loop {
            let level = self.tree.observed(&node.id, &self.cache);
            if level != PowerState::Unknown || Instant::now() >= deadline {
                return level;
            }
            self.request_observation(node);
            sleep(self.config.settle_poll()).await;
        }
    }

    fn request_observation(&self, node: &PowerNode) {
        self.pollers
            .force_poll(&node.observe.device, std::slice::from_ref(&node.observe.attribute));
    }

    /// Issue the command for `state` and wait until it is observed.
    async fn transition(&self, node: &PowerNode, state: PowerState) -> Result<PowerState, TileError> {
        if self.tree.observed(&node.id, &self.cache) == state {
            return Ok(state);
        }
        let command = node.control.command_for(state).ok_or_else(|| {
            TileError::Configuration(format!("node {} has no command for {state}", node.id))
        })?;
        let device = &node.control.device;
        let handle = self
            .executor
            .submit(device, command, node.control.params.clone())
            .await?;
        let status = self.executor.wait(&handle).await?;
        if status != CommandStatus::Completed {
            let error = self
                .executor
                .task(&handle)
                .and_then(|task| task.error)
                .unwrap_or_else(|| format!("{command} ended {status:?}"));
            return Err(TileError::rejected(device, command, RejectReason::Hardware(error)));
        }

        let deadline = Instant::now() + node.transition_timeout();
        loop {
            let level = self.tree.observed(&node.id, &self.cache);
            if level == state {
                info!(node = %node.id, %level, "power transition observed");
                return Ok(level);
            }
            if Instant::now() >= deadline {
                return Err(TileError::CommandTimeout {
                    device: node.id.clone(),
                    command: command.to_string(),
                    timeout_ms: node.transition_timeout_ms,
                });
            }
            self.request_observation(node);
            sleep(self.config.settle_poll()).await;
        }
    }

    /// Switch many nodes to `target`. Never rolls back.
    #[instrument(skip_all, fields(count = devices.len(), target = %target))]
    pub async fn set_power_many(&self, devices: &[DeviceId], target: PowerState) -> BatchPowerResult {
        let mut result = BatchPowerResult::default();
        let mut nodes = Vec::new();
        for device in devices {
            match self.tree.node(device) {
                Some(node) => nodes.push(node),
                None => result
                    .failed
                    .push((device.clone(), TileError::UnknownDevice(device.clone()))),
            }
        }

        if target == PowerState::Off {
            // Children before parents, one at a time.
            nodes.sort_by_key(|n| std::cmp::Reverse(self.tree.depth(&n.id)));
            for node in nodes {
                record(&mut result, node.id.clone(), self.set_power(&node.id, target).await);
            }
            return result;
        }

        // Shared ancestors once, root first.
        let mut ancestors: Vec<&PowerNode> = Vec::new();
        let mut seen = BTreeSet::new();
        for node in &nodes {
            for ancestor in self.tree.ancestors(&node.id) {
                if seen.insert(ancestor.id.clone()) {
                    ancestors.push(ancestor);
                }
            }
        }
        ancestors.sort_by_key(|n| self.tree.depth(&n.id));
        let mut failed_ancestors = BTreeSet::new();
        for ancestor in ancestors {
            if ancestor.parent.as_ref().is_some_and(|p| failed_ancestors.contains(p)) {
                failed_ancestors.insert(ancestor.id.clone());
                continue;
            }
            if self.current_level(ancestor).await >= ancestor.supply_level {
                continue;
            }
            if let Err(e) = self.transition(ancestor, ancestor.raise_level()).await {
                warn!(ancestor = %ancestor.id, error = %e, "ancestor power-up failed");
                failed_ancestors.insert(ancestor.id.clone());
            }
        }

        let mut groups: BTreeMap<&DeviceId, Vec<&PowerNode>> = BTreeMap::new();
        for node in nodes {
            let blocked = self
                .tree
                .ancestors(&node.id)
                .into_iter()
                .find(|a| failed_ancestors.contains(&a.id));
            match blocked {
                Some(ancestor) => result.failed.push((
                    node.id.clone(),
                    TileError::rejected(
                        &node.control.device,
                        &node.control.on,
                        RejectReason::AncestorUnpowered(ancestor.id.clone()),
                    ),
                )),
                None => groups.entry(&node.control.device).or_default().push(node),
            }
        }

        let stagger = self.config.stagger();
        let runs = groups.into_values().map(|members| async move {
            let mut outcomes = Vec::with_capacity(members.len());
            for (i, node) in members.into_iter().enumerate() {
                if i > 0 && !stagger.is_zero() {
                    sleep(stagger).await;
                }
                debug!(node = %node.id, "switching");
                outcomes.push((node.id.clone(), self.set_power(&node.id, target).await));
            }
            outcomes
        });
        for (id, outcome) in join_all(runs).await.into_iter().flatten() {
            record(&mut result, id, outcome);
        }
        result
    }
}

fn record(result: &mut BatchPowerResult, id: DeviceId, outcome: Result<PowerState, TileError>) {
    match outcome {
        Ok(_) => result.succeeded.push(id),
        Err(e) => {
            warn!(device = %id, error = %e, "power transition failed");
            result.failed.push((id, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemon_hal::SimDevice;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::simulated(
            [Arc::new(SimDevice::new("subrack1")), Arc::new(SimDevice::new("tile1"))],
            Duration::from_secs(1),
        )
        .unwrap()
    }

    fn node(id: &str, parent: Option<&str>) -> PowerNode {
        PowerNode {
            id: id.into(),
            kind: NodeKind::Board,
            parent: parent.map(DeviceId::from),
            control: PowerControl {
                device: "subrack1".into(),
                on: "PowerOn".into(),
                off: "PowerOff".into(),
                standby: None,
                params: serde_json::Value::Null,
            },
            observe: PowerObservation {
                device: "subrack1".into(),
                attribute: "power_state".into(),
                index: None,
            },
            supply_level: PowerState::Standby,
            transition_timeout_ms: 1_000,
        }
    }

    fn config_error(result: Result<PowerTree, TileError>) -> String {
        match result {
            Err(TileError::Configuration(why)) => why,
            Err(other) => panic!("expected configuration error, got {other}"),
            Ok(_) => panic!("expected configuration error"),
        }
    }

    #[test]
    fn ancestors_are_root_first() {
        let tree = PowerTree::new(
            vec![
                node("cabinet", None),
                node("subrack1", Some("cabinet")),
                node("tile1", Some("subrack1")),
            ],
            &registry(),
        )
        .unwrap();
        let chain: Vec<&str> = tree
            .ancestors(&"tile1".into())
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(chain, ["cabinet", "subrack1"]);
        let below: Vec<&str> = tree
            .descendants(&"cabinet".into())
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(below, ["subrack1", "tile1"]);
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let why = config_error(PowerTree::new(vec![node("tile1", Some("ghost"))], &registry()));
        assert!(why.contains("unknown parent"), "{why}");
    }

    #[test]
    fn cycles_are_rejected() {
        let why = config_error(PowerTree::new(
            vec![node("a", Some("b")), node("b", Some("a"))],
            &registry(),
        ));
        assert!(why.contains("cycle"), "{why}");
    }

    #[test]
    fn supply_level_below_standby_is_rejected() {
        let mut weak = node("subrack1", None);
        weak.supply_level = PowerState::Off;
        let why = config_error(PowerTree::new(vec![weak], &registry()));
        assert!(why.contains("below STANDBY"), "{why}");
    }

    #[test]
    fn unregistered_control_device_is_rejected() {
        let mut stray = node("tile1", None);
        stray.control.device = "subrack9".into();
        let why = config_error(PowerTree::new(vec![stray], &registry()));
        assert!(why.contains("subrack9"), "{why}");
    }

    #[test]
    fn ancestors_without_standby_are_raised_to_on() {
        let plain = node("subrack1", None);
        assert_eq!(plain.supply_level, PowerState::Standby);
        assert_eq!(plain.raise_level(), PowerState::On);

        let mut dozing = node("subrack1", None);
        dozing.control.standby = Some("Standby".into());
        assert_eq!(dozing.raise_level(), PowerState::Standby);

        dozing.supply_level = PowerState::On;
        assert_eq!(dozing.raise_level(), PowerState::On);
    }

    #[test]
    fn nodes_deserialize_with_defaults() {
        let node: PowerNode = toml::from_str(
            r#"
            id = "tile3"
            parent = "subrack1"
            [control]
            device = "subrack1"
            on = "PowerOnTpm"
            off = "PowerOffTpm"
            params = { tpm_slot = 3 }
            [observe]
            device = "subrack1"
            attribute = "tpm_power_states"
            index = 2
            "#,
        )
        .unwrap();
        assert_eq!(node.kind, NodeKind::Board);
        assert_eq!(node.supply_level, PowerState::Standby);
        assert_eq!(node.observe.index, Some(2));
        assert_eq!(node.control.params["tpm_slot"], 3);
    }
}
