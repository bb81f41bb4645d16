//! Station configuration – reads the station's `tilemon.toml`.
//!
//! The file is loaded once at startup and turned into a [`DeviceRegistry`]
//! plus a [`StationConfig`]. Any invalid part rejects the whole file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tilemon_hal::{AdapterConfig, DEFAULT_IO_TIMEOUT, DeviceAdapter, DeviceEndpoint, DeviceRegistry};
use tilemon_kernel::{CommandCatalog, CommandSpec};
use tilemon_runtime::{
    DevicePolling, ExecutorConfig, PolledAttribute, PollerConfig, PowerConfig, PowerNode,
    StationConfig, SyncConfig,
};
use tilemon_types::{DeviceId, HealthRule, TileError};
use tracing::warn;

/// File used when neither an argument nor `TILEMON_CONFIG` names one.
pub const DEFAULT_CONFIG_FILE: &str = "tilemon.toml";

/// `[poller]`: the polling policy plus the default per-call network timeout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    #[serde(flatten)]
    pub policy: PollerConfig,
    pub io_timeout_ms: u64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            policy: PollerConfig::default(),
            io_timeout_ms: u64::try_from(DEFAULT_IO_TIMEOUT.as_millis()).unwrap_or(3_000),
        }
    }
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub address: String,
    pub adapter: AdapterConfig,
    /// Overrides `[poller] io_timeout_ms` for this device.
    #[serde(default)]
    pub io_timeout_ms: Option<u64>,
    #[serde(default)]
    pub attributes: Vec<PolledAttribute>,
}

fn default_health_log_ms() -> u64 {
    10_000
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StationFile {
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub power: PowerConfig,
    /// Interval of the periodic station health log line.
    #[serde(default = "default_health_log_ms")]
    pub health_log_ms: u64,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub power_nodes: Vec<PowerNode>,
    #[serde(default)]
    pub health_rules: Vec<HealthRule>,
    /// Added to, or replacing entries of, the standard command catalog.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

impl StationFile {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the document does not parse.
    pub fn parse(raw: &str) -> Result<Self, TileError> {
        toml::from_str(raw).map_err(|e| TileError::Configuration(format!("parse error: {e}")))
    }

    pub fn health_log_interval(&self) -> Duration {
        Duration::from_millis(self.health_log_ms.max(1_000))
    }

    /// Apply `TILEMON_*` environment overrides.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `TILEMON_POLL_GRACE_MS` | `poller.grace_ms` |
    /// | `TILEMON_FAILURE_THRESHOLD` | `poller.failure_threshold` |
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TILEMON_POLL_GRACE_MS") {
            match v.parse::<u64>() {
                Ok(ms) => self.poller.policy.grace_ms = ms,
                Err(_) => warn!(value = %v, "ignoring invalid TILEMON_POLL_GRACE_MS"),
            }
        }
        if let Ok(v) = std::env::var("TILEMON_FAILURE_THRESHOLD") {
            match v.parse::<u32>() {
                Ok(n) => self.poller.policy.failure_threshold = n,
                Err(_) => warn!(value = %v, "ignoring invalid TILEMON_FAILURE_THRESHOLD"),
            }
        }
    }

    /// Build the device registry and the station configuration.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] on duplicate device ids, an adapter that
    /// cannot be built, a zero network timeout or a malformed command
    /// definition. The power tree, health rules and polling periods are
    /// checked by `Station::start`.
    pub fn build(self) -> Result<(DeviceRegistry, StationConfig), TileError> {
        let mut registry = DeviceRegistry::new();
        let mut polling = Vec::with_capacity(self.devices.len());
        for device in self.devices {
            let timeout_ms = device.io_timeout_ms.unwrap_or(self.poller.io_timeout_ms);
            if timeout_ms == 0 {
                return Err(TileError::Configuration(format!(
                    "{}: io_timeout_ms must be positive",
                    device.id
                )));
            }
            let timeout = Duration::from_millis(timeout_ms);
            let adapter = DeviceAdapter::from_config(&device.id, &device.address, &device.adapter, timeout)?;
            registry.register(DeviceEndpoint::new(device.id.clone(), device.address, adapter, timeout))?;
            if !device.attributes.is_empty() {
                polling.push(DevicePolling {
                    device: device.id,
                    attributes: device.attributes,
                });
            }
        }

        let mut catalog = CommandCatalog::standard();
        for spec in self.commands {
            catalog.insert(spec)?;
        }

        let config = StationConfig {
            poller: self.poller.policy,
            executor: self.executor,
            sync: self.sync,
            power: self.power,
            polling,
            power_nodes: self.power_nodes,
            health_rules: self.health_rules,
            catalog,
        };
        Ok((registry, config))
    }
}

/// Path of the configuration file.
pub fn config_path(arg: Option<String>) -> PathBuf {
    resolve_path(arg, std::env::var("TILEMON_CONFIG").ok())
}

/// The argument wins over the environment, which wins over the default.
pub(crate) fn resolve_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Read, parse and override the file at `path`.
///
/// # Errors
///
/// [`TileError::Configuration`] when the file cannot be read or parsed.
pub fn load(path: &Path) -> Result<StationFile, TileError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        TileError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let mut file = StationFile::parse(&raw)?;
    file.apply_env_overrides();
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemon_types::{PowerState, Severity};

    const STATION: &str = r#"
        health_log_ms = 5000

        [poller]
        grace_ms = 250
        io_timeout_ms = 1500

        [sync]
        lead_time_ms = 3000

        [[devices]]
        id = "subrack1"
        address = "sim://subrack1"
        adapter = { kind = "simulated", attributes = { tpm_power_states = [true, false] } }
        attributes = [{ name = "tpm_power_states", period_ms = 1000 }]

        [[devices]]
        id = "tile1"
        address = "sim://tile1"
        io_timeout_ms = 800
        attributes = [
            { name = "is_programmed", period_ms = 1000 },
            { name = "board_temperature", period_ms = 2000, epsilon = 0.5 },
        ]

        [devices.adapter]
        kind = "simulated"
        attributes = { is_programmed = false, board_temperature = 41.5 }

        [devices.adapter.commands.DownloadFirmware]
        duration_ms = 2000
        sets = { is_programmed = true }

        [[power_nodes]]
        id = "tile1"
        parent = "subrack1"
        control = { device = "subrack1", on = "PowerOnTpm", off = "PowerOffTpm", params = { tpm_slot = 1 } }
        observe = { device = "subrack1", attribute = "tpm_power_states", index = 0 }

        [[health_rules]]
        attribute = "board_temperature"
        min = 10.0
        max = 95.0

        [[health_rules]]
        attribute = "is_programmed"
        expected = true
        severity = "degraded"
        ignore_if_absent = true

        [[commands]]
        name = "SetAttenuation"
        params = [{ name = "db", kind = { type = "float", min = 0.0, max = 31.75 } }]
    "#;

    #[test]
    fn full_station_file_builds() {
        let file = StationFile::parse(STATION).unwrap();
        assert_eq!(file.poller.policy.grace_ms, 250);
        assert_eq!(file.poller.policy.failure_threshold, 3);
        assert_eq!(file.sync.lead_time_ms, 3_000);
        assert_eq!(file.sync.alignment_ms, 1_000);
        assert_eq!(file.health_log_interval(), Duration::from_secs(5));
        assert_eq!(file.health_rules[1].severity, Severity::Degraded);
        assert_eq!(file.power_nodes[0].supply_level, PowerState::Standby);

        let (registry, config) = file.build().unwrap();
        assert_eq!(registry.len(), 2);
        let tile = registry.get(&"tile1".into()).unwrap();
        assert_eq!(tile.io_timeout(), Duration::from_millis(800));
        assert_eq!(
            registry.get(&"subrack1".into()).unwrap().io_timeout(),
            Duration::from_millis(1_500)
        );
        assert_eq!(config.polling.len(), 2);
        assert_eq!(config.polling[1].attributes[1].epsilon, 0.5);
        assert!(config.catalog.get("SetAttenuation").is_some());
        assert!(config.catalog.get("DownloadFirmware").is_some());
    }

    #[test]
    fn duplicate_device_ids_reject_the_file() {
        let raw = r#"
            [[devices]]
            id = "tile1"
            address = "sim://a"
            adapter = { kind = "simulated" }

            [[devices]]
            id = "tile1"
            address = "sim://b"
            adapter = { kind = "simulated" }
        "#;
        let err = StationFile::parse(raw).unwrap().build().err().unwrap();
        assert!(matches!(err, TileError::Configuration(ref why) if why.contains("duplicate")), "{err}");
    }

    #[test]
    fn unknown_adapter_kind_is_a_parse_error() {
        let raw = r#"
            [[devices]]
            id = "tile1"
            address = "tcp://10.0.10.1"
            adapter = { kind = "telepathy" }
        "#;
        assert!(matches!(StationFile::parse(raw), Err(TileError::Configuration(_))));
    }

    #[test]
    fn board_without_transport_is_refused() {
        let raw = r#"
            [[devices]]
            id = "tile1"
            address = "udp://10.0.10.1:10000"
            adapter = { kind = "board" }
        "#;
        let err = StationFile::parse(raw).unwrap().build().err().unwrap();
        assert!(matches!(err, TileError::Configuration(_)), "{err}");
    }

    #[test]
    fn zero_network_timeout_is_refused() {
        let raw = r#"
            [[devices]]
            id = "tile1"
            address = "sim://tile1"
            io_timeout_ms = 0
            adapter = { kind = "simulated" }
        "#;
        assert!(StationFile::parse(raw).unwrap().build().is_err());
    }

    #[test]
    fn path_argument_wins_over_environment() {
        assert_eq!(
            resolve_path(Some("a.toml".into()), Some("b.toml".into())),
            PathBuf::from("a.toml")
        );
        assert_eq!(resolve_path(None, Some("b.toml".into())), PathBuf::from("b.toml"));
        assert_eq!(resolve_path(None, None), PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(resolve_path(None, Some(" ".into())), PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, STATION).expect("write");
        let file = load(&path).expect("load");
        assert_eq!(file.devices.len(), 2);
    }

    #[test]
    fn missing_file_is_a_configuration_fault() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, TileError::Configuration(_)));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            std::env::set_var("TILEMON_POLL_GRACE_MS", "900");
            std::env::set_var("TILEMON_FAILURE_THRESHOLD", "many");
        }
        let mut file = StationFile::parse("").unwrap();
        file.apply_env_overrides();
        assert_eq!(file.poller.policy.grace_ms, 900);
        assert_eq!(file.poller.policy.failure_threshold, 3);
        unsafe {
            std::env::remove_var("TILEMON_POLL_GRACE_MS");
            std::env::remove_var("TILEMON_FAILURE_THRESHOLD");
        }
    }
}
