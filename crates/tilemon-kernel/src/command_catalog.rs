//! [`CommandCatalog`] – the gate every command passes before the network.
//!
//! Each command the station may issue is described by a [`CommandSpec`]:
//! whether it completes within the call or runs on in the hardware, whether
//! it mutates, how long it may take, its typed parameter schema, which
//! cached attributes it affects, and which programming transition it
//! triggers. [`CommandCatalog::validate`] checks a submission against its
//! spec locally, so malformed requests never cost a network round-trip.
//!
//! # Example
//!
//! ```
//! use tilemon_kernel::CommandCatalog;
//!
//! let catalog = CommandCatalog::standard();
//! let device = "subrack1".into();
//!
//! let ok = serde_json::json!({ "tpm_slot": 3 });
//! assert!(catalog.validate(&device, "PowerOnTpm", &ok).is_ok());
//!
//! let out_of_range = serde_json::json!({ "tpm_slot": 9 });
//! assert!(catalog.validate(&device, "PowerOnTpm", &out_of_range).is_err());
//! ```

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tilemon_types::{COMPLETION_QUERY, DeviceId, ProgrammingState, RejectReason, TileError};

// ────────────────────────────────────────────────────────────────────────────
// Schema types
// ────────────────────────────────────────────────────────────────────────────

/// How a command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    /// Resolves within the submitting call.
    #[default]
    Sync,
    /// Answers `STARTED`; progress is polled with the completion query.
    Async,
}

/// Type and range of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Float {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Bool,
    /// Non-empty string.
    Text,
    /// Distinct integers, each within `min..=max`.
    IntegerList {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
        #[serde(default)]
        max_len: Option<usize>,
    },
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default = "yes")]
    pub required: bool,
}

impl ParamSpec {
    pub fn integer(name: &str, min: Option<i64>, max: Option<i64>) -> Self {
        Self::of(name, ParamKind::Integer { min, max })
    }

    pub fn float(name: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self::of(name, ParamKind::Float { min, max })
    }

    pub fn text(name: &str) -> Self {
        Self::of(name, ParamKind::Text)
    }

    pub fn integer_list(name: &str, min: Option<i64>, max: Option<i64>, max_len: Option<usize>) -> Self {
        Self::of(name, ParamKind::IntegerList { min, max, max_len })
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    fn of(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    /// Check one supplied value against this parameter's kind.
    fn check(&self, value: &serde_json::Value) -> Result<(), String> {
        let name = &self.name;
        let in_range = |v: i64, min: Option<i64>, max: Option<i64>| -> Result<(), String> {
            if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                Err(format!("{name}={v} outside {}", describe_range(min, max)))
            } else {
                Ok(())
            }
        };
        match &self.kind {
            ParamKind::Integer { min, max } => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| format!("{name} must be an integer"))?;
                in_range(v, *min, *max)
            }
            ParamKind::Float { min, max } => {
                let v = value
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| format!("{name} must be a number"))?;
                if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                    return Err(format!("{name}={v} outside {}", describe_range(*min, *max)));
                }
                Ok(())
            }
            ParamKind::Bool => value
                .as_bool()
                .map(|_| ())
                .ok_or_else(|| format!("{name} must be a boolean")),
            ParamKind::Text => match value.as_str() {
                Some(s) if !s.trim().is_empty() => Ok(()),
                _ => Err(format!("{name} must be a non-empty string")),
            },
            ParamKind::IntegerList { min, max, max_len } => {
                let items = value
                    .as_array()
                    .ok_or_else(|| format!("{name} must be a list of integers"))?;
                if max_len.is_some_and(|n| items.len() > n) {
                    return Err(format!("{name} holds more than {} items", max_len.unwrap_or(0)));
                }
                let mut seen = HashSet::new();
                for item in items {
                    let v = item
                        .as_i64()
                        .ok_or_else(|| format!("{name} must be a list of integers"))?;
                    in_range(v, *min, *max)?;
                    if !seen.insert(v) {
                        return Err(format!("{name} repeats {v}"));
                    }
                }
                Ok(())
            }
        }
    }
}

fn describe_range<T: std::fmt::Display>(min: Option<T>, max: Option<T>) -> String {
    match (min, max) {
        (Some(a), Some(b)) => format!("[{a}, {b}]"),
        (Some(a), None) => format!("[{a}, ..)"),
        (None, Some(b)) => format!("(.., {b}]"),
        (None, None) => "(.., ..)".to_string(),
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_confirm_ms() -> u64 {
    5_000
}

/// Everything the station knows about one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub mode: CommandMode,
    #[serde(default = "yes")]
    pub mutating: bool,
    /// Command-level deadline, independent of per-call network timeouts.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Cached attributes re-read as soon as the command completes.
    #[serde(default)]
    pub affects: Vec<String>,
    /// Programming state this command drives the board towards.
    #[serde(default)]
    pub pending_state: Option<ProgrammingState>,
    /// Accepting this command legitimises a backward programming move.
    #[serde(default)]
    pub resets_programming: bool,
    /// How long after completion the expected state may take to appear.
    #[serde(default = "default_confirm_ms")]
    pub confirm_within_ms: u64,
}

impl CommandSpec {
    pub fn new(name: &str, mode: CommandMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            mutating: true,
            timeout_ms: default_timeout_ms(),
            params: Vec::new(),
            affects: Vec::new(),
            pending_state: None,
            resets_programming: false,
            confirm_within_ms: default_confirm_ms(),
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn affects(mut self, attribute: &str) -> Self {
        self.affects.push(attribute.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn drives_to(mut self, state: ProgrammingState) -> Self {
        self.pending_state = Some(state);
        self
    }

    pub fn resetting(mut self) -> Self {
        self.resets_programming = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.mutating = false;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn confirm_within(&self) -> Duration {
        Duration::from_millis(self.confirm_within_ms)
    }

    pub fn is_async(&self) -> bool {
        self.mode == CommandMode::Async
    }

    fn check_definition(&self) -> Result<(), TileError> {
        let fail = |why: String| Err(TileError::Configuration(format!("command '{}': {why}", self.name)));
        if self.name.trim().is_empty() {
            return fail("name is empty".into());
        }
        if self.name == COMPLETION_QUERY {
            return fail("name is reserved for completion queries".into());
        }
        if self.timeout_ms == 0 {
            return fail("timeout must be positive".into());
        }
        let mut names = HashSet::new();
        for param in &self.params {
            if !names.insert(param.name.as_str()) {
                return fail(format!("parameter {} declared twice", param.name));
            }
            let inverted = match &param.kind {
                ParamKind::Integer { min: Some(a), max: Some(b) }
                | ParamKind::IntegerList { min: Some(a), max: Some(b), .. } => a > b,
                ParamKind::Float { min: Some(a), max: Some(b) } => a > b,
                _ => false,
            };
            if inverted {
                return fail(format!("parameter {} has min above max", param.name));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CommandCatalog
// ────────────────────────────────────────────────────────────────────────────

/// Lookup table of [`CommandSpec`]s by name.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    commands: BTreeMap<String, CommandSpec>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The commands of rack-management and processing boards.
    pub fn standard() -> Self {
        use ProgrammingState::{Initialised, Off, Programmed, Synchronised, Unprogrammed};

        let specs = [
            CommandSpec::new("PowerOn", CommandMode::Sync)
                .affects("power_state")
                .drives_to(Unprogrammed),
            CommandSpec::new("PowerOff", CommandMode::Sync)
                .affects("power_state")
                .drives_to(Off)
                .resetting(),
            CommandSpec::new("Standby", CommandMode::Sync)
                .affects("power_state")
                .drives_to(Off)
                .resetting(),
            CommandSpec::new("PowerOnTpm", CommandMode::Sync)
                .param(ParamSpec::integer("tpm_slot", Some(1), Some(8)))
                .affects("tpm_power_states")
                .timeout(Duration::from_secs(20)),
            CommandSpec::new("PowerOffTpm", CommandMode::Sync)
                .param(ParamSpec::integer("tpm_slot", Some(1), Some(8)))
                .affects("tpm_power_states")
                .timeout(Duration::from_secs(20)),
            CommandSpec::new("SetFanSpeed", CommandMode::Sync)
                .param(ParamSpec::integer("fan_id", Some(1), Some(4)))
                .param(ParamSpec::float("speed_percent", Some(0.0), Some(100.0)))
                .affects("fan_speeds"),
            CommandSpec::new("DownloadFirmware", CommandMode::Async)
                .param(ParamSpec::text("bitfile"))
                .affects("is_programmed")
                .drives_to(Programmed)
                .timeout(Duration::from_secs(120)),
            CommandSpec::new("Initialise", CommandMode::Async)
                .affects("is_initialised")
                .drives_to(Initialised)
                .timeout(Duration::from_secs(60)),
            CommandSpec::new("StartAcquisition", CommandMode::Async)
                .param(ParamSpec::integer("start_time", Some(0), None))
                .param(ParamSpec::integer("delay", Some(0), Some(1024)).optional())
                .affects("is_synchronised")
                .drives_to(Synchronised)
                .timeout(Duration::from_secs(30)),
            CommandSpec::new("ConfigureChannels", CommandMode::Sync)
                .param(ParamSpec::integer_list("channel_groups", Some(0), Some(47), Some(48))),
            CommandSpec::new("ConfigureScan", CommandMode::Sync)
                .param(ParamSpec::integer("scan_id", Some(0), None)),
            CommandSpec::new("ResetFault", CommandMode::Sync)
                .affects("hardware_fault")
                .resetting(),
            CommandSpec::new("GetFirmwareList", CommandMode::Sync).read_only(),
        ];
        let mut catalog = Self::new();
        for spec in specs {
            catalog.commands.insert(spec.name.clone(), spec);
        }
        catalog
    }

    /// Add or replace a command.
    ///
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the definition is malformed.
    pub fn insert(&mut self, spec: CommandSpec) -> Result<(), TileError> {
        spec.check_definition()?;
        self.commands.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Validate a submission locally.
    ///
    /// `null` parameters are treated as an empty object. Returns the spec
    /// and the parameters to send.
    ///
    /// # Errors
    ///
    /// [`TileError::CommandRejected`] with [`RejectReason::UnknownCommand`]
    /// or [`RejectReason::InvalidParameters`].
    pub fn validate(
        &self,
        device: &DeviceId,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<(&CommandSpec, serde_json::Value), TileError> {
        let spec = self
            .commands
            .get(command)
            .ok_or_else(|| TileError::rejected(device, command, RejectReason::UnknownCommand))?;
        let invalid = |why: String| TileError::rejected(device, command, RejectReason::InvalidParameters(why));

        let empty = serde_json::Map::new();
        let supplied = match params {
            serde_json::Value::Null => &empty,
            serde_json::Value::Object(map) => map,
            _ => return Err(invalid("parameters must be an object".into())),
        };
        if let Some(extra) = supplied
            .keys()
            .find(|key| !spec.params.iter().any(|p| &p.name == *key))
        {
            return Err(invalid(format!("unknown parameter {extra}")));
        }
        for param in &spec.params {
            match supplied.get(&param.name) {
                Some(value) => param.check(value).map_err(invalid)?,
                None if param.required => {
                    return Err(invalid(format!("missing parameter {}", param.name)));
                }
                None => {}
            }
        }
        Ok((spec, serde_json::Value::Object(supplied.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(err: TileError) -> RejectReason {
        match err {
            TileError::CommandRejected { reason, .. } => reason,
            other => panic!("expected rejection, got {other}"),
        }
    }

    fn tile() -> DeviceId {
        "tile1".into()
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = CommandCatalog::standard()
            .validate(&tile(), "SelfDestruct", &serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(reason(err), RejectReason::UnknownCommand);
    }

    #[test]
    fn missing_and_extra_parameters_are_rejected() {
        let catalog = CommandCatalog::standard();
        let missing = catalog
            .validate(&tile(), "DownloadFirmware", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(reason(missing), RejectReason::InvalidParameters(why) if why.contains("bitfile")));

        let extra = catalog
            .validate(&tile(), "Initialise", &serde_json::json!({ "force": true }))
            .unwrap_err();
        assert!(matches!(reason(extra), RejectReason::InvalidParameters(why) if why.contains("force")));
    }

    #[test]
    fn optional_parameter_may_be_omitted() {
        let catalog = CommandCatalog::standard();
        let (spec, params) = catalog
            .validate(&tile(), "StartAcquisition", &serde_json::json!({ "start_time": 1_700_000_002 }))
            .unwrap();
        assert!(spec.is_async());
        assert_eq!(params["start_time"], 1_700_000_002);

        let err = catalog
            .validate(
                &tile(),
                "StartAcquisition",
                &serde_json::json!({ "start_time": 10, "delay": 2048 }),
            )
            .unwrap_err();
        assert!(matches!(reason(err), RejectReason::InvalidParameters(_)));
    }

    #[test]
    fn integer_lists_check_range_and_duplicates() {
        let catalog = CommandCatalog::standard();
        assert!(catalog
            .validate(&tile(), "ConfigureChannels", &serde_json::json!({ "channel_groups": [0, 1, 47] }))
            .is_ok());
        assert!(catalog
            .validate(&tile(), "ConfigureChannels", &serde_json::json!({ "channel_groups": [48] }))
            .is_err());
        assert!(catalog
            .validate(&tile(), "ConfigureChannels", &serde_json::json!({ "channel_groups": [3, 3] }))
            .is_err());
    }

    #[test]
    fn wrong_types_are_rejected() {
        let catalog = CommandCatalog::standard();
        assert!(catalog
            .validate(&tile(), "PowerOnTpm", &serde_json::json!({ "tpm_slot": "3" }))
            .is_err());
        assert!(catalog
            .validate(&tile(), "DownloadFirmware", &serde_json::json!({ "bitfile": "  " }))
            .is_err());
        assert!(catalog
            .validate(&tile(), "Initialise", &serde_json::json!([1, 2]))
            .is_err());
    }

    #[test]
    fn definitions_are_checked_on_insert() {
        let mut catalog = CommandCatalog::new();
        let reserved = CommandSpec::new(COMPLETION_QUERY, CommandMode::Sync);
        assert!(catalog.insert(reserved).is_err());

        let inverted = CommandSpec::new("SetAttenuation", CommandMode::Sync)
            .param(ParamSpec::float("db", Some(31.0), Some(0.0)));
        assert!(matches!(catalog.insert(inverted), Err(TileError::Configuration(_))));

        let custom = CommandSpec::new("SetAttenuation", CommandMode::Sync)
            .param(ParamSpec::float("db", Some(0.0), Some(31.0)));
        catalog.insert(custom).unwrap();
        assert!(catalog.get("SetAttenuation").is_some());
    }

    #[test]
    fn spec_deserializes_from_toml() {
        let spec: CommandSpec = toml::from_str(
            r#"
            name = "ConfigureBeam"
            mode = "async"
            timeout_ms = 15000
            affects = ["beam_configured"]

            [[params]]
            name = "beam_id"
            kind = { type = "integer", min = 0, max = 7 }
            "#,
        )
        .unwrap();
        assert!(spec.is_async());
        assert!(spec.mutating);
        assert_eq!(spec.params[0].kind, ParamKind::Integer { min: Some(0), max: Some(7) });
    }
}
