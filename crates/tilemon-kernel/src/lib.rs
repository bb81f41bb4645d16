//! `tilemon-kernel` – Supervisory Rules
//!
//! The synchronous core of the station. It does no I/O; it decides. Every
//! function here takes the facts (cache snapshots, observed power, the
//! current instant) as arguments, which keeps it deterministic under test.
//!
//! # Modules
//!
//! - [`command_catalog`] – [`CommandCatalog`][command_catalog::CommandCatalog]:
//!   command specs and local parameter validation, applied before any
//!   network call.
//! - [`programming`] – [`derive_programming_state`][programming::derive_programming_state]
//!   and the per-board [`ProgrammingStateMachine`][programming::ProgrammingStateMachine]
//!   with its pending shadow markers.
//! - [`watchdog`] – [`TransitionWatchdog`][watchdog::TransitionWatchdog]:
//!   deadline table raising stuck-transition faults.
//! - [`health`] – [`HealthAggregator`][health::HealthAggregator]: declarative
//!   rules over cached values, rolled up per device and per station.

pub mod command_catalog;
pub mod health;
pub mod programming;
pub mod watchdog;

pub use command_catalog::{CommandCatalog, CommandMode, CommandSpec, ParamKind, ParamSpec};
pub use health::{AttributeSource, DeviceHealth, HealthAggregator, HealthRuleTable};
pub use programming::{ProgrammingStateMachine, StateChange, derive_programming_state};
pub use watchdog::{MissedTransition, TransitionWatchdog};
