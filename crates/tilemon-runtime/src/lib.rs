//! `tilemon-runtime` – The Supervisory Engine
//!
//! Where the station runs: tokio tasks poll the hardware, the executor
//! drives commands, and the orchestrators block on state convergence as
//! observed by the pollers. The decisions themselves live in
//! `tilemon-kernel`; this crate supplies time, I/O and concurrency.
//!
//! # Modules
//!
//! - [`cache`] – [`CacheStore`][cache::CacheStore]: per-device attribute
//!   partitions, read without blocking and annotated stale past
//!   `polling_period + grace`.
//! - [`poller`] – [`DevicePoller`][poller::DevicePoller]: one task per
//!   device with per-attribute schedules, exponential backoff, communication
//!   fault escalation and out-of-cycle requests through
//!   [`PollerHandle`][poller::PollerHandle].
//! - [`executor`] – [`CommandExecutor`][executor::CommandExecutor]: local
//!   validation, one in-flight task per device, synchronous and asynchronous
//!   commands, completion polling, command deadlines.
//! - [`programming`] – [`ProgrammingMonitor`][programming::ProgrammingMonitor]:
//!   runs the per-board programming state machines and the stuck-transition
//!   watchdog.
//! - [`power`] – [`PowerOrchestrator`][power::PowerOrchestrator]: power
//!   transitions honouring the [`PowerTree`][power::PowerTree], staggered
//!   batch power-up.
//! - [`sync`] – [`SynchronizationCoordinator`][sync::SynchronizationCoordinator]:
//!   aligned acquisition start across boards.
//! - [`station`] – [`Station`][station::Station]: assembly, upward status
//!   snapshots, shutdown.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP span export.

pub mod cache;
pub mod executor;
pub mod poller;
pub mod power;
pub mod programming;
pub mod station;
pub mod sync;
pub mod telemetry;

pub use cache::{CacheStore, DeviceCache};
pub use executor::{CommandExecutor, ExecutorConfig, TransitionTracker};
pub use poller::{
    CycleObserver, CycleOutcome, DevicePoller, PolledAttribute, PollerConfig, PollerHandle,
};
pub use power::{
    BatchPowerResult, NodeKind, PowerConfig, PowerControl, PowerNode, PowerObservation,
    PowerOrchestrator, PowerTree,
};
pub use programming::ProgrammingMonitor;
pub use station::{DevicePolling, DeviceStatus, FaultKind, FaultSummary, Station, StationConfig};
pub use sync::{SyncConfig, SyncReport, SynchronizationCoordinator, aligned_start_time};
pub use telemetry::{TracerProviderGuard, init_tracing};
