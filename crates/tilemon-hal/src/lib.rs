//! `tilemon-hal` – Hardware Abstraction Layer
//!
//! Everything above this crate sees a device only through the uniform
//! [`HardwareCapability`] trait and the [`DeviceEndpoint`] that wraps it.
//!
//! # Modules
//!
//! - [`capability`] – the `{get_attribute, set_attribute, execute_command}`
//!   trait and the completion-query helper.
//! - [`rack`] – [`RackHttpAdapter`]: HTTP/JSON rack-management boards.
//! - [`board`] – [`BoardAdapter`]: register-mapped processing boards behind
//!   the [`RegisterAccess`] transport seam.
//! - [`sim`] – [`SimDevice`]: scripted in-process devices for tests and
//!   hardware-free runs.
//! - [`adapter`] – [`DeviceAdapter`]: the closed set of variants, chosen
//!   once from configuration.
//! - [`registry`] – [`DeviceRegistry`] and [`DeviceEndpoint`]: per-call
//!   timeouts, per-endpoint serialization, liveness flag.

pub mod adapter;
pub mod board;
pub mod capability;
pub mod rack;
pub mod registry;
pub mod sim;

pub use adapter::{AdapterConfig, DeviceAdapter};
pub use board::{BoardAdapter, RegisterAccess, RegisterMap};
pub use capability::{HardwareCapability, query_completion};
pub use rack::RackHttpAdapter;
pub use registry::{DEFAULT_IO_TIMEOUT, DeviceEndpoint, DeviceRegistry};
pub use sim::{SimCommand, SimConfig, SimDevice};
