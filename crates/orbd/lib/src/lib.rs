//! On-demand server activation daemon.
//!
//! The daemon keeps a durable [`ServerRegistry`] of launch definitions and
//! starts servers lazily: the first time a server is located, the
//! [`ActivationManager`] launches its process and blocks the caller until the
//! process calls back with its listening endpoints. A [`ServerRecord`] per
//! server supervises the process through a small state machine with a bounded
//! relaunch budget, and the [`HealthMonitor`] demotes running servers whose
//! process died.
//!
//! # Module map
//!
//! - [`registry`]: durable id to definition table.
//! - [`record`]: per-server state machine and process ownership.
//! - [`manager`]: activation, location, and redirect resolution.
//! - [`monitor`]: server table and background liveness checks.
//! - [`launcher`]: process spawning, with in-memory fakes for tests.
//! - [`ipc`] / [`client`] / [`agent`]: the control socket, its admin client,
//!   and the helper used inside launched servers.

pub mod agent;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod launcher;
pub mod manager;
pub mod monitor;
pub mod record;
pub mod registry;
pub mod transport;

pub use config::{ConfigError, DaemonConfig, SystemServer};
pub use control::ServerControl;
pub use error::{ActivationError, ErrorClass, Result};
pub use launcher::{OsLauncher, ProcessLauncher, ServerProcess};
pub use manager::ActivationManager;
pub use monitor::{HealthMonitor, ServerTable};
pub use record::ServerRecord;
pub use registry::ServerRegistry;
pub use transport::RedirectSink;
