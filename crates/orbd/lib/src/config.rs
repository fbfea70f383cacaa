//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use orbd_proto::{ServerDefinition, ServerId, paths};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error reading the configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// Error parsing TOML.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// A value is out of range.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// A reserved system server registered at daemon start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemServer {
	/// Reserved id, below [`ServerId::FIRST_GENERATED`].
	pub id: ServerId,
	/// Application name.
	#[serde(default)]
	pub application_name: String,
	/// Entry point label.
	#[serde(default)]
	pub server_name: String,
	/// Program to launch.
	pub executable_path: String,
	/// User arguments.
	#[serde(default)]
	pub args: String,
	/// Runtime arguments.
	#[serde(default)]
	pub vm_args: String,
}

impl SystemServer {
	/// Launch definition of this entry.
	#[must_use]
	pub fn definition(&self) -> ServerDefinition {
		ServerDefinition {
			application_name: self.application_name.clone(),
			server_name: self.server_name.clone(),
			executable_path: self.executable_path.clone(),
			args: self.args.clone(),
			vm_args: self.vm_args.clone(),
		}
	}
}

/// Configuration of the activation daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
	/// Directory holding the registry store and server logs.
	#[serde(default = "paths::default_data_dir")]
	pub data_dir: PathBuf,
	/// Control socket path.
	#[serde(default = "paths::default_socket_path")]
	pub socket_path: PathBuf,
	/// Host the daemon and its servers are reachable on.
	#[serde(default = "default_bootstrap_host")]
	pub bootstrap_host: String,
	/// Bootstrap port passed to launched servers.
	#[serde(default = "default_bootstrap_port")]
	pub bootstrap_port: u16,
	/// Interpreter placed in front of every server program, if any.
	#[serde(default)]
	pub runtime: Option<PathBuf>,
	/// Consecutive unexpected exits tolerated before a server is held down.
	#[serde(default = "default_activation_retry_max")]
	pub activation_retry_max: u32,
	/// Liveness re-check interval of blocked lookups, in milliseconds.
	#[serde(default = "default_lookup_poll_ms")]
	pub lookup_poll_ms: u64,
	/// Upper bound on a blocked lookup, in milliseconds.
	#[serde(default = "default_lookup_timeout_ms")]
	pub lookup_timeout_ms: u64,
	/// Health monitor polling interval, in milliseconds.
	#[serde(default = "default_monitor_interval_ms")]
	pub monitor_interval_ms: u64,
	/// Settle delay after a launch before redirecting traffic, in milliseconds.
	#[serde(default = "default_server_startup_delay_ms")]
	pub server_startup_delay_ms: u64,
	/// Deadline for a server process to acknowledge a control command, in milliseconds.
	#[serde(default = "default_control_timeout_ms")]
	pub control_timeout_ms: u64,
	/// Whether registrations launch the server in verify mode first.
	#[serde(default = "default_verify_on_register")]
	pub verify_on_register: bool,
	/// Reserved servers registered at startup.
	#[serde(default)]
	pub system_servers: Vec<SystemServer>,
}

fn default_bootstrap_host() -> String {
	"localhost".to_string()
}

fn default_bootstrap_port() -> u16 {
	1049
}

fn default_activation_retry_max() -> u32 {
	5
}

fn default_lookup_poll_ms() -> u64 {
	2_000
}

fn default_lookup_timeout_ms() -> u64 {
	60_000
}

fn default_monitor_interval_ms() -> u64 {
	60_000
}

fn default_server_startup_delay_ms() -> u64 {
	1_000
}

fn default_control_timeout_ms() -> u64 {
	5_000
}

fn default_verify_on_register() -> bool {
	true
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			data_dir: paths::default_data_dir(),
			socket_path: paths::default_socket_path(),
			bootstrap_host: default_bootstrap_host(),
			bootstrap_port: default_bootstrap_port(),
			runtime: None,
			activation_retry_max: default_activation_retry_max(),
			lookup_poll_ms: default_lookup_poll_ms(),
			lookup_timeout_ms: default_lookup_timeout_ms(),
			monitor_interval_ms: default_monitor_interval_ms(),
			server_startup_delay_ms: default_server_startup_delay_ms(),
			control_timeout_ms: default_control_timeout_ms(),
			verify_on_register: default_verify_on_register(),
			system_servers: Vec::new(),
		}
	}
}

impl DaemonConfig {
	/// Reads and validates a configuration file.
	///
	/// # Errors
	///
	/// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml(&text)
	}

	/// Parses and validates configuration text.
	///
	/// # Errors
	///
	/// Returns [`ConfigError`] on malformed TOML or out-of-range values.
	pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.activation_retry_max == 0 {
			return Err(ConfigError::Invalid("activation_retry_max must be at least 1".into()));
		}
		if self.lookup_poll_ms == 0 {
			return Err(ConfigError::Invalid("lookup_poll_ms must be positive".into()));
		}
		if self.monitor_interval_ms == 0 {
			return Err(ConfigError::Invalid("monitor_interval_ms must be positive".into()));
		}
		if let Some(server) = self.system_servers.iter().find(|s| !s.id.is_reserved()) {
			return Err(ConfigError::Invalid(format!(
				"system server id {} is outside the reserved range (< {})",
				server.id,
				ServerId::FIRST_GENERATED
			)));
		}
		Ok(())
	}

	/// Path of the registry store inside [`Self::data_dir`].
	#[must_use]
	pub fn registry_path(&self) -> PathBuf {
		self.data_dir.join("registry.json")
	}

	/// Directory receiving server stdout/stderr logs.
	#[must_use]
	pub fn log_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	/// Liveness re-check interval of blocked lookups.
	#[must_use]
	pub fn lookup_poll(&self) -> Duration {
		Duration::from_millis(self.lookup_poll_ms)
	}

	/// Upper bound on a blocked lookup.
	#[must_use]
	pub fn lookup_timeout(&self) -> Duration {
		Duration::from_millis(self.lookup_timeout_ms)
	}

	/// Health monitor polling interval.
	#[must_use]
	pub fn monitor_interval(&self) -> Duration {
		Duration::from_millis(self.monitor_interval_ms)
	}

	/// Settle delay after a launch.
	#[must_use]
	pub fn server_startup_delay(&self) -> Duration {
		Duration::from_millis(self.server_startup_delay_ms)
	}

	/// Control command deadline.
	#[must_use]
	pub fn control_timeout(&self) -> Duration {
		Duration::from_millis(self.control_timeout_ms)
	}
}
