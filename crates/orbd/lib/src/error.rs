//! Error taxonomy of the activation subsystem.

use std::path::PathBuf;

use orbd_proto::{ErrorCode, RoutingKeyError, ServerId, ServerState, VerifyResult, WireError};
use thiserror::Error;

/// How a caller is expected to react to an [`ActivationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Lookup miss or conflicting request. Surfaced as-is, never retried.
	Conflict,
	/// The server may be mid-startup or down. Callers retry at a higher level.
	Transient,
	/// The operation failed; the daemon keeps running.
	Fatal,
}

/// Errors produced by the registry, server records, and the activation manager.
#[derive(Debug, Error)]
pub enum ActivationError {
	/// No definition exists for the id.
	#[error("server {0} is not registered")]
	NotRegistered(ServerId),

	/// No definition exists for the application name.
	#[error("no server registered for application '{0}'")]
	ServerNotFound(String),

	/// The application name or explicit id is taken.
	#[error("server {existing} is already registered (application '{application}')")]
	AlreadyRegistered {
		/// Application name of the rejected definition.
		application: String,
		/// Id of the conflicting registration.
		existing: ServerId,
	},

	/// The server is already installed.
	#[error("server {0} is already installed")]
	AlreadyInstalled(ServerId),

	/// The server is already uninstalled.
	#[error("server {0} is already uninstalled")]
	AlreadyUninstalled(ServerId),

	/// The server is activated or running.
	#[error("server {0} is already active")]
	AlreadyActive(ServerId),

	/// The orb announced its endpoints twice.
	#[error("orb '{orb_id}' of server {server_id} already registered its endpoints")]
	AlreadyRegisteredForClient {
		/// Announcing server.
		server_id: ServerId,
		/// Orb identity.
		orb_id: String,
	},

	/// A control callback arrived outside of the launch window.
	#[error("unexpected callback registration for server {server_id} in state {state}")]
	UnexpectedRegistration {
		/// Announcing server.
		server_id: ServerId,
		/// State at the time of the callback.
		state: ServerState,
	},

	/// The server did not reach the running state, or its retries are exhausted.
	#[error("server {0} is held down")]
	ServerHeldDown(ServerId),

	/// No orb of the server exposes the endpoint type.
	#[error("server {server_id} has no '{endpoint_type}' endpoint")]
	NoSuchEndPoint {
		/// Target server.
		server_id: ServerId,
		/// Requested endpoint type.
		endpoint_type: String,
	},

	/// The orb never announced endpoints.
	#[error("server {server_id} has no orb '{orb_id}'")]
	InvalidOrbId {
		/// Target server.
		server_id: ServerId,
		/// Requested orb.
		orb_id: String,
	},

	/// The operation requires a running server.
	#[error("server {0} is not running")]
	ServerNotRunning(ServerId),

	/// Spawning the server process failed.
	#[error("unable to start process for server {server_id}: {source}")]
	UnableToStartProcess {
		/// Target server.
		server_id: ServerId,
		/// Spawn error.
		#[source]
		source: std::io::Error,
	},

	/// Verification rejected the definition.
	#[error("definition for '{application}' failed verification: {result}")]
	InvalidDefinition {
		/// Application name of the rejected definition.
		application: String,
		/// Verification outcome.
		result: VerifyResult,
	},

	/// The routing key of a misrouted request could not be decoded.
	#[error("invalid routing key: {0}")]
	InvalidRoutingKey(#[from] RoutingKeyError),

	/// A lifecycle hook of the server process failed or is unavailable.
	#[error("control call to server {server_id} failed: {message}")]
	ControlFailed {
		/// Target server.
		server_id: ServerId,
		/// Failure detail.
		message: String,
	},

	/// Reading or writing the registry store failed.
	#[error("registry store {path}: {source}")]
	Storage {
		/// Store path.
		path: PathBuf,
		/// I/O error.
		#[source]
		source: std::io::Error,
	},

	/// The registry store could not be encoded or decoded.
	#[error("registry store {path} is malformed: {source}")]
	Codec {
		/// Store path.
		path: PathBuf,
		/// Codec error.
		#[source]
		source: serde_json::Error,
	},

	/// The registry store was written by an incompatible version.
	#[error("registry store {path} has version {found}, expected {expected}")]
	UnsupportedStoreVersion {
		/// Store path.
		path: PathBuf,
		/// Version found on disk.
		found: u32,
		/// Version this build writes.
		expected: u32,
	},

	/// The id counter ran out of values.
	#[error("server id space exhausted")]
	IdsExhausted,
}

/// Result type for activation operations.
pub type Result<T> = std::result::Result<T, ActivationError>;

impl ActivationError {
	/// Classifies the error for retry decisions.
	#[must_use]
	pub fn class(&self) -> ErrorClass {
		match self {
			Self::NotRegistered(_)
			| Self::ServerNotFound(_)
			| Self::AlreadyRegistered { .. }
			| Self::AlreadyInstalled(_)
			| Self::AlreadyUninstalled(_)
			| Self::AlreadyActive(_)
			| Self::AlreadyRegisteredForClient { .. }
			| Self::UnexpectedRegistration { .. }
			| Self::InvalidOrbId { .. }
			| Self::ServerNotRunning(_)
			| Self::InvalidDefinition { .. }
			| Self::InvalidRoutingKey(_) => ErrorClass::Conflict,
			Self::ServerHeldDown(_) | Self::NoSuchEndPoint { .. } => ErrorClass::Transient,
			Self::UnableToStartProcess { .. }
			| Self::ControlFailed { .. }
			| Self::Storage { .. }
			| Self::Codec { .. }
			| Self::UnsupportedStoreVersion { .. }
			| Self::IdsExhausted => ErrorClass::Fatal,
		}
	}

	/// Stable wire code for this error.
	#[must_use]
	pub fn code(&self) -> ErrorCode {
		match self {
			Self::NotRegistered(_) => ErrorCode::NotRegistered,
			Self::ServerNotFound(_) => ErrorCode::ServerNotFound,
			Self::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
			Self::AlreadyInstalled(_) => ErrorCode::AlreadyInstalled,
			Self::AlreadyUninstalled(_) => ErrorCode::AlreadyUninstalled,
			Self::AlreadyActive(_) => ErrorCode::AlreadyActive,
			Self::AlreadyRegisteredForClient { .. } => ErrorCode::AlreadyRegisteredForClient,
			Self::UnexpectedRegistration { .. } => ErrorCode::UnexpectedRegistration,
			Self::ServerHeldDown(_) => ErrorCode::ServerHeldDown,
			Self::NoSuchEndPoint { .. } => ErrorCode::NoSuchEndPoint,
			Self::InvalidOrbId { .. } => ErrorCode::InvalidOrbId,
			Self::ServerNotRunning(_) => ErrorCode::ServerNotRunning,
			Self::UnableToStartProcess { .. } => ErrorCode::UnableToStartProcess,
			Self::InvalidDefinition { .. } => ErrorCode::InvalidDefinition,
			Self::InvalidRoutingKey(_) => ErrorCode::InvalidRoutingKey,
			Self::ControlFailed { .. } => ErrorCode::Internal,
			Self::Storage { .. } | Self::Codec { .. } | Self::UnsupportedStoreVersion { .. } => ErrorCode::Storage,
			Self::IdsExhausted => ErrorCode::Internal,
		}
	}

	/// Converts into the error reported over the control socket.
	#[must_use]
	pub fn to_wire(&self) -> WireError {
		WireError::new(self.code(), self.to_string())
	}
}
