//! Wire types for the orbd control socket.
//!
//! This module defines the domain values shared between the activation daemon,
//! administrative tools, and supervised server processes, plus the frames they
//! exchange over the control socket.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routing::RoutingKey;

/// Endpoint type announced by servers for plain (unencrypted) traffic.
pub const CLEAR_TEXT_ENDPOINT: &str = "clear";

/// Identifier of a server known to the activation daemon.
///
/// Ids below [`ServerId::FIRST_GENERATED`] are reserved for system servers and
/// are only ever assigned explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u32);

impl ServerId {
	/// First id handed out by the registry counter.
	pub const FIRST_GENERATED: u32 = 256;

	/// Returns true for ids inside the reserved system range.
	#[must_use]
	pub const fn is_reserved(self) -> bool {
		self.0 < Self::FIRST_GENERATED
	}
}

impl fmt::Display for ServerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Unique identifier for requests and responses on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Correlation id for control commands pushed to a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlId(pub u64);

/// Immutable launch definition of a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
	/// Unique business key. Empty for anonymous registrations.
	pub application_name: String,
	/// Entry point label passed to the launched process.
	pub server_name: String,
	/// Program (or script, when a runtime is configured) to launch.
	pub executable_path: String,
	/// Whitespace separated user arguments.
	pub args: String,
	/// Whitespace separated runtime arguments, placed before the program.
	pub vm_args: String,
}

impl ServerDefinition {
	/// User arguments split on whitespace.
	pub fn arg_list(&self) -> impl Iterator<Item = &str> {
		self.args.split_whitespace()
	}

	/// Runtime arguments split on whitespace.
	pub fn vm_arg_list(&self) -> impl Iterator<Item = &str> {
		self.vm_args.split_whitespace()
	}
}

/// One registry row as reported to administrative tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionEntry {
	/// Registry key.
	pub server_id: ServerId,
	/// Launch definition.
	pub definition: ServerDefinition,
	/// Whether the server has been installed.
	pub installed: bool,
}

/// A listening endpoint announced by a server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndPoint {
	/// Endpoint type, e.g. [`CLEAR_TEXT_ENDPOINT`].
	pub endpoint_type: String,
	/// Listening port.
	pub port: u16,
}

impl EndPoint {
	/// Creates an endpoint.
	pub fn new(endpoint_type: impl Into<String>, port: u16) -> Self {
		Self {
			endpoint_type: endpoint_type.into(),
			port,
		}
	}
}

/// Port of one orb for a requested endpoint type.
///
/// `port` is `-1` when the orb never announced an endpoint of that type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrbPortInfo {
	/// Orb identity inside the server process.
	pub orb_id: String,
	/// Port, or `-1`.
	pub port: i32,
}

impl OrbPortInfo {
	/// Port as a usable value, if the orb announced one.
	#[must_use]
	pub fn port(&self) -> Option<u16> {
		u16::try_from(self.port).ok()
	}
}

/// Location of a running server for one endpoint type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLocation {
	/// Host the server listens on.
	pub host: String,
	/// Per-orb ports.
	pub ports: Vec<OrbPortInfo>,
}

/// All endpoints of one orb inside a running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLocationPerOrb {
	/// Host the server listens on.
	pub host: String,
	/// Endpoints announced by the orb.
	pub endpoints: Vec<EndPoint>,
}

/// Lifecycle state of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
	/// Record created, no process launched yet.
	Activating,
	/// Process launched, waiting for endpoint registration.
	Activated,
	/// Endpoints registered, serving traffic.
	Running,
	/// Shut down or found dead; the next activation relaunches it.
	Deactivated,
	/// Relaunch retries exhausted; requires an explicit shutdown.
	HeldDown,
}

impl ServerState {
	/// True while a launch is in progress.
	#[must_use]
	pub const fn is_starting(self) -> bool {
		matches!(self, Self::Activating | Self::Activated)
	}

	/// True for the states reported as "active" to callers.
	#[must_use]
	pub const fn is_active(self) -> bool {
		matches!(self, Self::Activated | Self::Running)
	}

	/// Lowercase name used in logs and tool output.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Activating => "activating",
			Self::Activated => "activated",
			Self::Running => "running",
			Self::Deactivated => "deactivated",
			Self::HeldDown => "held_down",
		}
	}
}

impl fmt::Display for ServerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of launching a server in verify-only mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyResult {
	/// The server started and exited cleanly.
	Ok,
	/// The program or entry point could not be found.
	MainNotFound,
	/// The program exists but exposes no usable entry point.
	NoEntryPoint,
	/// The server's own initialization failed.
	ApplicationError,
	/// Any other exit status, including death by signal.
	Unknown,
}

impl VerifyResult {
	/// Exit code a server reports for a successful verification.
	pub const EXIT_OK: i32 = 0;
	/// Exit code for a missing entry point program.
	pub const EXIT_MAIN_NOT_FOUND: i32 = 1;
	/// Exit code for a missing entry point.
	pub const EXIT_NO_ENTRY_POINT: i32 = 2;
	/// Exit code for an application failure.
	pub const EXIT_APPLICATION_ERROR: i32 = 3;

	/// Maps a process exit code (`None` when killed by a signal).
	#[must_use]
	pub const fn from_exit_code(code: Option<i32>) -> Self {
		match code {
			Some(Self::EXIT_OK) => Self::Ok,
			Some(Self::EXIT_MAIN_NOT_FOUND) => Self::MainNotFound,
			Some(Self::EXIT_NO_ENTRY_POINT) => Self::NoEntryPoint,
			Some(Self::EXIT_APPLICATION_ERROR) => Self::ApplicationError,
			_ => Self::Unknown,
		}
	}

	/// Exit code a verifying server should report for this outcome.
	#[must_use]
	pub const fn exit_code(self) -> i32 {
		match self {
			Self::Ok => Self::EXIT_OK,
			Self::MainNotFound => Self::EXIT_MAIN_NOT_FOUND,
			Self::NoEntryPoint => Self::EXIT_NO_ENTRY_POINT,
			Self::ApplicationError => Self::EXIT_APPLICATION_ERROR,
			Self::Unknown => 4,
		}
	}
}

impl fmt::Display for VerifyResult {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Ok => "ok",
			Self::MainNotFound => "main not found",
			Self::NoEntryPoint => "no entry point",
			Self::ApplicationError => "application error",
			Self::Unknown => "unknown error",
		};
		f.write_str(s)
	}
}

/// Reference to an object hosted by a running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
	/// Host of the hosting server.
	pub host: String,
	/// Port of the hosting orb.
	pub port: u16,
	/// Routing key identifying the object inside that server.
	pub routing_key: RoutingKey,
}

/// Instruction to reissue a request against a new location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
	/// Where the request should go instead.
	pub target: ObjectRef,
}

/// Classification of frames transmitted over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
	/// A request from a tool or server process to the daemon.
	Request(Request),
	/// A response from the daemon.
	Response(Response),
	/// A control command from the daemon to a server process.
	Control(Control),
	/// Acknowledgment of a control command.
	ControlAck(ControlAck),
}

/// A request to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	/// Unique request identifier for correlation.
	pub id: RequestId,
	/// The request payload.
	pub payload: RequestPayload,
}

/// Request payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
	/// Connectivity check.
	Ping,
	/// Register a server definition.
	Register {
		/// Launch definition.
		definition: ServerDefinition,
		/// Reserved id, for system servers.
		explicit_id: Option<ServerId>,
	},
	/// Remove a server definition.
	Unregister {
		/// Target server.
		server_id: ServerId,
	},
	/// Fetch a server definition.
	GetServer {
		/// Target server.
		server_id: ServerId,
	},
	/// Resolve an application name to its id.
	GetServerId {
		/// Application name.
		application_name: String,
	},
	/// List registered ids.
	ListIds,
	/// List non-empty application names.
	ListApplicationNames,
	/// List every registry row.
	ListDefinitions,
	/// Launch a server without waiting for it.
	Activate {
		/// Target server.
		server_id: ServerId,
	},
	/// Stop a server and forget its runtime record.
	Shutdown {
		/// Target server.
		server_id: ServerId,
	},
	/// Run the server's install hook.
	Install {
		/// Target server.
		server_id: ServerId,
	},
	/// Run the server's uninstall hook.
	Uninstall {
		/// Target server.
		server_id: ServerId,
	},
	/// Resolve where a server listens, launching it if needed.
	Locate {
		/// Target server.
		server_id: ServerId,
		/// Endpoint type, e.g. [`CLEAR_TEXT_ENDPOINT`].
		endpoint_type: String,
	},
	/// Resolve every endpoint of one orb inside a server.
	LocatePerOrb {
		/// Target server.
		server_id: ServerId,
		/// Orb identity.
		orb_id: String,
	},
	/// List ids of servers with a live runtime record.
	ListActive,
	/// List orb ids announced by a running server.
	ListOrbIds {
		/// Target server.
		server_id: ServerId,
	},
	/// Sent by a launched server: this connection becomes its control channel.
	RegisterCallback {
		/// The announcing server.
		server_id: ServerId,
	},
	/// Sent by a launched server once its listeners are bound.
	RegisterEndpoints {
		/// The announcing server.
		server_id: ServerId,
		/// Orb identity inside the server.
		orb_id: String,
		/// Listening endpoints.
		endpoints: Vec<EndPoint>,
	},
	/// Resolve a misrouted request's routing key to a redirect.
	ResolveRoutingKey {
		/// Encoded [`RoutingKey`].
		routing_key: Vec<u8>,
	},
}

/// A response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	/// Corresponding request identifier.
	pub request_id: RequestId,
	/// Outcome of the request.
	pub result: Result<ResponsePayload, WireError>,
}

/// Response payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
	/// Reply to Ping.
	Pong,
	/// The request completed with nothing to report.
	Done,
	/// Id assigned by a registration.
	Registered {
		/// Assigned id.
		server_id: ServerId,
	},
	/// A launch definition.
	Definition(ServerDefinition),
	/// An id resolved from an application name.
	ServerId(ServerId),
	/// A list of ids.
	Ids(Vec<ServerId>),
	/// A list of names.
	Names(Vec<String>),
	/// Registry rows.
	Definitions(Vec<DefinitionEntry>),
	/// A resolved location.
	Location(ServerLocation),
	/// Endpoints of one orb.
	OrbLocation(ServerLocationPerOrb),
	/// A resolved redirect.
	Redirect(Redirect),
}

/// Error reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
	/// Stable classification.
	pub code: ErrorCode,
	/// Human readable detail.
	pub message: String,
}

impl WireError {
	/// Creates a wire error.
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}
}

impl fmt::Display for WireError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}: {}", self.code, self.message)
	}
}

impl std::error::Error for WireError {}

/// Error codes for daemon operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
	/// Unspecified internal error.
	Internal,
	/// Payload contains malformed arguments.
	InvalidArgs,
	/// No definition exists for the server id.
	NotRegistered,
	/// No definition exists for the application name.
	ServerNotFound,
	/// The application name or id is already taken.
	AlreadyRegistered,
	/// The server is already installed.
	AlreadyInstalled,
	/// The server is already uninstalled.
	AlreadyUninstalled,
	/// The server is already activated or running.
	AlreadyActive,
	/// The orb already announced its endpoints.
	AlreadyRegisteredForClient,
	/// A callback arrived while the server was not launching.
	UnexpectedRegistration,
	/// The server cannot be brought up right now.
	ServerHeldDown,
	/// No orb exposes the requested endpoint type.
	NoSuchEndPoint,
	/// The orb never announced endpoints.
	InvalidOrbId,
	/// The operation requires a running server.
	ServerNotRunning,
	/// The server process could not be spawned.
	UnableToStartProcess,
	/// Verification rejected the definition.
	InvalidDefinition,
	/// The routing key could not be decoded.
	InvalidRoutingKey,
	/// Durable storage failed.
	Storage,
	/// The server process did not answer a control command in time.
	Timeout,
}

impl ErrorCode {
	/// Transient failures are expected to clear up; callers may retry later.
	#[must_use]
	pub const fn is_transient(self) -> bool {
		matches!(self, Self::ServerHeldDown | Self::NoSuchEndPoint | Self::Timeout)
	}
}

/// A control command pushed to a server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Control {
	/// Correlation id echoed in the acknowledgment.
	pub id: ControlId,
	/// The command.
	pub command: ControlCommand,
}

/// Lifecycle hooks a server process exposes to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
	/// Run the install hook.
	Install,
	/// Run the uninstall hook.
	Uninstall,
	/// Shut down cleanly.
	Shutdown,
}

/// Acknowledgment of a [`Control`] frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlAck {
	/// Echoed correlation id.
	pub id: ControlId,
	/// Hook outcome.
	pub result: Result<(), String>,
}
