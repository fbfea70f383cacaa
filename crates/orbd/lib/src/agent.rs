//! Server-side helper for processes launched by the daemon.
//!
//! A launched process reads its [`ActivationEnv`], connects back with
//! [`ServerAgent::connect`] (which registers its control channel), announces
//! the endpoints of each orb once its listeners are bound, and from then on
//! answers lifecycle commands through the [`ServerControl`] hooks it supplied.
//! In verify mode the process should skip all of that and exit with
//! [`VerifyResult::exit_code`](orbd_proto::VerifyResult::exit_code).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use orbd_proto::{
	ControlAck, ControlCommand, EndPoint, Frame, FrameError, Request, RequestId, RequestPayload, ResponsePayload,
	ServerId, WireError, read_frame, write_frame,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::control::ServerControl;
use crate::ipc::WireResult;
use crate::launcher::env_vars;

/// Errors of the server agent.
#[derive(Debug, Error)]
pub enum AgentError {
	/// A launch variable is missing or malformed.
	#[error("invalid launch environment: {var}: {reason}")]
	Env {
		/// Variable name.
		var: &'static str,
		/// What is wrong with it.
		reason: String,
	},
	/// Connecting to the daemon failed.
	#[error("cannot connect to daemon: {0}")]
	Connect(#[source] std::io::Error),
	/// Framing failed.
	#[error(transparent)]
	Frame(#[from] FrameError),
	/// The daemon rejected a request.
	#[error("{0}")]
	Remote(WireError),
	/// The daemon closed the connection.
	#[error("connection closed by daemon")]
	Closed,
}

/// Launch parameters the daemon passes to a server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationEnv {
	/// Id of this server.
	pub server_id: ServerId,
	/// Entry point label.
	pub server_name: String,
	/// Verify-only launch.
	pub verify: bool,
	/// Daemon data directory.
	pub data_dir: PathBuf,
	/// Daemon bootstrap host.
	pub bootstrap_host: String,
	/// Daemon bootstrap port.
	pub bootstrap_port: u16,
	/// Control socket to call back on.
	pub socket_path: PathBuf,
}

impl ActivationEnv {
	/// Reads the launch environment of the current process. Returns `None`
	/// when the process was not launched by the daemon.
	///
	/// # Errors
	///
	/// [`AgentError::Env`] if a variable is present but malformed.
	pub fn from_env() -> Result<Option<Self>, AgentError> {
		Self::from_vars(|key| std::env::var(key).ok())
	}

	/// Reads the launch environment through `var`.
	///
	/// # Errors
	///
	/// [`AgentError::Env`] if a variable is missing or malformed.
	pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, AgentError> {
		if var(env_vars::ACTIVATED).as_deref() != Some("1") {
			return Ok(None);
		}
		let required = |key: &'static str| {
			var(key).ok_or_else(|| AgentError::Env {
				var: key,
				reason: "missing".to_string(),
			})
		};
		let server_id = required(env_vars::SERVER_ID)?
			.parse::<u32>()
			.map_err(|e| AgentError::Env {
				var: env_vars::SERVER_ID,
				reason: e.to_string(),
			})?;
		let bootstrap_port = required(env_vars::BOOTSTRAP_PORT)?
			.parse::<u16>()
			.map_err(|e| AgentError::Env {
				var: env_vars::BOOTSTRAP_PORT,
				reason: e.to_string(),
			})?;
		Ok(Some(Self {
			server_id: ServerId(server_id),
			server_name: var(env_vars::SERVER_NAME).unwrap_or_default(),
			verify: var(env_vars::VERIFY).as_deref() == Some("1"),
			data_dir: PathBuf::from(required(env_vars::DATA_DIR)?),
			bootstrap_host: required(env_vars::BOOTSTRAP_HOST)?,
			bootstrap_port,
			socket_path: PathBuf::from(required(env_vars::SOCKET)?),
		}))
	}
}

type PendingResponses = Arc<Mutex<HashMap<RequestId, oneshot::Sender<WireResult>>>>;

/// Connection of a launched server to its daemon.
pub struct ServerAgent {
	server_id: ServerId,
	frames: mpsc::UnboundedSender<Frame>,
	pending: PendingResponses,
	next_id: AtomicU64,
	stopped: CancellationToken,
}

impl std::fmt::Debug for ServerAgent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServerAgent")
			.field("server_id", &self.server_id)
			.finish_non_exhaustive()
	}
}

impl ServerAgent {
	/// Connects to the daemon named by `env` and registers `hooks` as this
	/// server's control channel.
	///
	/// # Errors
	///
	/// Connection failures, or the daemon refusing the registration.
	pub async fn connect(env: &ActivationEnv, hooks: Arc<dyn ServerControl>) -> Result<Self, AgentError> {
		let stream = UnixStream::connect(&env.socket_path)
			.await
			.map_err(AgentError::Connect)?;
		Self::attach(stream, env.server_id, hooks).await
	}

	/// Registers `hooks` over an already connected stream.
	///
	/// # Errors
	///
	/// As [`Self::connect`].
	pub async fn attach(stream: UnixStream, server_id: ServerId, hooks: Arc<dyn ServerControl>) -> Result<Self, AgentError> {
		let (mut reader, mut writer) = stream.into_split();
		let (frames, mut outbox) = mpsc::unbounded_channel::<Frame>();
		let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));
		let stopped = CancellationToken::new();

		tokio::spawn({
			let stopped = stopped.clone();
			async move {
				loop {
					let frame = tokio::select! {
						biased;
						frame = outbox.recv() => frame,
						() = stopped.cancelled() => None,
					};
					let Some(frame) = frame else { break };
					if let Err(e) = write_frame(&mut writer, &frame).await {
						tracing::debug!(error = %e, "agent.write_failed");
						break;
					}
				}
			}
		});

		tokio::spawn({
			let frames = frames.clone();
			let pending = pending.clone();
			let stopped = stopped.clone();
			async move {
				loop {
					match read_frame(&mut reader).await {
						Ok(Some(Frame::Response(response))) => {
							if let Some(tx) = pending.lock().remove(&response.request_id) {
								let _ = tx.send(response.result);
							}
						}
						Ok(Some(Frame::Control(control))) => {
							let result = match control.command {
								ControlCommand::Install => hooks.install().await,
								ControlCommand::Uninstall => hooks.uninstall().await,
								ControlCommand::Shutdown => hooks.shutdown().await,
							};
							let stop = control.command == ControlCommand::Shutdown && result.is_ok();
							let _ = frames.send(Frame::ControlAck(ControlAck {
								id: control.id,
								result,
							}));
							if stop {
								tracing::info!(server_id = %server_id, "agent.shutdown_requested");
								break;
							}
						}
						Ok(Some(other)) => tracing::warn!(frame = ?other, "agent.unexpected_frame"),
						Ok(None) => break,
						Err(e) => {
							tracing::warn!(error = %e, "agent.read_failed");
							break;
						}
					}
				}
				pending.lock().clear();
				stopped.cancel();
			}
		});

		let agent = Self {
			server_id,
			frames,
			pending,
			next_id: AtomicU64::new(1),
			stopped,
		};
		agent.request(RequestPayload::RegisterCallback { server_id }).await?;
		tracing::info!(server_id = %server_id, "agent.registered");
		Ok(agent)
	}

	async fn request(&self, payload: RequestPayload) -> Result<ResponsePayload, AgentError> {
		let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		if self.frames.send(Frame::Request(Request { id, payload })).is_err() {
			self.pending.lock().remove(&id);
			return Err(AgentError::Closed);
		}
		rx.await.map_err(|_| AgentError::Closed)?.map_err(AgentError::Remote)
	}

	/// Id of this server.
	pub fn server_id(&self) -> ServerId {
		self.server_id
	}

	/// Announces the endpoints of one orb. The first announcement makes the
	/// server reachable.
	///
	/// # Errors
	///
	/// [`AgentError::Remote`] if the daemon rejects the announcement.
	pub async fn announce(&self, orb_id: &str, endpoints: Vec<EndPoint>) -> Result<(), AgentError> {
		self.request(RequestPayload::RegisterEndpoints {
			server_id: self.server_id,
			orb_id: orb_id.to_string(),
			endpoints,
		})
		.await
		.map(drop)
	}

	/// Completes once the daemon asked this server to shut down or the
	/// connection closed.
	pub async fn stopped(&self) {
		self.stopped.cancelled().await;
	}
}
