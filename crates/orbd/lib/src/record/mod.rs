//! Per-server runtime record and process supervisor.
//!
//! A [`ServerRecord`] owns the OS process of one server, its lifecycle state,
//! the endpoints each orb announced, and the relaunch bookkeeping. State lives
//! behind a synchronous lock that is never held across an await; transitions
//! are broadcast on a `watch` channel so blocked lookups wake without polling.
//! Waiters additionally re-check process liveness every poll interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use orbd_proto::{EndPoint, OrbPortInfo, ServerDefinition, ServerId, ServerState, VerifyResult};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::control::ServerControl;
use crate::error::{ActivationError, Result};
use crate::launcher::{ActivationCommand, ProcessLauncher, ServerProcess};

struct RecordInner {
	state: ServerState,
	process: Option<Box<dyn ServerProcess>>,
	endpoints: BTreeMap<String, Vec<EndPoint>>,
	retry_count: u32,
	control: Option<Arc<dyn ServerControl>>,
}

impl RecordInner {
	/// Moves to `Deactivated`, dropping endpoints and the control handle.
	/// Returns the process so the caller can stop it outside the lock.
	fn demote(&mut self) -> Option<Box<dyn ServerProcess>> {
		self.state = ServerState::Deactivated;
		self.endpoints.clear();
		self.control = None;
		self.process.take()
	}

	fn process_exited(&mut self) -> Option<Option<i32>> {
		let process = self.process.as_mut()?;
		match process.try_exit() {
			Ok(exit) => exit.map(|e| e.code),
			Err(e) => {
				warn!(error = %e, "record.try_exit_failed");
				None
			}
		}
	}

	fn ports(&self, endpoint_type: &str) -> Vec<OrbPortInfo> {
		self.endpoints
			.iter()
			.map(|(orb_id, endpoints)| OrbPortInfo {
				orb_id: orb_id.clone(),
				port: endpoints
					.iter()
					.find(|e| e.endpoint_type == endpoint_type)
					.map_or(-1, |e| i32::from(e.port)),
			})
			.collect()
	}

	fn exposes(&self, endpoint_type: &str) -> bool {
		self.endpoints
			.values()
			.flatten()
			.any(|e| e.endpoint_type == endpoint_type)
	}
}

/// Runtime record of one server id.
pub struct ServerRecord {
	server_id: ServerId,
	definition: ServerDefinition,
	config: Arc<DaemonConfig>,
	launcher: Arc<dyn ProcessLauncher>,
	inner: Mutex<RecordInner>,
	state_tx: watch::Sender<ServerState>,
}

impl std::fmt::Debug for ServerRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServerRecord")
			.field("server_id", &self.server_id)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

impl ServerRecord {
	/// Creates a record in the `Activating` state. Nothing is launched yet.
	pub fn new(
		server_id: ServerId,
		definition: ServerDefinition,
		config: Arc<DaemonConfig>,
		launcher: Arc<dyn ProcessLauncher>,
	) -> Self {
		let (state_tx, _) = watch::channel(ServerState::Activating);
		Self {
			server_id,
			definition,
			config,
			launcher,
			inner: Mutex::new(RecordInner {
				state: ServerState::Activating,
				process: None,
				endpoints: BTreeMap::new(),
				retry_count: 0,
				control: None,
			}),
			state_tx,
		}
	}

	/// Server id of this record.
	pub fn server_id(&self) -> ServerId {
		self.server_id
	}

	/// Launch definition of this record.
	pub fn definition(&self) -> &ServerDefinition {
		&self.definition
	}

	/// Current state.
	pub fn state(&self) -> ServerState {
		self.inner.lock().state
	}

	/// Consecutive unexpected exits since the last successful start.
	pub fn retry_count(&self) -> u32 {
		self.inner.lock().retry_count
	}

	/// Subscribes to state transitions.
	pub fn subscribe(&self) -> watch::Receiver<ServerState> {
		self.state_tx.subscribe()
	}

	/// Releases the lock, then broadcasts `state`.
	fn publish(&self, inner: MutexGuard<'_, RecordInner>) {
		let state = inner.state;
		drop(inner);
		self.state_tx.send_replace(state);
	}

	fn spawn_locked(&self, inner: &mut RecordInner) -> Result<()> {
		let command = ActivationCommand::new(self.server_id, &self.definition, &self.config, false);
		match self.launcher.spawn(&command) {
			Ok(process) => {
				info!(
					server_id = %self.server_id,
					pid = ?process.id(),
					retry = inner.retry_count,
					"record.launched"
				);
				inner.process = Some(process);
				inner.state = ServerState::Activated;
				Ok(())
			}
			Err(source) => {
				warn!(server_id = %self.server_id, error = %source, "record.launch_failed");
				inner.demote();
				Err(ActivationError::UnableToStartProcess {
					server_id: self.server_id,
					source,
				})
			}
		}
	}

	/// Launches the server process.
	///
	/// Valid from `Activating` and `Deactivated`; a `Deactivated` record starts
	/// over with a fresh retry budget.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyActive`] while launched or running,
	/// [`ActivationError::ServerHeldDown`] once held down, and
	/// [`ActivationError::UnableToStartProcess`] if the spawn fails (the record
	/// is left `Deactivated`).
	pub fn activate(&self) -> Result<()> {
		let mut inner = self.inner.lock();
		match inner.state {
			ServerState::Activated | ServerState::Running => return Err(ActivationError::AlreadyActive(self.server_id)),
			ServerState::HeldDown => return Err(ActivationError::ServerHeldDown(self.server_id)),
			ServerState::Deactivated => {
				inner.retry_count = 0;
				inner.state = ServerState::Activating;
			}
			ServerState::Activating => {}
		}
		let result = self.spawn_locked(&mut inner);
		self.publish(inner);
		result
	}

	/// Re-checks the process and applies the retry policy.
	///
	/// An exit while `Activated` counts as a failed start: the process is
	/// relaunched until `activation_retry_max` exits accumulated, then the
	/// record is held down. An exit while `Running` demotes the record.
	/// Returns whether the record can still reach or remain in `Running`.
	pub fn is_valid(&self) -> bool {
		let mut inner = self.inner.lock();
		let state = inner.state;
		match state {
			ServerState::Activating => true,
			ServerState::Deactivated | ServerState::HeldDown => false,
			ServerState::Running => {
				let Some(code) = inner.process_exited() else {
					return true;
				};
				info!(server_id = %self.server_id, ?code, "record.exited");
				inner.demote();
				self.publish(inner);
				false
			}
			ServerState::Activated => {
				let Some(code) = inner.process_exited() else {
					return true;
				};
				inner.process = None;
				inner.control = None;
				inner.retry_count += 1;
				if inner.retry_count >= self.config.activation_retry_max {
					warn!(
						server_id = %self.server_id,
						?code,
						retries = inner.retry_count,
						"record.held_down"
					);
					inner.endpoints.clear();
					inner.state = ServerState::HeldDown;
					self.publish(inner);
					return false;
				}
				info!(
					server_id = %self.server_id,
					?code,
					retry = inner.retry_count,
					"record.relaunching"
				);
				let valid = self.spawn_locked(&mut inner).is_ok();
				self.publish(inner);
				valid
			}
		}
	}

	/// Stores the control channel of a freshly launched process.
	///
	/// # Errors
	///
	/// [`ActivationError::UnexpectedRegistration`] unless `Activated`.
	pub fn register_callback(&self, control: Arc<dyn ServerControl>) -> Result<()> {
		let mut inner = self.inner.lock();
		if inner.state != ServerState::Activated {
			return Err(ActivationError::UnexpectedRegistration {
				server_id: self.server_id,
				state: inner.state,
			});
		}
		inner.control = Some(control);
		debug!(server_id = %self.server_id, "record.callback_registered");
		Ok(())
	}

	/// Records the endpoints of one orb. The first announcement while
	/// `Activated` makes the record `Running` and wakes blocked lookups.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyRegisteredForClient`] if the orb already
	/// announced, [`ActivationError::UnexpectedRegistration`] if the record is
	/// not launched.
	pub fn register_endpoints(&self, orb_id: &str, endpoints: Vec<EndPoint>) -> Result<()> {
		let mut inner = self.inner.lock();
		if !inner.state.is_active() {
			return Err(ActivationError::UnexpectedRegistration {
				server_id: self.server_id,
				state: inner.state,
			});
		}
		if inner.endpoints.contains_key(orb_id) {
			return Err(ActivationError::AlreadyRegisteredForClient {
				server_id: self.server_id,
				orb_id: orb_id.to_string(),
			});
		}
		inner.endpoints.insert(orb_id.to_string(), endpoints);
		info!(server_id = %self.server_id, orb_id, "record.endpoints_registered");
		if inner.state == ServerState::Activated {
			inner.state = ServerState::Running;
			inner.retry_count = 0;
			info!(server_id = %self.server_id, "record.running");
		}
		self.publish(inner);
		Ok(())
	}

	/// Waits until the server is `Running` and returns the port of
	/// `endpoint_type` for every announced orb (`-1` where absent).
	///
	/// # Errors
	///
	/// [`ActivationError::ServerHeldDown`] on timeout, or when the record is
	/// deactivated, held down, or fails its liveness check while waiting.
	pub async fn lookup(&self, endpoint_type: &str, timeout: Duration) -> Result<Vec<OrbPortInfo>> {
		let deadline = Instant::now() + timeout;
		let mut state_rx = self.state_tx.subscribe();
		loop {
			{
				let inner = self.inner.lock();
				match inner.state {
					ServerState::Running => return Ok(inner.ports(endpoint_type)),
					ServerState::Deactivated | ServerState::HeldDown => {
						return Err(ActivationError::ServerHeldDown(self.server_id));
					}
					ServerState::Activating | ServerState::Activated => {}
				}
			}
			if !self.is_valid() {
				return Err(ActivationError::ServerHeldDown(self.server_id));
			}
			let now = Instant::now();
			if now >= deadline {
				debug!(server_id = %self.server_id, "record.lookup_timeout");
				return Err(ActivationError::ServerHeldDown(self.server_id));
			}
			let wait = self.config.lookup_poll().min(deadline - now);
			let _ = tokio::time::timeout(wait, state_rx.changed()).await;
		}
	}

	/// Non-blocking check used after an explicit activation.
	///
	/// # Errors
	///
	/// [`ActivationError::NoSuchEndPoint`] if the running server has no
	/// `endpoint_type` endpoint, [`ActivationError::ServerHeldDown`] if it
	/// cannot come up.
	pub fn probe(&self, endpoint_type: &str) -> Result<()> {
		if !self.is_valid() {
			return Err(ActivationError::ServerHeldDown(self.server_id));
		}
		let inner = self.inner.lock();
		match inner.state {
			ServerState::Running if !inner.exposes(endpoint_type) => Err(ActivationError::NoSuchEndPoint {
				server_id: self.server_id,
				endpoint_type: endpoint_type.to_string(),
			}),
			ServerState::Deactivated | ServerState::HeldDown => Err(ActivationError::ServerHeldDown(self.server_id)),
			_ => Ok(()),
		}
	}

	/// Orb ids that announced endpoints.
	pub fn orb_ids(&self) -> Vec<String> {
		self.inner.lock().endpoints.keys().cloned().collect()
	}

	/// Endpoints announced by `orb_id`.
	///
	/// # Errors
	///
	/// [`ActivationError::InvalidOrbId`] if the orb never announced.
	pub fn endpoints_for(&self, orb_id: &str) -> Result<Vec<EndPoint>> {
		self.inner
			.lock()
			.endpoints
			.get(orb_id)
			.cloned()
			.ok_or_else(|| ActivationError::InvalidOrbId {
				server_id: self.server_id,
				orb_id: orb_id.to_string(),
			})
	}

	/// Demotes a `Running` record whose process exited without a
	/// [`Self::destroy`]. Returns whether it was demoted.
	pub fn check_process_health(&self) -> bool {
		let mut inner = self.inner.lock();
		if inner.state != ServerState::Running {
			return false;
		}
		let Some(code) = inner.process_exited() else {
			return false;
		};
		warn!(server_id = %self.server_id, ?code, "record.died");
		inner.demote();
		self.publish(inner);
		true
	}

	fn running_control(&self) -> Result<Arc<dyn ServerControl>> {
		let inner = self.inner.lock();
		if inner.state != ServerState::Running {
			return Err(ActivationError::ServerNotRunning(self.server_id));
		}
		inner.control.clone().ok_or_else(|| ActivationError::ControlFailed {
			server_id: self.server_id,
			message: "no control channel registered".to_string(),
		})
	}

	/// Runs the install hook of the running server.
	///
	/// # Errors
	///
	/// [`ActivationError::ServerNotRunning`] unless `Running`,
	/// [`ActivationError::ControlFailed`] if the hook fails or times out.
	pub async fn install(&self) -> Result<()> {
		let control = self.running_control()?;
		match tokio::time::timeout(self.config.control_timeout(), control.install()).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(message)) => Err(ActivationError::ControlFailed {
				server_id: self.server_id,
				message,
			}),
			Err(_) => Err(ActivationError::ControlFailed {
				server_id: self.server_id,
				message: "install timed out".to_string(),
			}),
		}
	}

	/// Runs the uninstall hook, then demotes and force-kills the server.
	///
	/// # Errors
	///
	/// [`ActivationError::ServerNotRunning`] unless `Running`. A failing hook
	/// is reported as [`ActivationError::ControlFailed`] after the process has
	/// been stopped.
	pub async fn uninstall(&self) -> Result<()> {
		let control = self.running_control()?;
		let hook = tokio::time::timeout(self.config.control_timeout(), control.uninstall()).await;

		let mut inner = self.inner.lock();
		let process = inner.demote();
		self.publish(inner);
		self.kill(process);

		match hook {
			Ok(Ok(())) => Ok(()),
			Ok(Err(message)) => Err(ActivationError::ControlFailed {
				server_id: self.server_id,
				message,
			}),
			Err(_) => Err(ActivationError::ControlFailed {
				server_id: self.server_id,
				message: "uninstall timed out".to_string(),
			}),
		}
	}

	/// Stops the server: demotes first, asks the process to shut down through
	/// its control channel, and kills it if it does not exit in time. Failures
	/// are logged, never returned.
	pub async fn destroy(&self) {
		let (control, process) = {
			let mut inner = self.inner.lock();
			let control = inner.control.clone();
			let process = inner.demote();
			self.publish(inner);
			(control, process)
		};
		info!(server_id = %self.server_id, "record.destroying");

		let Some(mut process) = process else {
			return;
		};
		let timeout = self.config.control_timeout();
		if let Some(control) = control {
			match tokio::time::timeout(timeout, control.shutdown()).await {
				Ok(Ok(())) => {
					if tokio::time::timeout(timeout, process.wait()).await.is_ok() {
						return;
					}
				}
				Ok(Err(message)) => {
					warn!(server_id = %self.server_id, %message, "record.shutdown_failed");
				}
				Err(_) => {
					warn!(server_id = %self.server_id, "record.shutdown_timeout");
				}
			}
		}
		self.kill(Some(process));
	}

	fn kill(&self, process: Option<Box<dyn ServerProcess>>) {
		if let Some(mut process) = process {
			if let Err(e) = process.start_kill() {
				warn!(server_id = %self.server_id, error = %e, "record.kill_failed");
			}
		}
	}

	/// Launches the definition in verify-only mode and maps its exit code.
	///
	/// # Errors
	///
	/// See [`verify`].
	pub async fn verify(&self) -> Result<VerifyResult> {
		verify(self.launcher.as_ref(), &self.config, self.server_id, &self.definition).await
	}
}

/// Launches `definition` in verify-only mode and waits for it to exit.
///
/// A missing program maps to [`VerifyResult::MainNotFound`]; exit codes map
/// through [`VerifyResult::from_exit_code`].
///
/// # Errors
///
/// [`ActivationError::UnableToStartProcess`] for spawn failures other than a
/// missing program, or when waiting on the process fails.
pub async fn verify(
	launcher: &dyn ProcessLauncher,
	config: &DaemonConfig,
	server_id: ServerId,
	definition: &ServerDefinition,
) -> Result<VerifyResult> {
	let command = ActivationCommand::new(server_id, definition, config, true);
	let mut process = match launcher.spawn(&command) {
		Ok(process) => process,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VerifyResult::MainNotFound),
		Err(source) => return Err(ActivationError::UnableToStartProcess { server_id, source }),
	};
	let exit = process
		.wait()
		.await
		.map_err(|source| ActivationError::UnableToStartProcess { server_id, source })?;
	let result = VerifyResult::from_exit_code(exit.code);
	info!(server_id = %server_id, code = ?exit.code, %result, "record.verified");
	Ok(result)
}

#[cfg(test)]
mod tests;
