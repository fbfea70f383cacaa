//! Server process launcher abstraction for production and testing.
//!
//! Records never touch `tokio::process` directly: they spawn through a
//! [`ProcessLauncher`] and observe liveness through the returned
//! [`ServerProcess`], so tests can substitute in-memory fakes.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use orbd_proto::{ServerDefinition, ServerId};

use crate::config::DaemonConfig;

/// Environment variables set for every launched server process.
pub mod env_vars {
	/// Id of the launched server.
	pub const SERVER_ID: &str = "ORBD_SERVER_ID";
	/// Entry point label from the definition.
	pub const SERVER_NAME: &str = "ORBD_SERVER_NAME";
	/// Always `1`; marks a process as launched by the daemon.
	pub const ACTIVATED: &str = "ORBD_ACTIVATED";
	/// `1` when the process should only verify its definition and exit.
	pub const VERIFY: &str = "ORBD_VERIFY";
	/// Daemon data directory.
	pub const DATA_DIR: &str = "ORBD_DATA_DIR";
	/// Bootstrap host of the daemon.
	pub const BOOTSTRAP_HOST: &str = "ORBD_BOOTSTRAP_HOST";
	/// Bootstrap port of the daemon.
	pub const BOOTSTRAP_PORT: &str = "ORBD_BOOTSTRAP_PORT";
	/// Control socket the process calls back on.
	pub const SOCKET: &str = "ORBD_SOCKET";
}

/// Fully resolved command line and environment for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationCommand {
	/// Launched server.
	pub server_id: ServerId,
	/// Program to execute: the runtime if configured, else the executable.
	pub program: PathBuf,
	/// Arguments after the program.
	pub args: Vec<String>,
	/// Extra environment.
	pub env: Vec<(String, String)>,
	/// Directory receiving stdout/stderr logs.
	pub log_dir: PathBuf,
	/// Verify-only launch.
	pub verify: bool,
}

impl ActivationCommand {
	/// Builds the launch command of `definition`.
	///
	/// With a configured runtime the command line is
	/// `runtime vm_args... executable args...`; without one the executable is
	/// launched directly with `vm_args... args...`.
	pub fn new(server_id: ServerId, definition: &ServerDefinition, config: &DaemonConfig, verify: bool) -> Self {
		let mut args: Vec<String> = definition.vm_arg_list().map(str::to_string).collect();
		let program = match &config.runtime {
			Some(runtime) => {
				args.push(definition.executable_path.clone());
				runtime.clone()
			}
			None => PathBuf::from(&definition.executable_path),
		};
		args.extend(definition.arg_list().map(str::to_string));

		let env = vec![
			(env_vars::SERVER_ID.to_string(), server_id.to_string()),
			(env_vars::SERVER_NAME.to_string(), definition.server_name.clone()),
			(env_vars::ACTIVATED.to_string(), "1".to_string()),
			(env_vars::VERIFY.to_string(), if verify { "1" } else { "0" }.to_string()),
			(env_vars::DATA_DIR.to_string(), config.data_dir.display().to_string()),
			(env_vars::BOOTSTRAP_HOST.to_string(), config.bootstrap_host.clone()),
			(env_vars::BOOTSTRAP_PORT.to_string(), config.bootstrap_port.to_string()),
			(env_vars::SOCKET.to_string(), config.socket_path.display().to_string()),
		];

		Self {
			server_id,
			program,
			args,
			env,
			log_dir: config.log_dir(),
			verify,
		}
	}
}

/// Exit status of a server process. `code` is `None` for death by signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
	/// Exit code, if the process exited normally.
	pub code: Option<i32>,
}

/// Handle to a spawned server process, exclusively owned by its record.
#[async_trait]
pub trait ServerProcess: Send + Sync + 'static {
	/// OS process id, if still known.
	fn id(&self) -> Option<u32>;

	/// Non-blocking liveness check: `Some` once the process has exited.
	fn try_exit(&mut self) -> io::Result<Option<ProcessExit>>;

	/// Sends a kill signal without waiting for the process to exit.
	fn start_kill(&mut self) -> io::Result<()>;

	/// Waits for the process to exit.
	async fn wait(&mut self) -> io::Result<ProcessExit>;
}

/// Spawns server processes.
///
/// This abstraction allows the daemon to launch real subprocesses in
/// production and in-memory fakes in tests.
pub trait ProcessLauncher: Send + Sync + 'static {
	/// Spawns `command`. Spawning is synchronous and not cancellable.
	///
	/// # Errors
	///
	/// Returns the OS error when the process cannot be spawned.
	fn spawn(&self, command: &ActivationCommand) -> io::Result<Box<dyn ServerProcess>>;
}

/// Production launcher backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct OsLauncher;

impl OsLauncher {
	/// Creates a launcher that spawns real processes.
	#[must_use]
	pub fn new() -> Self {
		Self
	}
}

impl ProcessLauncher for OsLauncher {
	fn spawn(&self, command: &ActivationCommand) -> io::Result<Box<dyn ServerProcess>> {
		std::fs::create_dir_all(&command.log_dir)?;
		let stem = if command.verify {
			format!("{}.verify", command.server_id)
		} else {
			command.server_id.to_string()
		};
		let log = |ext: &str| {
			OpenOptions::new()
				.create(true)
				.append(true)
				.open(command.log_dir.join(format!("{stem}.{ext}")))
		};

		let child = tokio::process::Command::new(&command.program)
			.args(&command.args)
			.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
			.stdin(Stdio::null())
			.stdout(Stdio::from(log("out")?))
			.stderr(Stdio::from(log("err")?))
			.spawn()?;

		tracing::debug!(
			server_id = %command.server_id,
			pid = ?child.id(),
			program = %command.program.display(),
			verify = command.verify,
			"launcher.spawned"
		);
		Ok(Box::new(OsProcess { child }))
	}
}

struct OsProcess {
	child: tokio::process::Child,
}

#[async_trait]
impl ServerProcess for OsProcess {
	fn id(&self) -> Option<u32> {
		self.child.id()
	}

	fn try_exit(&mut self) -> io::Result<Option<ProcessExit>> {
		Ok(self.child.try_wait()?.map(|status| ProcessExit { code: status.code() }))
	}

	fn start_kill(&mut self) -> io::Result<()> {
		match self.child.start_kill() {
			Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
			other => other,
		}
	}

	async fn wait(&mut self) -> io::Result<ProcessExit> {
		let status = self.child.wait().await?;
		Ok(ProcessExit { code: status.code() })
	}
}

/// In-memory launcher for tests.
#[doc(hidden)]
pub mod test_helpers {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU32, Ordering};

	use parking_lot::Mutex;
	use tokio::sync::watch;

	use super::*;

	/// Control side of one fake process.
	#[derive(Clone)]
	pub struct FakeHandle {
		/// Fake pid.
		pub pid: u32,
		/// The command it was spawned with.
		pub command: ActivationCommand,
		exit: Arc<watch::Sender<Option<ProcessExit>>>,
		killed: Arc<Mutex<bool>>,
	}

	impl FakeHandle {
		/// Simulates the process exiting with `code`.
		pub fn exit(&self, code: Option<i32>) {
			self.exit.send_replace(Some(ProcessExit { code }));
		}

		/// True once the process exited.
		pub fn has_exited(&self) -> bool {
			self.exit.borrow().is_some()
		}

		/// True if the owner killed the process.
		pub fn was_killed(&self) -> bool {
			*self.killed.lock()
		}
	}

	struct FakeProcess {
		pid: u32,
		exit: Arc<watch::Sender<Option<ProcessExit>>>,
		killed: Arc<Mutex<bool>>,
	}

	#[async_trait]
	impl ServerProcess for FakeProcess {
		fn id(&self) -> Option<u32> {
			Some(self.pid)
		}

		fn try_exit(&mut self) -> io::Result<Option<ProcessExit>> {
			Ok(*self.exit.borrow())
		}

		fn start_kill(&mut self) -> io::Result<()> {
			*self.killed.lock() = true;
			self.exit.send_if_modified(|exit| {
				if exit.is_none() {
					*exit = Some(ProcessExit { code: None });
					true
				} else {
					false
				}
			});
			Ok(())
		}

		async fn wait(&mut self) -> io::Result<ProcessExit> {
			let mut rx = self.exit.subscribe();
			let exit = *rx
				.wait_for(Option::is_some)
				.await
				.map_err(|_| io::Error::other("fake process handle dropped"))?;
			exit.ok_or_else(|| io::Error::other("fake process exit missing"))
		}
	}

	#[derive(Default)]
	struct FakeState {
		spawned: Vec<FakeHandle>,
		verified: Vec<ActivationCommand>,
		fail_spawn: Option<io::ErrorKind>,
		verify_exit: Option<Option<i32>>,
	}

	/// Launcher that records spawns and hands out controllable fake processes.
	///
	/// Verify launches exit immediately with the configured code (default `0`).
	#[derive(Clone, Default)]
	pub struct FakeLauncher {
		state: Arc<Mutex<FakeState>>,
		next_pid: Arc<AtomicU32>,
	}

	impl FakeLauncher {
		/// Creates a launcher whose spawns succeed.
		#[must_use]
		pub fn new() -> Self {
			Self::default()
		}

		/// Makes subsequent spawns fail with `kind` (or succeed with `None`).
		pub fn fail_spawns(&self, kind: Option<io::ErrorKind>) {
			self.state.lock().fail_spawn = kind;
		}

		/// Exit code reported by verify launches; `None` simulates a signal.
		pub fn set_verify_exit(&self, code: Option<i32>) {
			self.state.lock().verify_exit = Some(code);
		}

		/// Number of non-verify spawns for `server_id`.
		pub fn spawn_count(&self, server_id: ServerId) -> usize {
			self.state
				.lock()
				.spawned
				.iter()
				.filter(|h| h.command.server_id == server_id)
				.count()
		}

		/// Number of verify launches.
		pub fn verify_count(&self) -> usize {
			self.state.lock().verified.len()
		}

		/// Most recent non-verify process of `server_id`.
		pub fn latest(&self, server_id: ServerId) -> Option<FakeHandle> {
			self.state
				.lock()
				.spawned
				.iter()
				.rev()
				.find(|h| h.command.server_id == server_id)
				.cloned()
		}

		/// Simulates the most recent process of `server_id` exiting.
		pub fn exit_latest(&self, server_id: ServerId, code: Option<i32>) {
			if let Some(handle) = self.latest(server_id) {
				handle.exit(code);
			}
		}
	}

	impl ProcessLauncher for FakeLauncher {
		fn spawn(&self, command: &ActivationCommand) -> io::Result<Box<dyn ServerProcess>> {
			let mut state = self.state.lock();
			if let Some(kind) = state.fail_spawn {
				return Err(io::Error::from(kind));
			}
			let pid = self.next_pid.fetch_add(1, Ordering::Relaxed) + 1000;
			let exit = Arc::new(watch::channel(None).0);
			let killed = Arc::new(Mutex::new(false));
			if command.verify {
				state.verified.push(command.clone());
				exit.send_replace(Some(ProcessExit {
					code: state.verify_exit.unwrap_or(Some(0)),
				}));
			} else {
				state.spawned.push(FakeHandle {
					pid,
					command: command.clone(),
					exit: exit.clone(),
					killed: killed.clone(),
				});
			}
			Ok(Box::new(FakeProcess { pid, exit, killed }))
		}
	}
}
