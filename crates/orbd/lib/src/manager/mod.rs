//! Activation manager.
//!
//! The façade used by the control socket and the transport layer. It resolves
//! server ids to runtime records (creating and launching them on first use),
//! answers location queries by blocking until the server announced its
//! endpoints, accepts those announcements, and turns misrouted requests into
//! redirects.

use std::sync::Arc;

use orbd_proto::{
	CLEAR_TEXT_ENDPOINT, EndPoint, ObjectRef, OrbPortInfo, Redirect, RequestId, RoutingKey, ServerDefinition, ServerId,
	ServerLocation, ServerLocationPerOrb, ServerState, VerifyResult,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::control::ServerControl;
use crate::error::{ActivationError, Result};
use crate::launcher::ProcessLauncher;
use crate::monitor::{HealthMonitor, ServerTable};
use crate::record::{self, ServerRecord};
use crate::registry::ServerRegistry;
use crate::transport::RedirectSink;

/// A record fetched through [`ActivationManager::entry`].
struct Entry {
	record: Arc<ServerRecord>,
	/// State before this call touched the record.
	before: ServerState,
	/// Whether this call performed the launch.
	launched: bool,
}

/// Activates, locates, and supervises registered servers.
pub struct ActivationManager {
	registry: Arc<ServerRegistry>,
	config: Arc<DaemonConfig>,
	launcher: Arc<dyn ProcessLauncher>,
	table: Arc<ServerTable>,
	monitor: Mutex<Option<HealthMonitor>>,
}

impl std::fmt::Debug for ActivationManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActivationManager")
			.field("registry", &self.registry.path())
			.field("table", &self.table)
			.finish_non_exhaustive()
	}
}

impl ActivationManager {
	/// Creates the manager and starts its health monitor on the current runtime.
	pub fn new(
		registry: Arc<ServerRegistry>,
		config: Arc<DaemonConfig>,
		launcher: Arc<dyn ProcessLauncher>,
	) -> Arc<Self> {
		let table = Arc::new(ServerTable::new());
		let monitor = HealthMonitor::spawn(table.clone(), config.monitor_interval());
		Arc::new(Self {
			registry,
			config,
			launcher,
			table,
			monitor: Mutex::new(Some(monitor)),
		})
	}

	/// The durable registry.
	pub fn registry(&self) -> &ServerRegistry {
		&self.registry
	}

	/// The daemon configuration.
	pub fn config(&self) -> &DaemonConfig {
		&self.config
	}

	/// The runtime record of `server_id`, if one exists.
	pub fn record(&self, server_id: ServerId) -> Option<Arc<ServerRecord>> {
		self.table.get(server_id)
	}

	/// Fetches or creates the record of `server_id` and launches it if it is
	/// new or deactivated.
	fn entry(&self, server_id: ServerId) -> Result<Entry> {
		let record = self.table.get_or_try_insert(server_id, || {
			let definition = self.registry.get(server_id)?;
			debug!(server_id = %server_id, "manager.record_created");
			Ok::<_, ActivationError>(ServerRecord::new(
				server_id,
				definition,
				self.config.clone(),
				self.launcher.clone(),
			))
		})?;
		let before = record.state();
		let mut launched = false;
		if matches!(before, ServerState::Activating | ServerState::Deactivated) {
			match record.activate() {
				Ok(()) => launched = true,
				Err(ActivationError::AlreadyActive(_)) => {}
				Err(e) => return Err(e),
			}
		}
		Ok(Entry {
			record,
			before,
			launched,
		})
	}

	/// Launches a server without waiting for it to come up.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyActive`] when launched or running,
	/// [`ActivationError::ServerHeldDown`] when held down,
	/// [`ActivationError::NotRegistered`] for unknown ids, and spawn failures.
	pub fn activate(&self, server_id: ServerId) -> Result<()> {
		if let Some(record) = self.table.get(server_id) {
			match record.state() {
				ServerState::Activated | ServerState::Running => {
					return Err(ActivationError::AlreadyActive(server_id));
				}
				ServerState::HeldDown => return Err(ActivationError::ServerHeldDown(server_id)),
				ServerState::Activating | ServerState::Deactivated => {}
			}
		}
		let Entry { record, launched, .. } = self.entry(server_id)?;
		// a concurrent caller won the launch
		if !launched {
			return Err(match record.state() {
				ServerState::HeldDown => ActivationError::ServerHeldDown(server_id),
				_ => ActivationError::AlreadyActive(server_id),
			});
		}
		match record.probe(CLEAR_TEXT_ENDPOINT) {
			Ok(()) | Err(ActivationError::NoSuchEndPoint { .. }) => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// Resolves where `server_id` listens for `endpoint_type`, launching it
	/// and waiting for its announcement if needed.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`], [`ActivationError::ServerHeldDown`]
	/// (including lookup timeout), [`ActivationError::NoSuchEndPoint`] when no
	/// orb exposes the type, and spawn failures.
	pub async fn locate_server(&self, server_id: ServerId, endpoint_type: &str) -> Result<ServerLocation> {
		let record = self.entry(server_id)?.record;
		self.locate_record(&record, endpoint_type).await
	}

	async fn locate_record(&self, record: &ServerRecord, endpoint_type: &str) -> Result<ServerLocation> {
		let ports = record.lookup(endpoint_type, self.config.lookup_timeout()).await?;
		if ports.iter().all(|p| p.port().is_none()) {
			return Err(ActivationError::NoSuchEndPoint {
				server_id: record.server_id(),
				endpoint_type: endpoint_type.to_string(),
			});
		}
		Ok(ServerLocation {
			host: self.config.bootstrap_host.clone(),
			ports,
		})
	}

	/// Resolves every endpoint one orb of `server_id` announced.
	///
	/// # Errors
	///
	/// As [`Self::locate_server`], plus [`ActivationError::InvalidOrbId`].
	pub async fn locate_server_for_orb(&self, server_id: ServerId, orb_id: &str) -> Result<ServerLocationPerOrb> {
		let record = self.entry(server_id)?.record;
		record.lookup(CLEAR_TEXT_ENDPOINT, self.config.lookup_timeout()).await?;
		Ok(ServerLocationPerOrb {
			host: self.config.bootstrap_host.clone(),
			endpoints: record.endpoints_for(orb_id)?,
		})
	}

	/// Stores the control channel of a launched server.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`] without a record, otherwise as
	/// [`ServerRecord::register_callback`].
	pub fn register_callback(&self, server_id: ServerId, control: Arc<dyn ServerControl>) -> Result<()> {
		self.table
			.get(server_id)
			.ok_or(ActivationError::NotRegistered(server_id))?
			.register_callback(control)
	}

	/// Accepts the endpoint announcement of a launched server.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`] without a record, otherwise as
	/// [`ServerRecord::register_endpoints`].
	pub fn register_endpoint_callback(&self, server_id: ServerId, orb_id: &str, endpoints: Vec<EndPoint>) -> Result<()> {
		self.table
			.get(server_id)
			.ok_or(ActivationError::NotRegistered(server_id))?
			.register_endpoints(orb_id, endpoints)
	}

	/// Resolves the server named by `routing_key` and returns a redirect to
	/// the clear-text port of its orb. Waits the settle delay if the server
	/// was not already running.
	///
	/// # Errors
	///
	/// Location failures as [`Self::locate_server`];
	/// [`ActivationError::InvalidOrbId`] when the orb has no clear-text port.
	pub async fn handle_misrouted_request(&self, routing_key: &RoutingKey) -> Result<Redirect> {
		let server_id = routing_key.server_id;
		let Entry { record, before, .. } = self.entry(server_id)?;
		let location = self.locate_record(&record, CLEAR_TEXT_ENDPOINT).await?;
		if before != ServerState::Running {
			tokio::time::sleep(self.config.server_startup_delay()).await;
		}
		let port = location
			.ports
			.iter()
			.find(|p| p.orb_id == routing_key.orb_id)
			.and_then(OrbPortInfo::port)
			.ok_or_else(|| ActivationError::InvalidOrbId {
				server_id,
				orb_id: routing_key.orb_id.clone(),
			})?;
		debug!(server_id = %server_id, orb_id = %routing_key.orb_id, port, "manager.redirect");
		Ok(Redirect {
			target: ObjectRef {
				host: location.host,
				port,
				routing_key: routing_key.clone(),
			},
		})
	}

	/// Decodes an encoded routing key and resolves it to a redirect.
	///
	/// # Errors
	///
	/// [`ActivationError::InvalidRoutingKey`] for malformed keys, otherwise as
	/// [`Self::handle_misrouted_request`].
	pub async fn resolve_routing_key(&self, bytes: &[u8]) -> Result<Redirect> {
		let key = RoutingKey::decode(bytes)?;
		self.handle_misrouted_request(&key).await
	}

	/// Resolves a misrouted request and hands the redirect to the transport.
	///
	/// # Errors
	///
	/// As [`Self::handle_misrouted_request`]; nothing is delivered on failure.
	pub async fn forward_misrouted(
		&self,
		request_id: RequestId,
		routing_key: &RoutingKey,
		sink: &dyn RedirectSink,
	) -> Result<()> {
		let redirect = self.handle_misrouted_request(routing_key).await?;
		sink.deliver_redirect(request_id, redirect).await;
		Ok(())
	}

	/// Ids of records that are launching or running, ascending.
	pub fn active_server_ids(&self) -> Vec<ServerId> {
		let mut ids: Vec<ServerId> = self
			.table
			.snapshot()
			.into_iter()
			.filter(|record| record.is_valid())
			.map(|record| record.server_id())
			.collect();
		ids.sort_unstable();
		ids
	}

	/// Orb ids a running server announced.
	///
	/// # Errors
	///
	/// [`ActivationError::ServerNotRunning`] unless the server is running.
	pub fn orb_ids(&self, server_id: ServerId) -> Result<Vec<String>> {
		match self.table.get(server_id) {
			Some(record) if record.state() == ServerState::Running => Ok(record.orb_ids()),
			_ => Err(ActivationError::ServerNotRunning(server_id)),
		}
	}

	/// Stops a server and forgets its runtime record. The next resolution
	/// starts from a fresh record, which also clears a held-down state.
	///
	/// # Errors
	///
	/// [`ActivationError::ServerNotRunning`] if there is no record,
	/// [`ActivationError::NotRegistered`] if the id is unknown.
	pub async fn shutdown(&self, server_id: ServerId) -> Result<()> {
		let Some(record) = self.table.remove(server_id) else {
			self.registry.get(server_id)?;
			return Err(ActivationError::ServerNotRunning(server_id));
		};
		info!(server_id = %server_id, state = %record.state(), "manager.shutdown");
		record.destroy().await;
		Ok(())
	}

	/// Runs the install hook of a server, launching it if needed, then marks it
	/// installed.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyInstalled`], location failures, and hook
	/// failures.
	pub async fn install(&self, server_id: ServerId) -> Result<()> {
		if self.registry.is_installed(server_id)? {
			return Err(ActivationError::AlreadyInstalled(server_id));
		}
		let record = self.entry(server_id)?.record;
		record.lookup(CLEAR_TEXT_ENDPOINT, self.config.lookup_timeout()).await?;
		record.install().await?;
		self.registry.install(server_id)
	}

	/// Runs the uninstall hook of a server, stops it, and marks it uninstalled.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyUninstalled`], location failures, and hook
	/// failures (the server is stopped regardless).
	pub async fn uninstall(&self, server_id: ServerId) -> Result<()> {
		if !self.registry.is_installed(server_id)? {
			return Err(ActivationError::AlreadyUninstalled(server_id));
		}
		let record = self.entry(server_id)?.record;
		record.lookup(CLEAR_TEXT_ENDPOINT, self.config.lookup_timeout()).await?;
		record.uninstall().await?;
		self.registry.uninstall(server_id)
	}

	/// Registers a definition, verifying it first when enabled.
	///
	/// # Errors
	///
	/// [`ActivationError::InvalidDefinition`] when verification fails,
	/// otherwise as [`ServerRegistry::register`].
	pub async fn register_server(&self, definition: ServerDefinition, explicit_id: Option<ServerId>) -> Result<ServerId> {
		if let Ok(existing) = self.registry.get_server_id(&definition.application_name) {
			return Err(ActivationError::AlreadyRegistered {
				application: definition.application_name,
				existing,
			});
		}
		if self.config.verify_on_register {
			let probe_id = explicit_id.unwrap_or(ServerId(0));
			let result = record::verify(self.launcher.as_ref(), &self.config, probe_id, &definition).await?;
			if result != VerifyResult::Ok {
				warn!(application = %definition.application_name, %result, "manager.verify_rejected");
				return Err(ActivationError::InvalidDefinition {
					application: definition.application_name,
					result,
				});
			}
		}
		self.registry.register(definition, explicit_id)
	}

	/// Stops a server if it has a record, then removes its definition.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`] if the id is unknown.
	pub async fn unregister_server(&self, server_id: ServerId) -> Result<()> {
		if let Some(record) = self.table.remove(server_id) {
			record.destroy().await;
		}
		self.registry.unregister(server_id)
	}

	/// Registers the configured system servers under their reserved ids.
	/// A failing entry is logged and skipped. Returns the number registered.
	pub fn install_system_servers(&self) -> usize {
		let mut registered = 0;
		for server in &self.config.system_servers {
			let definition = server.definition();
			match self.registry.get(server.id) {
				Ok(existing) if existing == definition => {
					debug!(server_id = %server.id, "manager.system_server_present");
					continue;
				}
				Ok(_) => {
					warn!(server_id = %server.id, "manager.system_server_conflict");
					continue;
				}
				Err(_) => {}
			}
			match self.registry.register(definition, Some(server.id)) {
				Ok(id) => {
					info!(server_id = %id, application = %server.application_name, "manager.system_server_registered");
					registered += 1;
				}
				Err(error) => {
					warn!(server_id = %server.id, %error, "manager.system_server_failed");
				}
			}
		}
		registered
	}

	/// Stops the health monitor and every supervised server.
	pub async fn stop(&self) {
		let monitor = self.monitor.lock().take();
		if let Some(monitor) = monitor {
			monitor.stop().await;
		}
		for record in self.table.drain() {
			record.destroy().await;
		}
		info!("manager.stopped");
	}
}

impl Drop for ActivationManager {
	fn drop(&mut self) {
		if let Some(monitor) = self.monitor.get_mut().as_ref() {
			monitor.cancel();
		}
	}
}
