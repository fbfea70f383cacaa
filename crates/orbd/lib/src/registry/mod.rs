//! Durable server registry.
//!
//! Maps server ids to their launch definitions and persists the table, together
//! with the monotonic id counter, as a versioned JSON document. Every mutation
//! holds the registry lock across the in-memory update and the flush; a failed
//! flush leaves the previous table in place so memory and disk never diverge.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use orbd_proto::{DefinitionEntry, ServerDefinition, ServerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ActivationError, Result};

/// On-disk format version written by this build.
pub const STORE_VERSION: u32 = 1;

/// One persisted registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
	/// Registry key.
	pub server_id: ServerId,
	/// Launch definition, never mutated after registration.
	pub definition: ServerDefinition,
	/// Whether the install hook has run.
	#[serde(default)]
	pub installed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
	version: u32,
	next_id: u32,
	servers: Vec<RegistryRecord>,
}

#[derive(Debug, Clone)]
struct Table {
	next_id: u32,
	servers: BTreeMap<ServerId, RegistryRecord>,
}

impl Table {
	fn empty() -> Self {
		Self {
			next_id: ServerId::FIRST_GENERATED,
			servers: BTreeMap::new(),
		}
	}

	fn find_application(&self, application_name: &str) -> Option<ServerId> {
		if application_name.is_empty() {
			return None;
		}
		self.servers
			.values()
			.find(|r| r.definition.application_name == application_name)
			.map(|r| r.server_id)
	}

	fn record_mut(&mut self, server_id: ServerId) -> Result<&mut RegistryRecord> {
		self.servers.get_mut(&server_id).ok_or(ActivationError::NotRegistered(server_id))
	}
}

/// Durable mapping of server id to launch definition.
#[derive(Debug)]
pub struct ServerRegistry {
	path: PathBuf,
	table: Mutex<Table>,
}

impl ServerRegistry {
	/// Opens the store at `path`, creating and flushing an empty one if the
	/// file does not exist.
	///
	/// # Errors
	///
	/// Fails on I/O errors, malformed documents, or a store version this build
	/// does not understand.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		let table = match fs::read(&path) {
			Ok(bytes) => {
				let table = decode(&path, &bytes)?;
				info!(path = %path.display(), servers = table.servers.len(), "registry.loaded");
				table
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				let table = Table::empty();
				flush(&path, &table)?;
				info!(path = %path.display(), "registry.created");
				table
			}
			Err(source) => return Err(ActivationError::Storage { path, source }),
		};
		Ok(Self {
			path,
			table: Mutex::new(table),
		})
	}

	/// Path of the backing store.
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Applies `f` to a copy of the table and flushes it. The live table is
	/// replaced only once the flush succeeded.
	fn mutate<T>(&self, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
		let mut table = self.table.lock();
		let mut next = table.clone();
		let out = f(&mut next)?;
		flush(&self.path, &next)?;
		*table = next;
		Ok(out)
	}

	/// Registers a definition and returns its id.
	///
	/// Without `explicit_id` the next counter value is allocated. An explicit
	/// id at or above the counter advances it, so generated ids never collide
	/// with it later.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyRegistered`] on a duplicate non-empty
	/// application name or a taken explicit id.
	pub fn register(&self, definition: ServerDefinition, explicit_id: Option<ServerId>) -> Result<ServerId> {
		let server_id = self.mutate(|table| {
			if let Some(existing) = table.find_application(&definition.application_name) {
				return Err(ActivationError::AlreadyRegistered {
					application: definition.application_name.clone(),
					existing,
				});
			}
			let server_id = match explicit_id {
				Some(id) => {
					if table.servers.contains_key(&id) {
						return Err(ActivationError::AlreadyRegistered {
							application: definition.application_name.clone(),
							existing: id,
						});
					}
					if id.0 >= table.next_id {
						table.next_id = id.0.checked_add(1).ok_or(ActivationError::IdsExhausted)?;
					}
					id
				}
				None => {
					let id = ServerId(table.next_id);
					table.next_id = table.next_id.checked_add(1).ok_or(ActivationError::IdsExhausted)?;
					id
				}
			};
			table.servers.insert(
				server_id,
				RegistryRecord {
					server_id,
					definition,
					installed: false,
				},
			);
			Ok(server_id)
		})?;
		info!(server_id = %server_id, "registry.registered");
		Ok(server_id)
	}

	/// Removes a definition. The id is never handed out again.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`] if absent.
	pub fn unregister(&self, server_id: ServerId) -> Result<()> {
		self.mutate(|table| {
			table
				.servers
				.remove(&server_id)
				.map(drop)
				.ok_or(ActivationError::NotRegistered(server_id))
		})?;
		info!(server_id = %server_id, "registry.unregistered");
		Ok(())
	}

	/// Returns the definition of `server_id`.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`] if absent.
	pub fn get(&self, server_id: ServerId) -> Result<ServerDefinition> {
		self.table
			.lock()
			.servers
			.get(&server_id)
			.map(|r| r.definition.clone())
			.ok_or(ActivationError::NotRegistered(server_id))
	}

	/// Resolves an application name to its id.
	///
	/// # Errors
	///
	/// [`ActivationError::ServerNotFound`] if no definition carries the name.
	pub fn get_server_id(&self, application_name: &str) -> Result<ServerId> {
		self.table
			.lock()
			.find_application(application_name)
			.ok_or_else(|| ActivationError::ServerNotFound(application_name.to_string()))
	}

	/// Returns whether the install hook of `server_id` has run.
	///
	/// # Errors
	///
	/// [`ActivationError::NotRegistered`] if absent.
	pub fn is_installed(&self, server_id: ServerId) -> Result<bool> {
		self.table
			.lock()
			.servers
			.get(&server_id)
			.map(|r| r.installed)
			.ok_or(ActivationError::NotRegistered(server_id))
	}

	/// Marks `server_id` installed.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyInstalled`] if already set,
	/// [`ActivationError::NotRegistered`] if absent.
	pub fn install(&self, server_id: ServerId) -> Result<()> {
		self.mutate(|table| {
			let record = table.record_mut(server_id)?;
			if record.installed {
				return Err(ActivationError::AlreadyInstalled(server_id));
			}
			record.installed = true;
			Ok(())
		})?;
		debug!(server_id = %server_id, "registry.installed");
		Ok(())
	}

	/// Marks `server_id` uninstalled.
	///
	/// # Errors
	///
	/// [`ActivationError::AlreadyUninstalled`] if not set,
	/// [`ActivationError::NotRegistered`] if absent.
	pub fn uninstall(&self, server_id: ServerId) -> Result<()> {
		self.mutate(|table| {
			let record = table.record_mut(server_id)?;
			if !record.installed {
				return Err(ActivationError::AlreadyUninstalled(server_id));
			}
			record.installed = false;
			Ok(())
		})?;
		debug!(server_id = %server_id, "registry.uninstalled");
		Ok(())
	}

	/// All registered ids in ascending order.
	pub fn list_ids(&self) -> Vec<ServerId> {
		self.table.lock().servers.keys().copied().collect()
	}

	/// All non-empty application names, ordered by server id.
	pub fn list_application_names(&self) -> Vec<String> {
		self.table
			.lock()
			.servers
			.values()
			.filter(|r| !r.definition.application_name.is_empty())
			.map(|r| r.definition.application_name.clone())
			.collect()
	}

	/// Every registry row, ordered by server id.
	pub fn list_definitions(&self) -> Vec<DefinitionEntry> {
		self.table
			.lock()
			.servers
			.values()
			.map(|r| DefinitionEntry {
				server_id: r.server_id,
				definition: r.definition.clone(),
				installed: r.installed,
			})
			.collect()
	}
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Table> {
	let file: StoreFile = serde_json::from_slice(bytes).map_err(|source| ActivationError::Codec {
		path: path.to_path_buf(),
		source,
	})?;
	if file.version != STORE_VERSION {
		return Err(ActivationError::UnsupportedStoreVersion {
			path: path.to_path_buf(),
			found: file.version,
			expected: STORE_VERSION,
		});
	}
	let mut table = Table {
		next_id: file.next_id.max(ServerId::FIRST_GENERATED),
		servers: BTreeMap::new(),
	};
	for record in file.servers {
		table.servers.insert(record.server_id, record);
	}
	Ok(table)
}

/// Writes `table` to a sibling temp file, syncs it, renames it over `path`,
/// then syncs the directory.
fn flush(path: &Path, table: &Table) -> Result<()> {
	let storage = |source| ActivationError::Storage {
		path: path.to_path_buf(),
		source,
	};
	let file = StoreFile {
		version: STORE_VERSION,
		next_id: table.next_id,
		servers: table.servers.values().cloned().collect(),
	};
	let json = serde_json::to_vec_pretty(&file).map_err(|source| ActivationError::Codec {
		path: path.to_path_buf(),
		source,
	})?;

	let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
	if let Some(parent) = parent {
		fs::create_dir_all(parent).map_err(storage)?;
	}

	let temp_path = path.with_extension("tmp");
	{
		let mut out = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&temp_path)
			.map_err(storage)?;
		out.write_all(&json).map_err(storage)?;
		out.sync_all().map_err(storage)?;
	}
	fs::rename(&temp_path, path).map_err(storage)?;

	if let Some(parent) = parent {
		File::open(parent).and_then(|dir| dir.sync_all()).map_err(storage)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests;
