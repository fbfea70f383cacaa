//! Server table and background health monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use orbd_proto::{ServerId, ServerState};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::record::ServerRecord;

/// Runtime records keyed by server id, guarded by one table-wide lock.
///
/// The lock only covers insert, remove, and snapshot; per-record work always
/// happens on a snapshot outside of it.
#[derive(Debug, Default)]
pub struct ServerTable {
	records: Mutex<HashMap<ServerId, Arc<ServerRecord>>>,
}

impl ServerTable {
	/// Creates an empty table.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the record of `server_id`, if any.
	pub fn get(&self, server_id: ServerId) -> Option<Arc<ServerRecord>> {
		self.records.lock().get(&server_id).cloned()
	}

	/// Returns the record of `server_id`, inserting `create()` if absent.
	/// `create` runs under the table lock, so concurrent callers observe
	/// exactly one record.
	///
	/// # Errors
	///
	/// Propagates the error of `create`.
	pub fn get_or_try_insert<E>(
		&self,
		server_id: ServerId,
		create: impl FnOnce() -> Result<ServerRecord, E>,
	) -> Result<Arc<ServerRecord>, E> {
		let mut records = self.records.lock();
		if let Some(record) = records.get(&server_id) {
			return Ok(record.clone());
		}
		let record = Arc::new(create()?);
		records.insert(server_id, record.clone());
		Ok(record)
	}

	/// Removes and returns the record of `server_id`.
	pub fn remove(&self, server_id: ServerId) -> Option<Arc<ServerRecord>> {
		self.records.lock().remove(&server_id)
	}

	/// All records at this instant.
	pub fn snapshot(&self) -> Vec<Arc<ServerRecord>> {
		self.records.lock().values().cloned().collect()
	}

	/// Removes every record.
	pub fn drain(&self) -> Vec<Arc<ServerRecord>> {
		self.records.lock().drain().map(|(_, record)| record).collect()
	}

	/// Runs one health check over the `Running` records. Returns the ids that
	/// were demoted.
	pub fn sweep(&self) -> Vec<ServerId> {
		self.snapshot()
			.into_iter()
			.filter(|record| record.state() == ServerState::Running)
			.filter(|record| record.check_process_health())
			.map(|record| record.server_id())
			.collect()
	}
}

/// Background task demoting running records whose process died.
#[derive(Debug)]
pub struct HealthMonitor {
	cancel: CancellationToken,
	task: JoinHandle<()>,
}

impl HealthMonitor {
	/// Starts the monitor on the current runtime.
	pub fn spawn(table: Arc<ServerTable>, interval: Duration) -> Self {
		let cancel = CancellationToken::new();
		let task = tokio::spawn(run(table, interval, cancel.clone()));
		Self { cancel, task }
	}

	/// Stops the monitor and waits for the task to finish.
	pub async fn stop(self) {
		self.cancel.cancel();
		let _ = self.task.await;
	}

	/// Signals the monitor to stop without waiting.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}
}

async fn run(table: Arc<ServerTable>, interval: Duration, cancel: CancellationToken) {
	debug!(?interval, "monitor.started");
	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			() = tokio::time::sleep(interval) => {}
		}
		let demoted = table.sweep();
		if !demoted.is_empty() {
			info!(?demoted, "monitor.demoted");
		}
	}
	debug!("monitor.stopped");
}

#[cfg(test)]
mod tests {
	use orbd_proto::{EndPoint, ServerDefinition};

	use super::*;
	use crate::config::DaemonConfig;
	use crate::launcher::test_helpers::FakeLauncher;

	fn running(table: &ServerTable, launcher: &FakeLauncher, id: u32) -> Arc<ServerRecord> {
		let record = table
			.get_or_try_insert::<()>(ServerId(id), || {
				Ok(ServerRecord::new(
					ServerId(id),
					ServerDefinition::default(),
					Arc::new(DaemonConfig::default()),
					Arc::new(launcher.clone()),
				))
			})
			.unwrap();
		record.activate().unwrap();
		record.register_endpoints("orbA", vec![EndPoint::new("clear", 4000)]).unwrap();
		record
	}

	#[tokio::test(start_paused = true)]
	async fn dead_running_server_is_demoted_next_cycle() {
		let launcher = FakeLauncher::new();
		let table = Arc::new(ServerTable::new());
		let alive = running(&table, &launcher, 300);
		let dead = running(&table, &launcher, 301);

		let monitor = HealthMonitor::spawn(table.clone(), Duration::from_secs(60));
		launcher.exit_latest(ServerId(301), Some(0));
		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(dead.state(), ServerState::Running);

		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(dead.state(), ServerState::Deactivated);
		assert!(dead.orb_ids().is_empty());
		assert_eq!(alive.state(), ServerState::Running);
		monitor.stop().await;
	}

	#[test]
	fn get_or_insert_creates_once() {
		let table = ServerTable::new();
		let launcher = FakeLauncher::new();
		let create = || {
			Ok::<_, ()>(ServerRecord::new(
				ServerId(300),
				ServerDefinition::default(),
				Arc::new(DaemonConfig::default()),
				Arc::new(launcher.clone()),
			))
		};
		let a = table.get_or_try_insert(ServerId(300), create).unwrap();
		let b = table.get_or_try_insert(ServerId(300), || Err(())).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert!(table.remove(ServerId(300)).is_some());
		assert!(table.get(ServerId(300)).is_none());
	}
}
