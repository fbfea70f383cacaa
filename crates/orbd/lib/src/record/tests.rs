use std::io;

use orbd_proto::ControlCommand;

use super::*;
use crate::control::test_helpers::RecordingControl;
use crate::launcher::test_helpers::FakeLauncher;

const ID: ServerId = ServerId(300);

fn record_with(launcher: &FakeLauncher, config: DaemonConfig) -> Arc<ServerRecord> {
	let definition = ServerDefinition {
		application_name: "echo".into(),
		executable_path: "/bin/echo".into(),
		args: "hi".into(),
		..Default::default()
	};
	Arc::new(ServerRecord::new(ID, definition, Arc::new(config), Arc::new(launcher.clone())))
}

fn record(launcher: &FakeLauncher) -> Arc<ServerRecord> {
	record_with(launcher, DaemonConfig::default())
}

fn clear(port: u16) -> Vec<EndPoint> {
	vec![EndPoint::new("clear", port)]
}

#[tokio::test]
async fn activation_reaches_running() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	assert_eq!(record.state(), ServerState::Activating);

	record.activate().unwrap();
	assert_eq!(record.state(), ServerState::Activated);
	assert_eq!(launcher.spawn_count(ID), 1);
	assert!(matches!(record.activate(), Err(ActivationError::AlreadyActive(_))));

	record.register_callback(Arc::new(RecordingControl::new())).unwrap();
	record.register_endpoints("orbA", clear(4001)).unwrap();
	assert_eq!(record.state(), ServerState::Running);

	let ports = record.lookup("clear", Duration::from_secs(1)).await.unwrap();
	assert_eq!(ports, vec![OrbPortInfo { orb_id: "orbA".into(), port: 4001 }]);
	assert_eq!(launcher.spawn_count(ID), 1);
}

#[tokio::test]
async fn blocked_lookup_wakes_on_registration() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	record.activate().unwrap();

	let waiter = tokio::spawn({
		let record = record.clone();
		async move { record.lookup("clear", Duration::from_secs(5)).await }
	});
	tokio::task::yield_now().await;
	record.register_endpoints("orbA", clear(4001)).unwrap();

	let ports = waiter.await.unwrap().unwrap();
	assert_eq!(ports, vec![OrbPortInfo { orb_id: "orbA".into(), port: 4001 }]);
}

#[tokio::test(start_paused = true)]
async fn lookup_times_out_as_held_down() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	record.activate().unwrap();

	let started = Instant::now();
	let err = record.lookup("clear", Duration::from_secs(5)).await.unwrap_err();
	assert!(matches!(err, ActivationError::ServerHeldDown(_)));
	assert!(started.elapsed() >= Duration::from_secs(5));
	assert!(started.elapsed() < Duration::from_secs(7));
}

#[tokio::test]
async fn repeated_exits_hold_the_server_down() {
	let launcher = FakeLauncher::new();
	let config = DaemonConfig {
		activation_retry_max: 3,
		..DaemonConfig::default()
	};
	let record = record_with(&launcher, config);
	record.activate().unwrap();

	for attempt in 1..=3u32 {
		launcher.exit_latest(ID, Some(1));
		let valid = record.is_valid();
		assert_eq!(record.retry_count(), attempt);
		if attempt < 3 {
			assert!(valid);
			assert_eq!(record.state(), ServerState::Activated);
		} else {
			assert!(!valid);
		}
	}
	assert_eq!(record.state(), ServerState::HeldDown);
	assert_eq!(launcher.spawn_count(ID), 3);

	let err = record.lookup("clear", Duration::from_secs(30)).await.unwrap_err();
	assert!(matches!(err, ActivationError::ServerHeldDown(_)));
	assert!(matches!(record.activate(), Err(ActivationError::ServerHeldDown(_))));
	assert_eq!(launcher.spawn_count(ID), 3);
}

#[tokio::test(start_paused = true)]
async fn waiting_lookup_relaunches_crashed_start() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	record.activate().unwrap();
	launcher.exit_latest(ID, Some(1));

	let waiter = tokio::spawn({
		let record = record.clone();
		async move { record.lookup("clear", Duration::from_secs(10)).await }
	});
	tokio::time::sleep(Duration::from_secs(3)).await;
	assert_eq!(launcher.spawn_count(ID), 2);

	record.register_endpoints("orbA", clear(4002)).unwrap();
	assert_eq!(waiter.await.unwrap().unwrap()[0].port, 4002);
	assert_eq!(record.retry_count(), 0);
}

#[tokio::test]
async fn running_exit_is_demoted_and_can_restart() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	record.activate().unwrap();
	record.register_endpoints("orbA", clear(4001)).unwrap();

	assert!(!record.check_process_health());
	launcher.exit_latest(ID, None);
	assert!(record.check_process_health());
	assert_eq!(record.state(), ServerState::Deactivated);
	assert!(record.orb_ids().is_empty());
	assert!(!record.check_process_health());

	record.activate().unwrap();
	assert_eq!(record.state(), ServerState::Activated);
	assert_eq!(launcher.spawn_count(ID), 2);
}

#[tokio::test]
async fn registration_conflicts() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);

	let err = record.register_callback(Arc::new(RecordingControl::new())).unwrap_err();
	assert!(matches!(err, ActivationError::UnexpectedRegistration { state: ServerState::Activating, .. }));
	assert!(matches!(
		record.register_endpoints("orbA", clear(1)),
		Err(ActivationError::UnexpectedRegistration { .. })
	));

	record.activate().unwrap();
	record.register_endpoints("orbA", clear(4001)).unwrap();
	let err = record.register_endpoints("orbA", clear(4002)).unwrap_err();
	assert!(matches!(err, ActivationError::AlreadyRegisteredForClient { ref orb_id, .. } if orb_id == "orbA"));
	assert!(matches!(
		record.register_callback(Arc::new(RecordingControl::new())),
		Err(ActivationError::UnexpectedRegistration { state: ServerState::Running, .. })
	));

	record.register_endpoints("orbB", vec![EndPoint::new("ssl", 4443)]).unwrap();
	assert_eq!(record.orb_ids(), vec!["orbA".to_string(), "orbB".to_string()]);
	assert_eq!(record.endpoints_for("orbB").unwrap(), vec![EndPoint::new("ssl", 4443)]);
	assert!(matches!(record.endpoints_for("orbC"), Err(ActivationError::InvalidOrbId { .. })));
}

#[tokio::test]
async fn missing_endpoint_type_reports_minus_one() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	record.activate().unwrap();
	assert!(record.probe("ssl").is_ok());
	record.register_endpoints("orbA", clear(4001)).unwrap();

	let ports = record.lookup("ssl", Duration::from_secs(1)).await.unwrap();
	assert_eq!(ports, vec![OrbPortInfo { orb_id: "orbA".into(), port: -1 }]);
	assert!(matches!(record.probe("ssl"), Err(ActivationError::NoSuchEndPoint { .. })));
	assert!(record.probe("clear").is_ok());
}

#[test]
fn spawn_failure_deactivates() {
	let launcher = FakeLauncher::new();
	launcher.fail_spawns(Some(io::ErrorKind::PermissionDenied));
	let record = record(&launcher);

	let err = record.activate().unwrap_err();
	assert!(matches!(err, ActivationError::UnableToStartProcess { .. }));
	assert_eq!(record.state(), ServerState::Deactivated);
}

#[tokio::test(start_paused = true)]
async fn destroy_asks_for_shutdown_then_kills() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	let control = Arc::new(RecordingControl::new());
	record.activate().unwrap();
	record.register_callback(control.clone()).unwrap();
	record.register_endpoints("orbA", clear(4001)).unwrap();

	record.destroy().await;
	assert_eq!(record.state(), ServerState::Deactivated);
	assert!(record.orb_ids().is_empty());
	assert_eq!(control.calls(), vec![ControlCommand::Shutdown]);
	assert!(launcher.latest(ID).unwrap().was_killed());
}

#[tokio::test(start_paused = true)]
async fn destroy_ignores_shutdown_failure() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	let control = Arc::new(RecordingControl::new());
	control.fail_with("busy");
	record.activate().unwrap();
	record.register_callback(control.clone()).unwrap();

	record.destroy().await;
	assert_eq!(record.state(), ServerState::Deactivated);
	assert!(launcher.latest(ID).unwrap().was_killed());
}

#[tokio::test]
async fn install_requires_running_server() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	let control = Arc::new(RecordingControl::new());
	record.activate().unwrap();
	record.register_callback(control.clone()).unwrap();
	assert!(matches!(record.install().await, Err(ActivationError::ServerNotRunning(_))));

	record.register_endpoints("orbA", clear(4001)).unwrap();
	record.install().await.unwrap();
	record.uninstall().await.unwrap();
	assert_eq!(control.calls(), vec![ControlCommand::Install, ControlCommand::Uninstall]);
	assert_eq!(record.state(), ServerState::Deactivated);
	assert!(launcher.latest(ID).unwrap().was_killed());
}

#[tokio::test]
async fn failing_uninstall_still_stops_the_server() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	let control = Arc::new(RecordingControl::new());
	record.activate().unwrap();
	record.register_callback(control.clone()).unwrap();
	record.register_endpoints("orbA", clear(4001)).unwrap();
	control.fail_with("locked");

	let err = record.uninstall().await.unwrap_err();
	assert!(matches!(err, ActivationError::ControlFailed { ref message, .. } if message == "locked"));
	assert_eq!(record.state(), ServerState::Deactivated);
}

#[tokio::test]
async fn verify_maps_exit_codes() {
	let launcher = FakeLauncher::new();
	let record = record(&launcher);
	assert_eq!(record.verify().await.unwrap(), VerifyResult::Ok);

	launcher.set_verify_exit(Some(VerifyResult::EXIT_NO_ENTRY_POINT));
	assert_eq!(record.verify().await.unwrap(), VerifyResult::NoEntryPoint);

	launcher.set_verify_exit(None);
	assert_eq!(record.verify().await.unwrap(), VerifyResult::Unknown);

	launcher.fail_spawns(Some(io::ErrorKind::NotFound));
	assert_eq!(record.verify().await.unwrap(), VerifyResult::MainNotFound);
	assert_eq!(launcher.verify_count(), 3);
	assert_eq!(launcher.spawn_count(ID), 0);
	assert_eq!(record.state(), ServerState::Activating);
}
