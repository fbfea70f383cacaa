use super::*;

fn echo() -> ServerDefinition {
	ServerDefinition {
		application_name: "echo".into(),
		server_name: "EchoServer".into(),
		executable_path: "/bin/echo".into(),
		args: "hi".into(),
		vm_args: String::new(),
	}
}

fn named(app: &str) -> ServerDefinition {
	ServerDefinition {
		application_name: app.into(),
		executable_path: "/bin/true".into(),
		..Default::default()
	}
}

#[test]
fn missing_store_is_created_empty() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("nested").join("registry.json");
	let registry = ServerRegistry::open(&path).unwrap();
	assert!(path.exists());
	assert!(registry.list_ids().is_empty());
	assert!(!path.with_extension("tmp").exists());
}

#[test]
fn register_get_unregister() {
	let dir = tempfile::tempdir().unwrap();
	let registry = ServerRegistry::open(dir.path().join("registry.json")).unwrap();

	let id = registry.register(echo(), None).unwrap();
	assert!(id.0 >= ServerId::FIRST_GENERATED);
	assert_eq!(registry.get(id).unwrap(), echo());
	assert!(registry.list_application_names().contains(&"echo".to_string()));
	assert_eq!(registry.get_server_id("echo").unwrap(), id);

	registry.unregister(id).unwrap();
	assert!(matches!(registry.get(id), Err(ActivationError::NotRegistered(got)) if got == id));
	assert!(matches!(registry.unregister(id), Err(ActivationError::NotRegistered(_))));
	assert!(matches!(registry.get_server_id("echo"), Err(ActivationError::ServerNotFound(_))));
}

#[test]
fn duplicate_application_is_rejected_and_store_unchanged() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("registry.json");
	let registry = ServerRegistry::open(&path).unwrap();
	let id = registry.register(echo(), None).unwrap();
	let before = fs::read(&path).unwrap();

	let err = registry.register(echo(), None).unwrap_err();
	assert!(matches!(err, ActivationError::AlreadyRegistered { existing, .. } if existing == id));
	assert_eq!(registry.list_ids(), vec![id]);
	assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn anonymous_registrations_may_repeat() {
	let dir = tempfile::tempdir().unwrap();
	let registry = ServerRegistry::open(dir.path().join("registry.json")).unwrap();
	let a = registry.register(named(""), None).unwrap();
	let b = registry.register(named(""), None).unwrap();
	assert_ne!(a, b);
	assert!(registry.list_application_names().is_empty());
	assert_eq!(registry.list_definitions().len(), 2);
}

#[test]
fn ids_are_not_reused_across_restarts() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("registry.json");
	let first = {
		let registry = ServerRegistry::open(&path).unwrap();
		let a = registry.register(named("a"), None).unwrap();
		let b = registry.register(named("b"), None).unwrap();
		registry.unregister(b).unwrap();
		registry.install(a).unwrap();
		b
	};

	let registry = ServerRegistry::open(&path).unwrap();
	assert_eq!(registry.list_application_names(), vec!["a".to_string()]);
	let a = registry.get_server_id("a").unwrap();
	assert!(registry.is_installed(a).unwrap());
	let c = registry.register(named("c"), None).unwrap();
	assert!(c > first);
}

#[test]
fn install_flag_toggles() {
	let dir = tempfile::tempdir().unwrap();
	let registry = ServerRegistry::open(dir.path().join("registry.json")).unwrap();
	let id = registry.register(echo(), None).unwrap();

	assert!(matches!(registry.uninstall(id), Err(ActivationError::AlreadyUninstalled(_))));
	registry.install(id).unwrap();
	assert!(matches!(registry.install(id), Err(ActivationError::AlreadyInstalled(_))));
	registry.uninstall(id).unwrap();
	assert!(!registry.is_installed(id).unwrap());
	assert!(matches!(registry.install(ServerId(9999)), Err(ActivationError::NotRegistered(_))));
}

#[test]
fn explicit_ids() {
	let dir = tempfile::tempdir().unwrap();
	let registry = ServerRegistry::open(dir.path().join("registry.json")).unwrap();

	assert_eq!(registry.register(named("naming"), Some(ServerId(1))).unwrap(), ServerId(1));
	let err = registry.register(named("other"), Some(ServerId(1))).unwrap_err();
	assert!(matches!(err, ActivationError::AlreadyRegistered { existing: ServerId(1), .. }));

	assert_eq!(registry.register(named("high"), Some(ServerId(400))).unwrap(), ServerId(400));
	assert_eq!(registry.register(named("next"), None).unwrap(), ServerId(401));
}

#[test]
fn malformed_store_is_an_error() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("registry.json");
	fs::write(&path, b"{ not json").unwrap();
	assert!(matches!(ServerRegistry::open(&path), Err(ActivationError::Codec { .. })));
}

#[test]
fn future_store_version_is_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("registry.json");
	fs::write(&path, br#"{"version": 7, "next_id": 256, "servers": []}"#).unwrap();
	let err = ServerRegistry::open(&path).unwrap_err();
	assert!(matches!(err, ActivationError::UnsupportedStoreVersion { found: 7, expected: 1, .. }));
}

#[test]
fn failed_flush_leaves_table_untouched() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("registry.json");
	let registry = ServerRegistry::open(&path).unwrap();
	let before = fs::read(&path).unwrap();

	// a directory at the temp path makes the next write fail
	let temp_path = path.with_extension("tmp");
	fs::create_dir(&temp_path).unwrap();
	let err = registry.register(echo(), None).unwrap_err();
	assert!(matches!(err, ActivationError::Storage { .. }));
	assert!(registry.list_ids().is_empty());
	assert!(registry.list_application_names().is_empty());
	assert_eq!(fs::read(&path).unwrap(), before);

	fs::remove_dir(&temp_path).unwrap();
	assert_eq!(registry.register(echo(), None).unwrap(), ServerId(ServerId::FIRST_GENERATED));
	let reopened = ServerRegistry::open(&path).unwrap();
	assert_eq!(reopened.list_ids(), vec![ServerId(ServerId::FIRST_GENERATED)]);
}
