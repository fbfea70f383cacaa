//! Control socket server.
//!
//! Administrative tools and supervised server processes talk to the daemon
//! over one Unix domain socket. Every connection is served by its own task;
//! requests are dispatched concurrently so a blocking location query never
//! stalls the connection. A connection that sends `RegisterCallback` becomes
//! the control channel of that server: the daemon pushes `Control` frames on
//! it and awaits the matching `ControlAck`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use orbd_proto::{
	Control, ControlAck, ControlCommand, ControlId, Frame, Request, RequestPayload, Response, ResponsePayload,
	WireError, read_frame, write_frame,
};
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::control::ServerControl;
use crate::error::Result;
use crate::manager::ActivationManager;

/// Serves the control socket until `shutdown` is cancelled, then stops the
/// manager and removes the socket file.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or a stale socket file
/// cannot be removed.
pub async fn serve(
	socket_path: impl AsRef<Path>,
	manager: Arc<ActivationManager>,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	let path = socket_path.as_ref();
	if path.exists() {
		tokio::fs::remove_file(path).await?;
	}
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}

	let listener = UnixListener::bind(path)?;
	tracing::info!(path = %path.display(), "ipc.listening");

	loop {
		tokio::select! {
			() = shutdown.cancelled() => {
				tracing::info!("ipc.shutting_down");
				break;
			}
			res = listener.accept() => {
				match res {
					Ok((stream, _addr)) => {
						tokio::spawn(handle_connection(stream, manager.clone()));
					}
					Err(e) => {
						tracing::error!(error = %e, "ipc.accept_failed");
					}
				}
			}
		}
	}

	manager.stop().await;
	let _ = tokio::fs::remove_file(path).await;
	Ok(())
}

type PendingAcks = Arc<Mutex<HashMap<ControlId, oneshot::Sender<std::result::Result<(), String>>>>>;

/// Control channel backed by a socket connection.
struct IpcControl {
	frames: mpsc::UnboundedSender<Frame>,
	pending: PendingAcks,
	next_id: AtomicU64,
}

impl IpcControl {
	async fn call(&self, command: ControlCommand) -> std::result::Result<(), String> {
		let id = ControlId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		if self.frames.send(Frame::Control(Control { id, command })).is_err() {
			self.pending.lock().remove(&id);
			return Err("control channel closed".to_string());
		}
		rx.await.unwrap_or_else(|_| Err("control channel closed".to_string()))
	}
}

#[async_trait]
impl ServerControl for IpcControl {
	async fn install(&self) -> std::result::Result<(), String> {
		self.call(ControlCommand::Install).await
	}

	async fn uninstall(&self) -> std::result::Result<(), String> {
		self.call(ControlCommand::Uninstall).await
	}

	async fn shutdown(&self) -> std::result::Result<(), String> {
		self.call(ControlCommand::Shutdown).await
	}
}

/// Serves one connection until the peer closes it.
pub(crate) async fn handle_connection(stream: UnixStream, manager: Arc<ActivationManager>) {
	tracing::debug!("ipc.connection_opened");
	let (mut reader, mut writer) = stream.into_split();
	let (frames, mut outbox) = mpsc::unbounded_channel::<Frame>();
	let closed = CancellationToken::new();

	let writer_task = tokio::spawn({
		let closed = closed.clone();
		async move {
			loop {
				let frame = tokio::select! {
					biased;
					frame = outbox.recv() => frame,
					() = closed.cancelled() => None,
				};
				let Some(frame) = frame else { break };
				if let Err(e) = write_frame(&mut writer, &frame).await {
					tracing::debug!(error = %e, "ipc.write_failed");
					break;
				}
			}
		}
	});

	let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
	let control = Arc::new(IpcControl {
		frames: frames.clone(),
		pending: pending.clone(),
		next_id: AtomicU64::new(1),
	});

	loop {
		match read_frame(&mut reader).await {
			Ok(Some(Frame::Request(request))) => {
				let manager = manager.clone();
				let frames = frames.clone();
				let control = control.clone();
				tokio::spawn(async move {
					let request_id = request.id;
					let result = dispatch(&manager, request, control).await.map_err(|e| {
						tracing::debug!(error = %e, "ipc.request_failed");
						e.to_wire()
					});
					let _ = frames.send(Frame::Response(Response { request_id, result }));
				});
			}
			Ok(Some(Frame::ControlAck(ControlAck { id, result }))) => match pending.lock().remove(&id) {
				Some(tx) => {
					let _ = tx.send(result);
				}
				None => tracing::warn!(?id, "ipc.unexpected_ack"),
			},
			Ok(Some(other)) => {
				tracing::warn!(frame = ?other, "ipc.unexpected_frame");
			}
			Ok(None) => break,
			Err(e) => {
				tracing::warn!(error = %e, "ipc.read_failed");
				break;
			}
		}
	}

	pending.lock().clear();
	closed.cancel();
	let _ = writer_task.await;
	tracing::debug!("ipc.connection_closed");
}

async fn dispatch(
	manager: &ActivationManager,
	request: Request,
	control: Arc<IpcControl>,
) -> Result<ResponsePayload> {
	let registry = manager.registry();
	Ok(match request.payload {
		RequestPayload::Ping => ResponsePayload::Pong,
		RequestPayload::Register {
			definition,
			explicit_id,
		} => ResponsePayload::Registered {
			server_id: manager.register_server(definition, explicit_id).await?,
		},
		RequestPayload::Unregister { server_id } => {
			manager.unregister_server(server_id).await?;
			ResponsePayload::Done
		}
		RequestPayload::GetServer { server_id } => ResponsePayload::Definition(registry.get(server_id)?),
		RequestPayload::GetServerId { application_name } => {
			ResponsePayload::ServerId(registry.get_server_id(&application_name)?)
		}
		RequestPayload::ListIds => ResponsePayload::Ids(registry.list_ids()),
		RequestPayload::ListApplicationNames => ResponsePayload::Names(registry.list_application_names()),
		RequestPayload::ListDefinitions => ResponsePayload::Definitions(registry.list_definitions()),
		RequestPayload::Activate { server_id } => {
			manager.activate(server_id)?;
			ResponsePayload::Done
		}
		RequestPayload::Shutdown { server_id } => {
			manager.shutdown(server_id).await?;
			ResponsePayload::Done
		}
		RequestPayload::Install { server_id } => {
			manager.install(server_id).await?;
			ResponsePayload::Done
		}
		RequestPayload::Uninstall { server_id } => {
			manager.uninstall(server_id).await?;
			ResponsePayload::Done
		}
		RequestPayload::Locate {
			server_id,
			endpoint_type,
		} => ResponsePayload::Location(manager.locate_server(server_id, &endpoint_type).await?),
		RequestPayload::LocatePerOrb { server_id, orb_id } => {
			ResponsePayload::OrbLocation(manager.locate_server_for_orb(server_id, &orb_id).await?)
		}
		RequestPayload::ListActive => ResponsePayload::Ids(manager.active_server_ids()),
		RequestPayload::ListOrbIds { server_id } => ResponsePayload::Names(manager.orb_ids(server_id)?),
		RequestPayload::RegisterCallback { server_id } => {
			manager.register_callback(server_id, control)?;
			ResponsePayload::Done
		}
		RequestPayload::RegisterEndpoints {
			server_id,
			orb_id,
			endpoints,
		} => {
			manager.register_endpoint_callback(server_id, &orb_id, endpoints)?;
			ResponsePayload::Done
		}
		RequestPayload::ResolveRoutingKey { routing_key } => {
			ResponsePayload::Redirect(manager.resolve_routing_key(&routing_key).await?)
		}
	})
}

/// Result of one request as seen by the peer.
pub type WireResult = std::result::Result<ResponsePayload, WireError>;

#[cfg(test)]
mod tests {
	use orbd_proto::{EndPoint, RequestId, ServerDefinition, ServerId, ServerState};

	use super::*;
	use crate::config::DaemonConfig;
	use crate::launcher::test_helpers::FakeLauncher;
	use crate::registry::ServerRegistry;

	struct Daemon {
		_dir: tempfile::TempDir,
		launcher: FakeLauncher,
		manager: Arc<ActivationManager>,
	}

	fn daemon() -> Daemon {
		let dir = tempfile::tempdir().unwrap();
		let config = DaemonConfig {
			data_dir: dir.path().to_path_buf(),
			verify_on_register: false,
			..DaemonConfig::default()
		};
		let registry = Arc::new(ServerRegistry::open(config.registry_path()).unwrap());
		let launcher = FakeLauncher::new();
		let manager = ActivationManager::new(registry, Arc::new(config), Arc::new(launcher.clone()));
		Daemon {
			_dir: dir,
			launcher,
			manager,
		}
	}

	fn connect(manager: &Arc<ActivationManager>) -> UnixStream {
		let (client, server) = UnixStream::pair().unwrap();
		tokio::spawn(handle_connection(server, manager.clone()));
		client
	}

	async fn call(stream: &mut UnixStream, id: u64, payload: RequestPayload) -> WireResult {
		write_frame(
			stream,
			&Frame::Request(Request {
				id: RequestId(id),
				payload,
			}),
		)
		.await
		.unwrap();
		match read_frame(stream).await.unwrap() {
			Some(Frame::Response(Response { request_id, result })) => {
				assert_eq!(request_id, RequestId(id));
				result
			}
			other => panic!("expected response, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn ping_roundtrip() {
		let d = daemon();
		let mut client = connect(&d.manager);
		assert!(matches!(call(&mut client, 1, RequestPayload::Ping).await, Ok(ResponsePayload::Pong)));
	}

	#[tokio::test]
	async fn registry_requests() {
		let d = daemon();
		let mut client = connect(&d.manager);
		let definition = ServerDefinition {
			application_name: "echo".into(),
			executable_path: "/bin/echo".into(),
			args: "hi".into(),
			..Default::default()
		};

		let id = match call(
			&mut client,
			1,
			RequestPayload::Register {
				definition: definition.clone(),
				explicit_id: None,
			},
		)
		.await
		{
			Ok(ResponsePayload::Registered { server_id }) => server_id,
			other => panic!("unexpected: {other:?}"),
		};

		match call(&mut client, 2, RequestPayload::GetServer { server_id: id }).await {
			Ok(ResponsePayload::Definition(got)) => assert_eq!(got, definition),
			other => panic!("unexpected: {other:?}"),
		}
		match call(
			&mut client,
			3,
			RequestPayload::GetServerId {
				application_name: "echo".into(),
			},
		)
		.await
		{
			Ok(ResponsePayload::ServerId(got)) => assert_eq!(got, id),
			other => panic!("unexpected: {other:?}"),
		}

		let err = call(
			&mut client,
			4,
			RequestPayload::Register {
				definition,
				explicit_id: None,
			},
		)
		.await
		.unwrap_err();
		assert_eq!(err.code, orbd_proto::ErrorCode::AlreadyRegistered);

		let err = call(&mut client, 5, RequestPayload::GetServer { server_id: ServerId(9999) })
			.await
			.unwrap_err();
		assert_eq!(err.code, orbd_proto::ErrorCode::NotRegistered);
	}

	#[tokio::test]
	async fn server_callback_and_control_roundtrip() {
		let d = daemon();
		let id = d
			.manager
			.registry()
			.register(
				ServerDefinition {
					application_name: "echo".into(),
					executable_path: "/bin/echo".into(),
					..Default::default()
				},
				None,
			)
			.unwrap();

		let mut admin = connect(&d.manager);
		let mut server = connect(&d.manager);

		assert!(matches!(
			call(&mut admin, 1, RequestPayload::Activate { server_id: id }).await,
			Ok(ResponsePayload::Done)
		));
		assert_eq!(d.launcher.spawn_count(id), 1);
		assert!(matches!(
			call(&mut server, 1, RequestPayload::RegisterCallback { server_id: id }).await,
			Ok(ResponsePayload::Done)
		));
		assert!(matches!(
			call(
				&mut server,
				2,
				RequestPayload::RegisterEndpoints {
					server_id: id,
					orb_id: "orbA".into(),
					endpoints: vec![EndPoint::new("clear", 4001)],
				},
			)
			.await,
			Ok(ResponsePayload::Done)
		));
		assert_eq!(d.manager.record(id).unwrap().state(), ServerState::Running);

		let install = tokio::spawn(async move {
			let result = call(&mut admin, 2, RequestPayload::Install { server_id: id }).await;
			(admin, result)
		});

		let control = match read_frame(&mut server).await.unwrap() {
			Some(Frame::Control(control)) => control,
			other => panic!("expected control frame, got {other:?}"),
		};
		assert_eq!(control.command, ControlCommand::Install);
		write_frame(
			&mut server,
			&Frame::ControlAck(ControlAck {
				id: control.id,
				result: Ok(()),
			}),
		)
		.await
		.unwrap();

		let (mut admin, result) = install.await.unwrap();
		assert!(matches!(result, Ok(ResponsePayload::Done)));
		assert!(d.manager.registry().is_installed(id).unwrap());

		match call(&mut admin, 3, RequestPayload::ListOrbIds { server_id: id }).await {
			Ok(ResponsePayload::Names(names)) => assert_eq!(names, vec!["orbA".to_string()]),
			other => panic!("unexpected: {other:?}"),
		}
		match call(&mut admin, 4, RequestPayload::ListActive).await {
			Ok(ResponsePayload::Ids(ids)) => assert_eq!(ids, vec![id]),
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[tokio::test]
	async fn serve_accepts_connections_until_cancelled() {
		let d = daemon();
		let path = d._dir.path().join("orbd.sock");
		let shutdown = CancellationToken::new();
		let server = tokio::spawn(serve(path.clone(), d.manager.clone(), shutdown.clone()));

		let mut client = loop {
			match UnixStream::connect(&path).await {
				Ok(stream) => break stream,
				Err(_) => tokio::task::yield_now().await,
			}
		};
		assert!(matches!(call(&mut client, 1, RequestPayload::Ping).await, Ok(ResponsePayload::Pong)));

		shutdown.cancel();
		server.await.unwrap().unwrap();
		assert!(!path.exists());
	}
}
