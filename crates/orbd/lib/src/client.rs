//! Client side of the control socket, used by the CLI.

use std::path::Path;

use orbd_proto::{
	DefinitionEntry, EndPoint, Frame, FrameError, Redirect, Request, RequestId, RequestPayload, Response,
	ResponsePayload, ServerDefinition, ServerId, ServerLocation, ServerLocationPerOrb, WireError, read_frame,
	write_frame,
};
use thiserror::Error;
use tokio::net::UnixStream;

/// Errors talking to the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
	/// Connecting failed.
	#[error("cannot connect to {path}: {source}")]
	Connect {
		/// Socket path.
		path: String,
		/// I/O error.
		#[source]
		source: std::io::Error,
	},
	/// Framing failed.
	#[error(transparent)]
	Frame(#[from] FrameError),
	/// The daemon rejected the request.
	#[error("{0}")]
	Remote(WireError),
	/// The daemon closed the connection.
	#[error("connection closed by daemon")]
	Closed,
	/// The daemon answered with a payload of the wrong shape.
	#[error("unexpected response: {0}")]
	UnexpectedResponse(String),
}

/// Result type for client calls.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Request/response client over one socket connection.
#[derive(Debug)]
pub struct AdminClient {
	stream: UnixStream,
	next_id: u64,
}

macro_rules! expect_payload {
	($response:expr, $pattern:pat => $value:expr) => {
		match $response {
			$pattern => Ok($value),
			other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
		}
	};
}

impl AdminClient {
	/// Connects to the daemon socket.
	///
	/// # Errors
	///
	/// [`ClientError::Connect`] if nothing listens on `path`.
	pub async fn connect(path: impl AsRef<Path>) -> ClientResult<Self> {
		let path = path.as_ref();
		let stream = UnixStream::connect(path).await.map_err(|source| ClientError::Connect {
			path: path.display().to_string(),
			source,
		})?;
		Ok(Self::from_stream(stream))
	}

	/// Wraps an already connected stream.
	pub fn from_stream(stream: UnixStream) -> Self {
		Self { stream, next_id: 1 }
	}

	/// Sends one request and waits for its response.
	///
	/// # Errors
	///
	/// [`ClientError::Remote`] carries the daemon's error; other variants are
	/// transport failures.
	pub async fn call(&mut self, payload: RequestPayload) -> ClientResult<ResponsePayload> {
		let id = RequestId(self.next_id);
		self.next_id += 1;
		write_frame(&mut self.stream, &Frame::Request(Request { id, payload })).await?;
		loop {
			match read_frame(&mut self.stream).await? {
				Some(Frame::Response(Response { request_id, result })) if request_id == id => {
					return result.map_err(ClientError::Remote);
				}
				Some(other) => tracing::debug!(frame = ?other, "client.skipped_frame"),
				None => return Err(ClientError::Closed),
			}
		}
	}

	async fn done(&mut self, payload: RequestPayload) -> ClientResult<()> {
		expect_payload!(self.call(payload).await?, ResponsePayload::Done => ())
	}

	/// Checks that the daemon answers.
	pub async fn ping(&mut self) -> ClientResult<()> {
		expect_payload!(self.call(RequestPayload::Ping).await?, ResponsePayload::Pong => ())
	}

	/// Registers a definition and returns its id.
	pub async fn register(
		&mut self,
		definition: ServerDefinition,
		explicit_id: Option<ServerId>,
	) -> ClientResult<ServerId> {
		let payload = RequestPayload::Register {
			definition,
			explicit_id,
		};
		expect_payload!(self.call(payload).await?, ResponsePayload::Registered { server_id } => server_id)
	}

	/// Removes a definition.
	pub async fn unregister(&mut self, server_id: ServerId) -> ClientResult<()> {
		self.done(RequestPayload::Unregister { server_id }).await
	}

	/// Fetches a definition.
	pub async fn get_server(&mut self, server_id: ServerId) -> ClientResult<ServerDefinition> {
		expect_payload!(
			self.call(RequestPayload::GetServer { server_id }).await?,
			ResponsePayload::Definition(definition) => definition
		)
	}

	/// Resolves an application name.
	pub async fn get_server_id(&mut self, application_name: &str) -> ClientResult<ServerId> {
		let payload = RequestPayload::GetServerId {
			application_name: application_name.to_string(),
		};
		expect_payload!(self.call(payload).await?, ResponsePayload::ServerId(id) => id)
	}

	/// Every registry row.
	pub async fn list_definitions(&mut self) -> ClientResult<Vec<DefinitionEntry>> {
		expect_payload!(
			self.call(RequestPayload::ListDefinitions).await?,
			ResponsePayload::Definitions(entries) => entries
		)
	}

	/// Registered application names.
	pub async fn list_application_names(&mut self) -> ClientResult<Vec<String>> {
		expect_payload!(
			self.call(RequestPayload::ListApplicationNames).await?,
			ResponsePayload::Names(names) => names
		)
	}

	/// Ids of servers with a live record.
	pub async fn list_active(&mut self) -> ClientResult<Vec<ServerId>> {
		expect_payload!(self.call(RequestPayload::ListActive).await?, ResponsePayload::Ids(ids) => ids)
	}

	/// Orb ids of a running server.
	pub async fn orb_ids(&mut self, server_id: ServerId) -> ClientResult<Vec<String>> {
		expect_payload!(
			self.call(RequestPayload::ListOrbIds { server_id }).await?,
			ResponsePayload::Names(names) => names
		)
	}

	/// Location of a server's endpoints of one type.
	pub async fn locate(&mut self, server_id: ServerId, endpoint_type: &str) -> ClientResult<ServerLocation> {
		let payload = RequestPayload::Locate {
			server_id,
			endpoint_type: endpoint_type.to_string(),
		};
		expect_payload!(self.call(payload).await?, ResponsePayload::Location(location) => location)
	}

	/// Endpoints of one orb.
	pub async fn locate_per_orb(&mut self, server_id: ServerId, orb_id: &str) -> ClientResult<ServerLocationPerOrb> {
		let payload = RequestPayload::LocatePerOrb {
			server_id,
			orb_id: orb_id.to_string(),
		};
		expect_payload!(self.call(payload).await?, ResponsePayload::OrbLocation(location) => location)
	}

	/// Launches a server.
	pub async fn activate(&mut self, server_id: ServerId) -> ClientResult<()> {
		self.done(RequestPayload::Activate { server_id }).await
	}

	/// Stops a server.
	pub async fn shutdown(&mut self, server_id: ServerId) -> ClientResult<()> {
		self.done(RequestPayload::Shutdown { server_id }).await
	}

	/// Runs a server's install hook.
	pub async fn install(&mut self, server_id: ServerId) -> ClientResult<()> {
		self.done(RequestPayload::Install { server_id }).await
	}

	/// Runs a server's uninstall hook.
	pub async fn uninstall(&mut self, server_id: ServerId) -> ClientResult<()> {
		self.done(RequestPayload::Uninstall { server_id }).await
	}

	/// Announces the endpoints of one orb of a launched server.
	pub async fn register_endpoints(
		&mut self,
		server_id: ServerId,
		orb_id: &str,
		endpoints: Vec<EndPoint>,
	) -> ClientResult<()> {
		self.done(RequestPayload::RegisterEndpoints {
			server_id,
			orb_id: orb_id.to_string(),
			endpoints,
		})
		.await
	}

	/// Resolves an encoded routing key to a redirect.
	pub async fn resolve(&mut self, routing_key: Vec<u8>) -> ClientResult<Redirect> {
		expect_payload!(
			self.call(RequestPayload::ResolveRoutingKey { routing_key }).await?,
			ResponsePayload::Redirect(redirect) => redirect
		)
	}
}
