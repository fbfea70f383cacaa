//! Administrative subcommands sent to a running daemon.

use std::path::Path;

use clap::Subcommand;
use orbd::client::{AdminClient, ClientResult};
use orbd_proto::{CLEAR_TEXT_ENDPOINT, ServerDefinition, ServerId};

#[derive(Subcommand, Debug)]
pub enum AdminCommand {
	/// Register a server definition
	Register {
		/// Application name, unique when not empty
		#[arg(long = "app", default_value = "")]
		application_name: String,

		/// Server name, informational
		#[arg(long = "server", default_value = "")]
		server_name: String,

		/// Program to launch
		#[arg(long = "path")]
		executable_path: String,

		/// Whitespace-separated program arguments
		#[arg(long, default_value = "", allow_hyphen_values = true)]
		args: String,

		/// Whitespace-separated runtime arguments
		#[arg(long, default_value = "", allow_hyphen_values = true)]
		vm_args: String,

		/// Explicit server id
		#[arg(long)]
		id: Option<u32>,
	},

	/// Remove a server definition
	Unregister {
		/// Server id
		id: u32,
	},

	/// Print a server definition
	Get {
		/// Server id
		id: u32,
	},

	/// Print the id registered for an application name
	#[command(name = "getserverid")]
	GetServerId {
		/// Application name
		application_name: String,
	},

	/// List every registered server
	List,

	/// List registered application names
	#[command(name = "listappnames")]
	ListAppNames,

	/// List servers with a live process
	#[command(name = "listactive")]
	ListActive,

	/// Locate a server, launching it if needed
	Locate {
		/// Server id
		id: u32,

		/// Endpoint type
		#[arg(long = "type", default_value = CLEAR_TEXT_ENDPOINT)]
		endpoint_type: String,
	},

	/// Print the endpoints of one orb of a server
	#[command(name = "locateperorb")]
	LocatePerOrb {
		/// Server id
		id: u32,

		/// Orb id
		orb_id: String,
	},

	/// List the orb ids a running server announced
	#[command(name = "orblist")]
	OrbList {
		/// Server id
		id: u32,
	},

	/// Launch a server
	Activate {
		/// Server id
		id: u32,
	},

	/// Stop a server
	Shutdown {
		/// Server id
		id: u32,
	},

	/// Run a server's install hook
	Install {
		/// Server id
		id: u32,
	},

	/// Run a server's uninstall hook
	Uninstall {
		/// Server id
		id: u32,
	},
}

/// Runs one admin command against the daemon listening on `socket`.
pub async fn run(socket: &Path, command: AdminCommand) -> ClientResult<()> {
	let mut client = AdminClient::connect(socket).await?;

	match command {
		AdminCommand::Register {
			application_name,
			server_name,
			executable_path,
			args,
			vm_args,
			id,
		} => {
			let definition = ServerDefinition {
				application_name,
				server_name,
				executable_path,
				args,
				vm_args,
			};
			let server_id = client.register(definition, id.map(ServerId)).await?;
			println!("{server_id}");
		}
		AdminCommand::Unregister { id } => client.unregister(ServerId(id)).await?,
		AdminCommand::Get { id } => print_definition(ServerId(id), &client.get_server(ServerId(id)).await?),
		AdminCommand::GetServerId { application_name } => {
			println!("{}", client.get_server_id(&application_name).await?);
		}
		AdminCommand::List => {
			for entry in client.list_definitions().await? {
				let installed = if entry.installed { "installed" } else { "uninstalled" };
				println!(
					"{}\t{}\t{}\t{}\t{installed}",
					entry.server_id,
					entry.definition.application_name,
					entry.definition.server_name,
					entry.definition.executable_path,
				);
			}
		}
		AdminCommand::ListAppNames => {
			for name in client.list_application_names().await? {
				println!("{name}");
			}
		}
		AdminCommand::ListActive => {
			for server_id in client.list_active().await? {
				println!("{server_id}");
			}
		}
		AdminCommand::Locate { id, endpoint_type } => {
			let location = client.locate(ServerId(id), &endpoint_type).await?;
			println!("host\t{}", location.host);
			for info in location.ports {
				match info.port() {
					Some(port) => println!("{}\t{port}", info.orb_id),
					None => println!("{}\t-", info.orb_id),
				}
			}
		}
		AdminCommand::LocatePerOrb { id, orb_id } => {
			let location = client.locate_per_orb(ServerId(id), &orb_id).await?;
			println!("host\t{}", location.host);
			for endpoint in location.endpoints {
				println!("{}\t{}", endpoint.endpoint_type, endpoint.port);
			}
		}
		AdminCommand::OrbList { id } => {
			for orb_id in client.orb_ids(ServerId(id)).await? {
				println!("{orb_id}");
			}
		}
		AdminCommand::Activate { id } => client.activate(ServerId(id)).await?,
		AdminCommand::Shutdown { id } => client.shutdown(ServerId(id)).await?,
		AdminCommand::Install { id } => client.install(ServerId(id)).await?,
		AdminCommand::Uninstall { id } => client.uninstall(ServerId(id)).await?,
	}
	Ok(())
}

fn print_definition(server_id: ServerId, definition: &ServerDefinition) {
	println!("id\t{server_id}");
	println!("application\t{}", definition.application_name);
	println!("server\t{}", definition.server_name);
	println!("path\t{}", definition.executable_path);
	println!("args\t{}", definition.args);
	println!("vm_args\t{}", definition.vm_args);
}
