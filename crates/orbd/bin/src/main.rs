//! orbd binary.
//!
//! `orbd serve` runs the activation daemon. Every other subcommand is an
//! administrative request sent to a running daemon over its control socket.

mod admin;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use orbd::{ActivationManager, DaemonConfig, OsLauncher, ServerRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "orbd")]
#[command(about = "On-demand server activation daemon")]
struct Args {
	/// Socket path for IPC
	#[arg(short, long, value_name = "PATH", global = true)]
	socket: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the activation daemon
	Serve {
		/// Configuration file
		#[arg(short, long, value_name = "FILE")]
		config: Option<PathBuf>,

		/// Directory for the registry store and server logs
		#[arg(long, value_name = "DIR")]
		data_dir: Option<PathBuf>,

		/// Verbose logging
		#[arg(short, long)]
		verbose: bool,
	},

	#[command(flatten)]
	Admin(admin::AdminCommand),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	match args.command {
		Command::Serve {
			config,
			data_dir,
			verbose,
		} => {
			setup_tracing(verbose);
			serve(args.socket, config, data_dir).await
		}
		Command::Admin(command) => {
			setup_tracing(false);
			let socket = args.socket.unwrap_or_else(orbd_proto::paths::default_socket_path);
			admin::run(&socket, command).await?;
			Ok(())
		}
	}
}

async fn serve(
	socket: Option<PathBuf>,
	config_path: Option<PathBuf>,
	data_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
	info!("starting orbd");

	let mut config = match &config_path {
		Some(path) => DaemonConfig::load(path)?,
		None => DaemonConfig::default(),
	};
	if let Some(socket) = socket {
		config.socket_path = socket;
	}
	if let Some(data_dir) = data_dir {
		config.data_dir = data_dir;
	}
	let config = Arc::new(config);

	let registry = Arc::new(ServerRegistry::open(config.registry_path())?);
	let manager = ActivationManager::new(registry, config.clone(), Arc::new(OsLauncher::new()));

	let installed = manager.install_system_servers();
	info!(
		installed,
		configured = config.system_servers.len(),
		"system servers installed"
	);

	let shutdown = CancellationToken::new();
	tokio::spawn(cancel_on_signal(shutdown.clone()));

	info!(socket = %config.socket_path.display(), "starting IPC server");
	orbd::ipc::serve(&config.socket_path, manager, shutdown).await?;

	info!("orbd stopped");
	Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
	use tokio::signal::unix::{SignalKind, signal};

	let mut terminate = match signal(SignalKind::terminate()) {
		Ok(stream) => Some(stream),
		Err(error) => {
			warn!(%error, "cannot install SIGTERM handler");
			None
		}
	};

	let terminated = async {
		match terminate.as_mut() {
			Some(stream) => {
				stream.recv().await;
			}
			None => std::future::pending::<()>().await,
		}
	};

	let interrupted = async {
		if let Err(error) = tokio::signal::ctrl_c().await {
			warn!(%error, "cannot listen for interrupts");
			std::future::pending::<()>().await;
		}
	};

	tokio::select! {
		() = interrupted => info!("interrupt received"),
		() = terminated => info!("terminate received"),
	}
	shutdown.cancel();
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	// ORBD_LOG_DIR switches to a per-process log file
	if let Some(log_dir) = std::env::var_os("ORBD_LOG_DIR").map(PathBuf::from) {
		let pid = std::process::id();
		let log_path = log_dir.join(format!("orbd.{pid}.log"));
		let file = std::fs::create_dir_all(&log_dir)
			.and_then(|()| OpenOptions::new().create(true).append(true).open(&log_path));

		if let Ok(file) = file {
			let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
				if verbose {
					EnvFilter::new("orbd=trace,debug")
				} else {
					EnvFilter::new("orbd=debug,info")
				}
			});

			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry().with(filter).with(file_layer).init();

			tracing::info!(path = ?log_path, "orbd tracing initialized");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_max_level(if verbose {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.init();
}
