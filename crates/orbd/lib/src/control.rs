//! Lifecycle hooks the daemon invokes on a running server process.

use async_trait::async_trait;

/// Control channel to a launched server, registered through its callback.
///
/// Errors are the server's own failure messages.
#[async_trait]
pub trait ServerControl: Send + Sync + 'static {
	/// Runs the server's install hook.
	async fn install(&self) -> Result<(), String>;

	/// Runs the server's uninstall hook.
	async fn uninstall(&self) -> Result<(), String>;

	/// Asks the server to shut down cleanly.
	async fn shutdown(&self) -> Result<(), String>;
}

/// Scripted control channel for tests.
#[doc(hidden)]
pub mod test_helpers {
	use orbd_proto::ControlCommand;
	use parking_lot::Mutex;

	use super::*;

	/// Records every command and answers with a configurable result.
	#[derive(Default)]
	pub struct RecordingControl {
		calls: Mutex<Vec<ControlCommand>>,
		failure: Mutex<Option<String>>,
	}

	impl RecordingControl {
		/// Creates a control channel whose hooks succeed.
		#[must_use]
		pub fn new() -> Self {
			Self::default()
		}

		/// Makes every subsequent hook fail with `message`.
		pub fn fail_with(&self, message: &str) {
			*self.failure.lock() = Some(message.to_string());
		}

		/// Commands received so far.
		pub fn calls(&self) -> Vec<ControlCommand> {
			self.calls.lock().clone()
		}

		fn answer(&self, command: ControlCommand) -> Result<(), String> {
			self.calls.lock().push(command);
			match self.failure.lock().clone() {
				Some(message) => Err(message),
				None => Ok(()),
			}
		}
	}

	#[async_trait]
	impl ServerControl for RecordingControl {
		async fn install(&self) -> Result<(), String> {
			self.answer(ControlCommand::Install)
		}

		async fn uninstall(&self) -> Result<(), String> {
			self.answer(ControlCommand::Uninstall)
		}

		async fn shutdown(&self) -> Result<(), String> {
			self.answer(ControlCommand::Shutdown)
		}
	}
}
