//! Default locations for the daemon's socket and data directory.

use std::path::PathBuf;

/// Returns the default control socket path.
///
/// # Resolution Order
///
/// 1. `ORBD_SOCKET` environment variable.
/// 2. System runtime directory (e.g., `$XDG_RUNTIME_DIR`).
/// 3. System temp directory (e.g., `/tmp`).
#[must_use]
pub fn default_socket_path() -> PathBuf {
	if let Ok(p) = std::env::var("ORBD_SOCKET") {
		return PathBuf::from(p);
	}

	dirs::runtime_dir()
		.filter(|p| std::fs::create_dir_all(p).is_ok())
		.unwrap_or_else(std::env::temp_dir)
		.join("orbd.sock")
}

/// Returns the default data directory holding the server registry.
#[must_use]
pub fn default_data_dir() -> PathBuf {
	dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("orbd")
}
