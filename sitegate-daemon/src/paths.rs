use std::path::{Path, PathBuf};
use std::time::Duration;

pub use sitegate_core::store::{sitegate_root, storage_path_at as storage_path};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    sitegate_root(home).join(DAEMON_SOCKET)
}
