use std::path::{Path, PathBuf};

use apqp_core::paths::apqp_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    apqp_root(home).join(DAEMON_SOCKET)
}
