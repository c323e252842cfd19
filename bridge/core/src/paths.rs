//! Socket locations
//!
//! # Layout
//!
//! All sockets live under one runtime root:
//!
//! ```text
//! $XDG_RUNTIME_DIR/hostbridge/      (fallback: /tmp/hostbridge-$UID/)
//! ├── .sound/AS0                    audio service
//! ├── .sysvshm/SM0                  shared-memory service
//! └── .X11-unix/X0                  reserved for the display server
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Audio service socket, relative to the runtime root
pub const AUDIO_SOCKET: &str = ".sound/AS0";

/// Shared-memory service socket, relative to the runtime root
pub const SHM_SOCKET: &str = ".sysvshm/SM0";

/// Display server socket, relative to the runtime root
pub const X11_SOCKET: &str = ".X11-unix/X0";

/// Default runtime root
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/hostbridge-$UID`.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime_dir) => runtime_dir.join("hostbridge"),
        None => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/hostbridge-{uid}"))
        }
    }
}

/// Join a relative socket name onto a runtime root
#[must_use]
pub fn socket_path(root: &Path, relative: &str) -> PathBuf {
    root.join(relative)
}

/// Make `path` bindable: create its parent directory and remove a stale
/// socket file left behind by a previous run
///
/// # Errors
///
/// Returns the filesystem error if the directory cannot be created or the
/// stale file cannot be removed.
pub fn prepare_socket_path(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            info!(path = %parent.display(), "Created socket directory");
        }
    }

    match fs::symlink_metadata(path) {
        Ok(_) => {
            warn!(path = %path.display(), "Removing stale socket file");
            fs::remove_file(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_socket_path_joins_relative_name() {
        let root = Path::new("/run/user/1000/hostbridge");
        assert_eq!(
            socket_path(root, AUDIO_SOCKET),
            PathBuf::from("/run/user/1000/hostbridge/.sound/AS0")
        );
    }

    #[test]
    fn test_prepare_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = socket_path(dir.path(), SHM_SOCKET);

        prepare_socket_path(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(!path.exists());
    }

    #[test]
    fn test_prepare_removes_stale_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"").unwrap();

        prepare_socket_path(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_default_runtime_dir_is_namespaced() {
        assert!(default_runtime_dir().to_string_lossy().contains("hostbridge"));
    }
}
