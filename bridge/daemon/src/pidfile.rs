//! PID file handling
//!
//! One daemon per runtime root: the PID file lives next to the sockets and
//! a second daemon refuses to start while the recorded process is alive.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

/// PID file name inside the runtime root
pub const PID_FILE_NAME: &str = "hostbridge.pid";

/// PID file location for a runtime root
pub fn pid_path(root_dir: &Path) -> PathBuf {
    root_dir.join(PID_FILE_NAME)
}

/// Whether a process with this id exists
fn process_alive(pid: i32) -> bool {
    // Signal 0 performs the permission and existence checks only
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Fail if another daemon owns `path`; remove the file if it is stale
pub fn check_existing_daemon(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read PID file: {}", path.display()))?;

    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 && process_alive(pid) => {
            anyhow::bail!(
                "Another hostbridge-daemon is already running (PID: {pid}). \
                 Stop it first or remove {} if it's stale.",
                path.display()
            );
        }
        Ok(pid) => warn!(pid, "Removing stale PID file"),
        Err(_) => warn!(path = %path.display(), "Removing unreadable PID file"),
    }

    fs::remove_file(path)
        .with_context(|| format!("Failed to remove stale PID file: {}", path.display()))?;
    Ok(())
}

/// Record this process in `path`
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {}", parent.display()))?;
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create PID file: {}", path.display()))?;
    writeln!(file, "{pid}")?;

    info!(pid, path = %path.display(), "PID file created");
    Ok(())
}

/// Remove `path` if present
pub fn remove_pid_file(path: &Path) {
    if !path.exists() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "PID file removed"),
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove PID file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(&dir.path().join("nested"));

        write_pid_file(&path).unwrap();
        let recorded = fs::read_to_string(&path).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_process_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(dir.path());
        write_pid_file(&path).unwrap();

        assert!(check_existing_daemon(&path).is_err());
        assert!(path.exists());
    }

    #[test]
    fn test_stale_pid_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(dir.path());
        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();

        check_existing_daemon(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_garbage_pid_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(dir.path());
        fs::write(&path, "not a pid").unwrap();

        check_existing_daemon(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_pid_file_ok() {
        let dir = tempfile::tempdir().unwrap();
        check_existing_daemon(&pid_path(dir.path())).unwrap();
    }
}
