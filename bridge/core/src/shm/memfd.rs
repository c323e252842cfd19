//! Anonymous shareable memory descriptors

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use tracing::debug;

use super::ShmError;

/// Create an anonymous memory descriptor of exactly `size` bytes
///
/// Prefers `memfd_create`; falls back to an immediately unlinked POSIX
/// shared-memory object where memfd is unavailable.
///
/// # Errors
///
/// Returns an error if no descriptor can be created or sized.
pub fn create_memory_fd(name: &str, size: u64) -> Result<OwnedFd, ShmError> {
    let fd = match memfd(name) {
        Ok(fd) => fd,
        Err(e) => {
            debug!(error = %e, "memfd_create unavailable; falling back to shm_open");
            posix_shm(name).map_err(ShmError::Create)?
        }
    };

    let file = File::from(fd);
    file.set_len(size)
        .map_err(|source| ShmError::Resize { size, source })?;
    Ok(OwnedFd::from(file))
}

fn memfd(name: &str) -> io::Result<OwnedFd> {
    let name = CString::new(name)?;
    // SAFETY: name is a valid NUL-terminated string.
    let raw = Errno::result(unsafe {
        libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
    })?;
    // SAFETY: raw is a freshly created descriptor we exclusively own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn posix_shm(name: &str) -> io::Result<OwnedFd> {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let unique = format!(
        "/hostbridge-{}-{}-{}",
        process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed),
        name
    );
    let path = CString::new(unique)?;
    // SAFETY: path is a valid NUL-terminated string.
    let raw = Errno::result(unsafe {
        libc::shm_open(
            path.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
            0o600 as libc::mode_t,
        )
    })?;
    // SAFETY: raw is a freshly created descriptor we exclusively own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // SAFETY: path is a valid NUL-terminated string.
    unsafe { libc::shm_unlink(path.as_ptr()) };
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_has_requested_size() {
        let fd = create_memory_fd("test-segment", 8192).unwrap();
        assert_eq!(File::from(fd).metadata().unwrap().len(), 8192);
    }

    #[test]
    fn test_zero_size_is_allowed() {
        let fd = create_memory_fd("empty", 0).unwrap();
        assert_eq!(File::from(fd).metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_posix_fallback_creates_unlinked_object() {
        let fd = posix_shm("fallback").unwrap();
        let file = File::from(fd);
        file.set_len(64).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 64);
    }
}
