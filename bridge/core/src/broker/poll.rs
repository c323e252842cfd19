//! Readiness primitives: epoll set, eventfd wakeups and a two-descriptor
//! poll used by per-connection service threads.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use nix::errno::Errno;

/// Epoll set keyed by caller-chosen tokens
#[derive(Debug)]
pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 has no memory-safety preconditions.
        let raw = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: raw is a freshly created descriptor we exclusively own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Register `fd` for readability, reporting `token` when ready
    pub(crate) fn add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: event is a valid epoll_event for the duration of the call.
        Errno::result(unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: EPOLL_CTL_DEL ignores the event pointer.
        Errno::result(unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Block until at least one registered descriptor is ready
    ///
    /// An interrupted wait reports zero events.
    pub(crate) fn wait(&self, events: &mut [libc::epoll_event]) -> io::Result<usize> {
        let capacity = libc::c_int::try_from(events.len()).unwrap_or(libc::c_int::MAX);
        // SAFETY: events is a writable slice of at least `capacity` entries.
        let ret =
            unsafe { libc::epoll_wait(self.fd.as_raw_fd(), events.as_mut_ptr(), capacity, -1) };
        match Errno::result(ret) {
            Ok(n) => Ok(n.unsigned_abs() as usize),
            Err(Errno::EINTR) => Ok(0),
            Err(errno) => Err(errno.into()),
        }
    }
}

/// Non-blocking eventfd used to wake a blocked loop
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no memory-safety preconditions.
        let raw = Errno::result(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: raw is a freshly created descriptor we exclusively own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Make the descriptor readable
    pub(crate) fn signal(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes exactly the 8 bytes of `one`.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                ptr::addr_of!(one).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            // A saturated counter is already readable.
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Outcome of waiting on a connection alongside its wakeup descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// The connection has data, hung up or errored
    Readable,
    /// The wakeup descriptor fired
    Shutdown,
}

/// Block until `client` is readable or `wakeup` is signalled
///
/// Shutdown wins when both are ready.
pub(crate) fn wait_readable(client: RawFd, wakeup: RawFd) -> io::Result<Readiness> {
    loop {
        let mut fds = [
            libc::pollfd {
                fd: client,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wakeup,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: fds is a valid array of two pollfd entries.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        match Errno::result(ret) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }

        if fds[1].revents != 0 {
            return Ok(Readiness::Shutdown);
        }
        if fds[0].revents != 0 {
            return Ok(Readiness::Readable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_epoll_reports_token() {
        let epoll = Epoll::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        epoll.add(reader.as_raw_fd(), 42).unwrap();

        writer.write_all(&[1]).unwrap();
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let ready = epoll.wait(&mut events).unwrap();
        assert_eq!(ready, 1);
        let token = events[0].u64;
        assert_eq!(token, 42);

        epoll.delete(reader.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_wakeup_takes_priority() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let wakeup = EventFd::new().unwrap();

        writer.write_all(&[1]).unwrap();
        assert_eq!(
            wait_readable(reader.as_raw_fd(), wakeup.as_raw_fd()).unwrap(),
            Readiness::Readable
        );

        wakeup.signal().unwrap();
        assert_eq!(
            wait_readable(reader.as_raw_fd(), wakeup.as_raw_fd()).unwrap(),
            Readiness::Shutdown
        );
    }
}
