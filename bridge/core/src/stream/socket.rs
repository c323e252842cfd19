//! Connected Unix stream socket with descriptor passing
//!
//! Descriptors arriving as `SCM_RIGHTS` control data are queued per socket
//! in arrival order; handlers take them one at a time. Outgoing messages
//! may carry a single descriptor alongside their payload.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use nix::errno::Errno;
use parking_lot::Mutex;

/// Upper bound on descriptors accepted from a single receive
pub const MAX_ANCILLARY_FDS: usize = 32;

/// A connected client socket plus its queue of received descriptors
#[derive(Debug)]
pub struct ClientSocket {
    stream: UnixStream,
    ancillary_fds: Mutex<VecDeque<OwnedFd>>,
}

impl ClientSocket {
    /// Wrap a connected stream
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            ancillary_fds: Mutex::new(VecDeque::new()),
        }
    }

    /// The underlying stream
    #[must_use]
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Read available bytes into `buf`, retrying on interruption
    ///
    /// # Errors
    ///
    /// Returns the socket error; `Ok(0)` means the peer closed its end.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    /// Write the whole buffer
    ///
    /// # Errors
    ///
    /// Returns the socket error if the peer is gone.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(buf)
    }

    /// Receive bytes into `buf`, queueing any descriptors carried as
    /// control data
    ///
    /// # Errors
    ///
    /// Returns the socket error; `Ok(0)` means the peer closed its end.
    pub fn recv_with_fds(&self, buf: &mut [u8]) -> io::Result<usize> {
        let control_len = control_space(MAX_ANCILLARY_FDS);
        let mut control = vec![0u64; control_len.div_ceil(mem::size_of::<u64>())];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control_len as _;

        let received = loop {
            // SAFETY: msg points at the live iovec and control buffer above.
            let ret = unsafe {
                libc::recvmsg(self.stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC)
            };
            match Errno::result(ret) {
                Ok(n) => break n.unsigned_abs(),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        };

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            tracing::warn!(
                fd = self.stream.as_raw_fd(),
                "Ancillary data truncated; extra descriptors dropped by the kernel"
            );
        }
        self.queue_received_fds(&msg);
        Ok(received)
    }

    /// Send `data` with `fd` attached as `SCM_RIGHTS` control data
    ///
    /// The descriptor rides on the first byte; any payload the kernel does
    /// not accept in that call is written normally afterwards.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the peer is gone.
    pub fn send_with_fd(&self, data: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        let fd_len = mem::size_of::<libc::c_int>();
        let control_len = control_space(1);
        let mut control = vec![0u64; control_len.div_ceil(mem::size_of::<u64>())];
        let mut iov = libc::iovec {
            iov_base: data.as_ptr().cast_mut().cast(),
            iov_len: data.len(),
        };
        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control_len as _;

        // SAFETY: the control buffer holds CMSG_SPACE(sizeof(int)) aligned
        // bytes, so the first header and its data slot are in bounds.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len as libc::c_uint) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd.as_raw_fd());
        }

        let sent = loop {
            // SAFETY: msg points at the live iovec and control buffer above.
            let ret =
                unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            match Errno::result(ret) {
                Ok(n) => break n.unsigned_abs(),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        };

        if sent < data.len() {
            self.write_all(&data[sent..])?;
        }
        Ok(())
    }

    /// Take the oldest received descriptor, if any
    pub fn take_ancillary_fd(&self) -> Option<OwnedFd> {
        self.ancillary_fds.lock().pop_front()
    }

    /// Number of received descriptors not yet taken
    #[must_use]
    pub fn pending_ancillary_fds(&self) -> usize {
        self.ancillary_fds.lock().len()
    }

    /// Shut down both directions and drop queued descriptors
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.ancillary_fds.lock().clear();
    }

    fn queue_received_fds(&self, msg: &libc::msghdr) {
        let mut queue = self.ancillary_fds.lock();
        // SAFETY: msg was filled in by recvmsg and the CMSG_* walkers stay
        // within msg_controllen.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let header = libc::CMSG_LEN(0) as usize;
                    let payload = ((*cmsg).cmsg_len as usize).saturating_sub(header);
                    let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                    for i in 0..payload / mem::size_of::<libc::c_int>() {
                        let raw = ptr::read_unaligned(data.add(i));
                        queue.push_back(OwnedFd::from_raw_fd(raw));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(msg, cmsg);
            }
        }
    }
}

impl AsRawFd for ClientSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for ClientSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn control_space(fds: usize) -> usize {
    let bytes = fds * mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is pure arithmetic on its argument.
    unsafe { libc::CMSG_SPACE(bytes as libc::c_uint) as usize }
}
