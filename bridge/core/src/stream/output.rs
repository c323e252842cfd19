//! Lock-scoped output buffer
//!
//! Responses are staged under the stream lock and written to the socket in
//! one flush, so concurrent writers never interleave partial responses.
//! A descriptor attached to the pending flush is sent as control data on
//! the same message as the staged bytes.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::reader::ByteOrder;
use super::socket::ClientSocket;

/// Per-connection output stream
#[derive(Debug)]
pub struct OutputStream {
    socket: Arc<ClientSocket>,
    state: Mutex<OutputBuffer>,
}

#[derive(Debug)]
struct OutputBuffer {
    bytes: Vec<u8>,
    order: ByteOrder,
    attached: Option<OwnedFd>,
}

impl OutputStream {
    /// Create a stream writing to `socket`
    #[must_use]
    pub fn new(socket: Arc<ClientSocket>, initial_capacity: usize) -> Self {
        Self {
            socket,
            state: Mutex::new(OutputBuffer {
                bytes: Vec::with_capacity(initial_capacity),
                order: ByteOrder::default(),
                attached: None,
            }),
        }
    }

    /// Change the byte order for subsequent writes
    pub fn set_byte_order(&self, order: ByteOrder) {
        self.state.lock().order = order;
    }

    /// Acquire exclusive access for staging one response
    ///
    /// The staged bytes are flushed when the guard is released, either
    /// explicitly through [`OutputLock::flush`] or on drop.
    pub fn lock(&self) -> OutputLock<'_> {
        OutputLock {
            socket: &self.socket,
            buffer: self.state.lock(),
            flushed: false,
        }
    }
}

/// Exclusive staging access to an [`OutputStream`]
pub struct OutputLock<'a> {
    socket: &'a ClientSocket,
    buffer: MutexGuard<'a, OutputBuffer>,
    flushed: bool,
}

impl OutputLock<'_> {
    /// Stage an unsigned byte
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.bytes.push(value);
    }

    /// Stage a signed 16-bit integer
    pub fn write_i16(&mut self, value: i16) {
        let raw = match self.buffer.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buffer.bytes.extend_from_slice(&raw);
    }

    /// Stage a signed 32-bit integer
    pub fn write_i32(&mut self, value: i32) {
        let raw = match self.buffer.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buffer.bytes.extend_from_slice(&raw);
    }

    /// Stage an unsigned 32-bit integer
    pub fn write_u32(&mut self, value: u32) {
        let raw = match self.buffer.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buffer.bytes.extend_from_slice(&raw);
    }

    /// Stage raw bytes
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.bytes.extend_from_slice(data);
    }

    /// Attach a descriptor to the pending flush
    ///
    /// # Panics
    ///
    /// Panics if a descriptor is already attached; each flush carries at
    /// most one.
    pub fn attach_fd(&mut self, fd: OwnedFd) {
        assert!(
            self.buffer.attached.is_none(),
            "a descriptor is already attached to the pending flush"
        );
        self.buffer.attached = Some(fd);
    }

    /// Bytes staged so far
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.bytes.len()
    }

    /// Write the staged bytes (and attached descriptor) and release the lock
    ///
    /// # Errors
    ///
    /// Returns the socket error if the peer is gone.
    pub fn flush(mut self) -> io::Result<()> {
        self.flushed = true;
        self.write_pending()
    }

    fn write_pending(&mut self) -> io::Result<()> {
        let buffer = &mut *self.buffer;
        let attached = buffer.attached.take();
        if buffer.bytes.is_empty() {
            if attached.is_some() {
                tracing::debug!("Dropping descriptor attached to an empty flush");
            }
            return Ok(());
        }

        let result = match attached {
            Some(fd) => self.socket.send_with_fd(&buffer.bytes, fd.as_fd()),
            None => self.socket.write_all(&buffer.bytes),
        };
        buffer.bytes.clear();
        result
    }
}

impl Drop for OutputLock<'_> {
    fn drop(&mut self) {
        if !self.flushed {
            if let Err(e) = self.write_pending() {
                tracing::warn!(error = %e, "Flush on release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn stream_pair() -> (OutputStream, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (OutputStream::new(Arc::new(ClientSocket::new(ours)), 4), theirs)
    }

    #[test]
    fn test_flush_writes_staged_bytes_little_endian() {
        let (output, mut peer) = stream_pair();
        let mut lock = output.lock();
        lock.write_u8(0);
        lock.write_i32(1024);
        lock.write_i16(-1);
        assert_eq!(lock.pending(), 7);
        lock.flush().unwrap();

        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 4, 0, 0, 0xFF, 0xFF]);
    }

    #[test]
    fn test_release_flushes() {
        let (output, mut peer) = stream_pair();
        {
            let mut lock = output.lock();
            lock.write_bytes(b"abcdefgh");
        }

        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn test_big_endian_writes() {
        let (output, mut peer) = stream_pair();
        output.set_byte_order(ByteOrder::Big);
        let mut lock = output.lock();
        lock.write_u32(1);
        lock.flush().unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 1]);
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_second_attachment_panics() {
        let (output, _peer) = stream_pair();
        let mut lock = output.lock();
        lock.attach_fd(tempfile::tempfile().unwrap().into());
        lock.attach_fd(tempfile::tempfile().unwrap().into());
    }
}
