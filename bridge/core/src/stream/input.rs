//! Growable input buffer with a movable frame view
//!
//! ```text
//!   buffer: [ consumed | frame (unconsumed) | free ]
//!           0        start              end      capacity
//! ```
//!
//! `read_more` compacts the frame to the front before reading, doubles the
//! capacity when no free space is left, then appends whatever the socket
//! yields. Unconsumed bytes always survive compaction and growth.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use super::reader::{ByteOrder, ByteReader};
use super::socket::ClientSocket;

/// Per-connection input stream
#[derive(Debug)]
pub struct InputStream {
    socket: Arc<ClientSocket>,
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    order: ByteOrder,
}

impl InputStream {
    /// Create a stream reading from `socket` with the given starting capacity
    #[must_use]
    pub fn new(socket: Arc<ClientSocket>, initial_capacity: usize) -> Self {
        Self {
            socket,
            buffer: vec![0; initial_capacity.max(1)],
            start: 0,
            end: 0,
            order: ByteOrder::default(),
        }
    }

    /// Pull more bytes from the socket into the buffer
    ///
    /// With `receive_ancillary` set, descriptors carried as control data are
    /// queued on the socket.
    ///
    /// # Errors
    ///
    /// Returns the socket error; `Ok(0)` means the peer closed its end.
    pub fn read_more(&mut self, receive_ancillary: bool) -> io::Result<usize> {
        self.compact();
        if self.end == self.buffer.len() {
            let grown = self.buffer.len() * 2;
            self.buffer.resize(grown, 0);
        }

        let free = &mut self.buffer[self.end..];
        let read = if receive_ancillary {
            self.socket.recv_with_fds(free)?
        } else {
            self.socket.read(free)?
        };
        self.end += read;
        Ok(read)
    }

    /// Unconsumed bytes
    #[must_use]
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    /// The unconsumed bytes themselves
    #[must_use]
    pub fn frame(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    /// Cursor over the unconsumed bytes in this stream's byte order
    #[must_use]
    pub fn reader(&self) -> ByteReader<'_> {
        ByteReader::new(self.frame(), self.order)
    }

    /// Mark `len` bytes at the front of the frame as consumed
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`available`](Self::available).
    pub fn consume(&mut self, len: usize) {
        assert!(
            len <= self.available(),
            "consumed {len} bytes with only {} available",
            self.available()
        );
        self.start += len;
    }

    /// Offset of the frame start within the buffer
    #[must_use]
    pub fn position(&self) -> usize {
        self.start
    }

    /// Move the frame start to an offset previously returned by
    /// [`position`](Self::position)
    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.end);
        self.start = position.min(self.end);
    }

    /// Current buffer capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Byte order used by [`reader`](Self::reader)
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Change the byte order used by [`reader`](Self::reader)
    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Take the oldest descriptor received on this stream's socket
    pub fn take_ancillary_fd(&self) -> Option<OwnedFd> {
        self.socket.take_ancillary_fd()
    }

    fn compact(&mut self) {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}
