//! Guest command wire format
//!
//! ```text
//! ┌──────────┬───────────┬─────────────────────────┐
//! │ opcode:1 │ length:4  │ payload:length          │
//! └──────────┴───────────┴─────────────────────────┘
//! ```
//!
//! All integers are little-endian. `length` counts payload bytes only.

use std::io::{self, Read, Write};
use std::net::TcpStream;

/// Guest opcodes
pub mod opcodes {
    /// Launch a program
    pub const EXEC: u8 = 1;
    /// Terminate processes by image name
    pub const KILL_PROCESS: u8 = 2;
    /// List running processes
    pub const GET_PROCESSES: u8 = 3;
    /// Pin a process to a CPU set
    pub const SET_PROCESS_AFFINITY: u8 = 4;
    /// Inject pointer input
    pub const MOUSE_EVENT: u8 = 5;
}

/// Size of a GET_PROCESSES response header: success byte plus length
pub const PROCESS_RESPONSE_HEADER: usize = 5;

struct CommandFrame {
    bytes: Vec<u8>,
}

impl CommandFrame {
    fn new(opcode: u8) -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.push(opcode);
        bytes.extend_from_slice(&[0; 4]);
        Self { bytes }
    }

    fn put_i32(mut self, value: i32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn put_u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn put_i16(mut self, value: i16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn put_len(self, len: usize) -> Self {
        self.put_u32(u32::try_from(len).unwrap_or(u32::MAX))
    }

    fn put_bytes(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let payload = u32::try_from(self.bytes.len() - 5).unwrap_or(u32::MAX);
        self.bytes[1..5].copy_from_slice(&payload.to_le_bytes());
        self.bytes
    }
}

/// Split a command line into program and arguments at the first space
///
/// Surrounding whitespace is trimmed first; returns `None` for a blank
/// command.
#[must_use]
pub fn split_command(command: &str) -> Option<(&str, &str)> {
    let command = command.trim();
    if command.is_empty() {
        return None;
    }
    Some(command.split_once(' ').unwrap_or((command, "")))
}

/// EXEC: program length, arguments length, program, arguments
#[must_use]
pub fn encode_exec(program: &str, arguments: &str) -> Vec<u8> {
    CommandFrame::new(opcodes::EXEC)
        .put_len(program.len())
        .put_len(arguments.len())
        .put_bytes(program.as_bytes())
        .put_bytes(arguments.as_bytes())
        .finish()
}

/// KILL_PROCESS: the image name
#[must_use]
pub fn encode_kill_process(name: &str) -> Vec<u8> {
    CommandFrame::new(opcodes::KILL_PROCESS)
        .put_bytes(name.as_bytes())
        .finish()
}

/// GET_PROCESSES: no payload
#[must_use]
pub fn encode_get_processes() -> Vec<u8> {
    CommandFrame::new(opcodes::GET_PROCESSES).finish()
}

/// SET_PROCESS_AFFINITY: pid, mask
#[must_use]
pub fn encode_set_process_affinity(pid: i32, mask: u32) -> Vec<u8> {
    CommandFrame::new(opcodes::SET_PROCESS_AFFINITY)
        .put_i32(pid)
        .put_u32(mask)
        .finish()
}

/// MOUSE_EVENT: flags, dx, dy, wheel delta
#[must_use]
pub fn encode_mouse_event(flags: u32, dx: i16, dy: i16, wheel_delta: i16) -> Vec<u8> {
    CommandFrame::new(opcodes::MOUSE_EVENT)
        .put_u32(flags)
        .put_i16(dx)
        .put_i16(dy)
        .put_i16(wheel_delta)
        .finish()
}

/// Live connection to the guest agent, handed to queued commands
#[derive(Debug)]
pub struct GuestLink {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl GuestLink {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(128),
        }
    }

    /// Write a fully encoded command
    ///
    /// # Errors
    ///
    /// Returns the socket error; the channel then reconnects.
    pub fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()
    }

    /// Read exactly `len` response bytes
    ///
    /// # Errors
    ///
    /// Returns the socket error, including a timeout or early close.
    pub fn receive(&mut self, len: usize) -> io::Result<&[u8]> {
        self.buffer.clear();
        self.buffer.resize(len, 0);
        self.stream.read_exact(&mut self.buffer)?;
        Ok(&self.buffer)
    }

    /// Read and drop `len` response bytes without buffering them
    ///
    /// # Errors
    ///
    /// Returns the socket error, or `UnexpectedEof` if the agent closes
    /// first.
    pub fn discard(&mut self, len: usize) -> io::Result<()> {
        let len = u64::try_from(len).unwrap_or(u64::MAX);
        let copied = io::copy(&mut (&mut self.stream).take(len), &mut io::sink())?;
        if copied < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "guest agent closed mid-response",
            ));
        }
        Ok(())
    }

    /// Whether the agent has closed its end
    ///
    /// Peeks without blocking; unread bytes count as a live peer.
    pub(crate) fn peer_closed(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut scratch = [0u8; 1];
        let closed = match self.stream.peek(&mut scratch) {
            Ok(n) => n == 0,
            Err(e) => e.kind() != io::ErrorKind::WouldBlock,
        };
        self.stream.set_nonblocking(false).is_err() || closed
    }
}
