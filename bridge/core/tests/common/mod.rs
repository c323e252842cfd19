//! Shared helpers for the socket-level tests

#![allow(dead_code)]

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use hostbridge_core::ClientSocket;

/// Upper bound on any single wait in these tests
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `DEADLINE` passes
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Connect to a broker socket with a read timeout so a missing response
/// fails the test instead of hanging it
pub fn connect(path: &Path) -> ClientSocket {
    let stream = UnixStream::connect(path).expect("connect to broker socket");
    stream
        .set_read_timeout(Some(DEADLINE))
        .expect("set read timeout");
    ClientSocket::new(stream)
}

/// Receive exactly `len` bytes, queueing any descriptors that arrive with
/// them on `socket`
pub fn receive(socket: &ClientSocket, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = socket
            .recv_with_fds(&mut buf[filled..])
            .expect("receive response");
        assert_ne!(n, 0, "broker closed the connection early");
        filled += n;
    }
    buf
}

/// Five-byte request header: code then little-endian length
pub fn header(code: u8, length: i32) -> Vec<u8> {
    let mut bytes = vec![code];
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes
}

/// Send `bytes` one at a time with a short pause between them
pub fn send_byte_by_byte(socket: &ClientSocket, bytes: &[u8]) {
    for byte in bytes {
        socket.write_all(&[*byte]).expect("send byte");
        thread::sleep(Duration::from_millis(1));
    }
}
