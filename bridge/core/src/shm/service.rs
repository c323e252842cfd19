//! Shared-memory request protocol
//!
//! Every request is exactly five bytes, little-endian:
//!
//! ```text
//! ┌────────┬───────────────────┐
//! │ code:1 │ argument:4        │
//! └────────┴───────────────────┘
//!
//! SHMGET  (0)  argument = size (u32)  → i32 segment id, or -1
//! GET_FD  (1)  argument = id   (i32)  → u8 0, descriptor attached on success
//! DELETE  (2)  argument = id   (i32)  → no response
//! ```
//!
//! Unknown codes are consumed and ignored.

use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use super::table::{SegmentId, SharedMemory};
use crate::broker::{Client, ConnectionHandler, RequestHandler};
use crate::stream::{ByteOrder, ByteReader, Parse};

/// Request codes
pub mod request_codes {
    /// Allocate a segment
    pub const SHMGET: u8 = 0;
    /// Fetch a segment's descriptor
    pub const GET_FD: u8 = 1;
    /// Delete a segment
    pub const DELETE: u8 = 2;
}

/// Size of every request on the wire
pub const REQUEST_SIZE: usize = 5;

/// A decoded shared-memory request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmRequest {
    /// Allocate a segment of `size` bytes
    Allocate {
        /// Requested size in bytes
        size: u32,
    },
    /// Send the descriptor of segment `id`
    GetDescriptor {
        /// Segment id
        id: SegmentId,
    },
    /// Delete segment `id`
    Delete {
        /// Segment id
        id: SegmentId,
    },
    /// Unrecognised code; consumed without effect
    Unknown(u8),
}

/// Decode one request from the front of `frame`
#[must_use]
pub fn parse_request(frame: &[u8]) -> Parse<ShmRequest> {
    let mut reader = ByteReader::new(frame, ByteOrder::Little);
    let (Some(code), Some(argument)) = (reader.read_u8(), reader.read_u32()) else {
        return Parse::NeedMoreBytes(REQUEST_SIZE - frame.len());
    };

    let request = match code {
        request_codes::SHMGET => ShmRequest::Allocate { size: argument },
        request_codes::GET_FD => ShmRequest::GetDescriptor {
            id: SegmentId::from_le_bytes(argument.to_le_bytes()),
        },
        request_codes::DELETE => ShmRequest::Delete {
            id: SegmentId::from_le_bytes(argument.to_le_bytes()),
        },
        other => ShmRequest::Unknown(other),
    };
    Parse::Complete {
        value: request,
        consumed: REQUEST_SIZE,
    }
}

/// Shared-memory service plugged into a broker
///
/// Segments are owned by the [`SharedMemory`] table, not by connections;
/// closing a connection leaves its segments in place.
#[derive(Debug, Clone)]
pub struct ShmService {
    memory: Arc<SharedMemory>,
}

impl ShmService {
    /// Serve requests against `memory`
    #[must_use]
    pub fn new(memory: Arc<SharedMemory>) -> Self {
        Self { memory }
    }

    /// The backing segment table
    #[must_use]
    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }
}

impl ConnectionHandler for ShmService {
    type Session = ();

    fn on_connection_established(&self, client: &mut Client<()>) {
        client.create_io_streams();
        client.set_session(());
    }

    fn on_connection_closing(&self, _client: &mut Client<()>) {}
}

impl RequestHandler<()> for ShmService {
    fn try_handle_one_request(&self, client: &mut Client<()>) -> io::Result<bool> {
        let Some(input) = client.input_mut() else {
            return Ok(false);
        };
        let (request, consumed) = match parse_request(input.frame()) {
            Parse::Complete { value, consumed } => (value, consumed),
            Parse::NeedMoreBytes(_) => return Ok(false),
        };
        input.consume(consumed);

        let Some(output) = client.output() else {
            return Ok(true);
        };

        match request {
            ShmRequest::Allocate { size } => {
                let id = match self.memory.allocate(u64::from(size)) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(client_id = %client.id(), size, error = %e, "Segment allocation failed");
                        -1
                    }
                };
                let mut lock = output.lock();
                lock.write_i32(id);
                lock.flush()?;
            }
            ShmRequest::GetDescriptor { id } => {
                let descriptor = self.memory.descriptor(id);
                if descriptor.is_none() {
                    debug!(client_id = %client.id(), segment_id = id, "Descriptor requested for unknown segment");
                }
                let mut lock = output.lock();
                lock.write_u8(0);
                if let Some(fd) = descriptor {
                    lock.attach_fd(fd);
                }
                lock.flush()?;
            }
            ShmRequest::Delete { id } => {
                self.memory.delete(id);
            }
            ShmRequest::Unknown(code) => {
                debug!(client_id = %client.id(), code, "Ignoring unknown shared-memory request");
            }
        }
        Ok(true)
    }
}
