//! System V shared-memory emulation
//!
//! Clients allocate segments by size and receive small integer ids; a
//! segment's memory descriptor is passed over the socket on request so the
//! client can map it. The same [`SharedMemory`] table backs the audio
//! service's ring buffers.

mod memfd;
mod service;
mod table;

use std::io;

use thiserror::Error;

pub use memfd::create_memory_fd;
pub use service::{parse_request, request_codes, ShmRequest, ShmService, REQUEST_SIZE};
pub use table::{SegmentId, SharedMapping, SharedMemory};

/// Shared-memory errors
#[derive(Debug, Error)]
pub enum ShmError {
    /// No anonymous memory descriptor could be created
    #[error("Failed to create shared-memory descriptor: {0}")]
    Create(#[source] io::Error),

    /// The descriptor could not be sized
    #[error("Failed to size shared-memory descriptor to {size} bytes: {source}")]
    Resize {
        /// Requested size
        size: u64,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Every positive id has been handed out
    #[error("Shared-memory segment ids exhausted")]
    IdsExhausted,
}
